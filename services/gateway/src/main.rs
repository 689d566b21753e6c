// Cascata gateway
// ---------------
// One process mediating every data-plane request for N tenant databases:
// tenant resolution, policy enforcement, PostgREST-style CRUD, realtime
// fan-out over SSE, and the durable webhook/push job engine.
//
// Boot order matters: configuration, observability, control store (with
// migrations), Redis, shared state, background workers, then the HTTP
// listener. SERVICE_MODE narrows what a replica runs (API, CONTROL_PLANE,
// WORKER); the default runs everything, which is what development wants.
//
// Shutdown is a 10-second drain: stop accepting, signal the workers, close
// realtime listeners, then close every tenant pool. Exceeding the deadline
// exits 1 so the orchestrator knows the drain was forced.

use anyhow::Context;
use cascata_gateway::{app, config::GatewayConfig, observability};
use std::time::Duration;
use tracing::{error, info};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    let config = match GatewayConfig::from_env_or_yaml() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return 1;
        }
    };
    let metrics_handle = observability::init_observability();

    info!(
        mode = ?config.service_mode,
        bind = %config.bind_addr,
        control_db = %config.control_db,
        storage_root = %config.storage_root.as_deref().unwrap_or("<unset>"),
        qdrant = %config.qdrant_host.as_deref().unwrap_or("<unset>"),
        "cascata gateway starting"
    );

    let metrics_bind = config.metrics_bind;
    let bind_addr = config.bind_addr;
    let serves_http = config.service_mode.serves_http();

    let (state, background) = match app::build_state(config).await {
        Ok(built) => built,
        Err(err) => {
            error!(error = ?err, "boot failed");
            return 1;
        }
    };

    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            error!(error = %err, "metrics endpoint failed");
        }
    });

    let exit = if serves_http {
        match serve(state.clone(), bind_addr).await {
            Ok(()) => 0,
            Err(err) => {
                error!(error = ?err, "server failed");
                1
            }
        }
    } else {
        // Worker-only replica: park until a signal arrives.
        shutdown_signal().await;
        0
    };

    info!("draining");
    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, app::drain(&state, &background)).await;
    match drained {
        Ok(()) => {
            info!("shutdown complete");
            exit
        }
        Err(_) => {
            error!("drain exceeded {}s deadline", SHUTDOWN_DEADLINE.as_secs());
            1
        }
    }
}

async fn serve(state: app::AppState, bind_addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = app::build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!(addr = %bind_addr, "HTTP server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

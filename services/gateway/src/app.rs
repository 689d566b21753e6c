//! Gateway application wiring.
//!
//! # Purpose
//! Builds the shared application state, composes the routers with the
//! ordered middleware chain, and owns the background pieces (pool reaper,
//! event dispatcher, queue workers). `main` stays a thin boot narrative.

use crate::api;
use crate::api::openapi::ApiDoc;
use crate::config::{GatewayConfig, ServiceMode, StoreBackend};
use crate::crypto::SecretBox;
use crate::directory::TenantDirectory;
use crate::jobs::QueueSet;
use crate::limits::{MemoryRateStore, RateStore, RedisRateStore};
use crate::pipeline;
use crate::realtime::RealtimeBridge;
use crate::rules::EventDispatcher;
use crate::store::memory::InMemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::ControlStore;
use anyhow::{Context, Result};
use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use cascata_jobs::{ShutdownHandle, ShutdownSignal};
use cascata_pool::PoolRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn ControlStore>,
    pub directory: Arc<TenantDirectory>,
    pub registry: Arc<PoolRegistry>,
    pub rate: Arc<dyn RateStore>,
    pub bridge: Arc<RealtimeBridge>,
    pub queues: Option<Arc<QueueSet>>,
}

/// Background pieces owned by the running process; aborted at shutdown.
pub struct Background {
    pub reaper: tokio::task::JoinHandle<()>,
    pub dispatcher: tokio::task::JoinHandle<()>,
    pub workers: Vec<tokio::task::JoinHandle<()>>,
    pub worker_shutdown: ShutdownHandle,
}

impl Background {
    pub fn stop(&self) {
        self.worker_shutdown.trigger();
        self.reaper.abort();
        self.dispatcher.abort();
    }
}

/// Builds the full application state from configuration, connecting the
/// control store and Redis. A missing Redis degrades to in-process rate
/// limiting with queues disabled, which keeps development setups alive.
pub async fn build_state(config: GatewayConfig) -> Result<(AppState, Background)> {
    let config = Arc::new(config);
    let secrets = SecretBox::new(&config.sys_secret);

    let store: Arc<dyn ControlStore> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PostgresStore::connect(&config.control_db_url(), secrets.clone())
                .await
                .context("connect control database")?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory control store; state will not survive restarts");
            Arc::new(InMemoryStore::new())
        }
    };

    let registry = PoolRegistry::new(config.registry_settings());
    let reaper = Arc::clone(&registry).spawn_reaper();

    let (rate, queues): (Arc<dyn RateStore>, Option<Arc<QueueSet>>) =
        match connect_redis(&config.redis_url).await {
            Ok(redis) => (
                Arc::new(RedisRateStore::new(redis.clone())),
                Some(QueueSet::new(redis)),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable; using in-process rate limits, queues disabled");
                (Arc::new(MemoryRateStore::new()), None)
            }
        };

    let (bridge, events) = RealtimeBridge::new(Arc::clone(&config));
    let directory = TenantDirectory::new(Arc::clone(&store));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&directory),
        Arc::clone(&registry),
        queues.clone(),
    )
    .spawn(events);

    let (worker_shutdown, signal) = ShutdownHandle::new();
    let state = AppState {
        config,
        store,
        directory,
        registry,
        rate,
        bridge,
        queues,
    };

    let workers = spawn_mode_workers(&state, signal);
    api::auth::seed_admin(&state)
        .await
        .map_err(|err| anyhow::anyhow!("admin seeding failed: {err}"))?;
    if state.config.service_mode.serves_data_plane() {
        pin_rule_listeners(&state).await;
    }

    Ok((
        state,
        Background {
            reaper,
            dispatcher,
            workers,
            worker_shutdown,
        },
    ))
}

fn spawn_mode_workers(
    state: &AppState,
    signal: ShutdownSignal,
) -> Vec<tokio::task::JoinHandle<()>> {
    if !state.config.service_mode.runs_workers() {
        return Vec::new();
    }
    let Some(queues) = &state.queues else {
        return Vec::new();
    };
    crate::jobs::spawn_workers(
        queues,
        Arc::clone(&state.registry),
        Arc::clone(&state.store),
        signal,
    )
}

/// Tenants with active rules or webhooks need a LISTEN session even with
/// zero subscribers; re-pin them at boot.
async fn pin_rule_listeners(state: &AppState) {
    let projects = match state.store.list_projects().await {
        Ok(projects) => projects,
        Err(err) => {
            tracing::warn!(error = %err, "rule listener scan failed");
            return;
        }
    };
    for project in projects {
        let has_hooks = project
            .metadata
            .webhooks
            .as_ref()
            .is_some_and(|hooks| !hooks.is_empty());
        let has_rules = state
            .store
            .has_active_rules(&project.slug)
            .await
            .unwrap_or(false);
        if has_hooks || has_rules {
            state.bridge.set_pin(&project, true);
        }
    }
}

async fn connect_redis(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).context("parse redis url")?;
    let manager = redis::aio::ConnectionManager::new(client)
        .await
        .context("connect redis")?;
    Ok(manager)
}

/// Routes owned by the data plane, wrapped in the ordered pipeline:
/// tenant resolution, CORS, authorisation + body limit, rate limit.
fn data_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/data/{slug}/tables",
            get(api::data::list_tables).post(api::data::create_table),
        )
        .route(
            "/api/data/{slug}/tables/{table}",
            get(api::data::get_columns).delete(api::data::delete_table),
        )
        .route("/api/data/{slug}/functions", get(api::data::list_functions))
        .route(
            "/api/data/{slug}/functions/{name}",
            get(api::data::get_function_definition),
        )
        .route("/api/data/{slug}/triggers", get(api::data::list_triggers))
        .route(
            "/api/data/{slug}/recycle-bin",
            get(api::data::list_recycle_bin),
        )
        .route(
            "/api/data/{slug}/recycle-bin/{name}/restore",
            post(api::data::restore_table),
        )
        .route("/api/data/{slug}/query", post(api::data::run_raw_query))
        .route("/api/data/{slug}/rpc/{name}", post(api::data::execute_rpc))
        .route("/api/data/{slug}/stats", get(api::data::get_stats))
        .route(
            "/api/data/{slug}/openapi.json",
            get(api::data::get_openapi_spec),
        )
        .route("/api/data/{slug}/realtime", get(api::realtime::subscribe))
        .route(
            "/api/data/{slug}/push/devices",
            get(api::push::list_devices).post(api::push::register_device),
        )
        .route("/api/data/{slug}/push/send", post(api::push::send_push))
        .route(
            "/api/data/{slug}/push/rules",
            get(api::push::list_rules).post(api::push::create_rule),
        )
        .route(
            "/api/data/{slug}/push/rules/{id}",
            axum::routing::patch(api::push::update_rule).delete(api::push::delete_rule),
        )
        .route(
            "/api/data/{slug}/{table}",
            get(api::data::select_rows)
                .post(api::data::insert_rows)
                .patch(api::data::update_rows)
                .delete(api::data::delete_rows),
        )
        // Innermost to outermost: rate limit, authorisation, CORS, tenant
        // resolution. `layer` wraps what was added before it, so the last
        // layer here runs first.
        .layer(from_fn_with_state(state.clone(), pipeline::rate_limit))
        .layer(from_fn_with_state(
            state.clone(),
            pipeline::authorize_data_plane,
        ))
        .layer(from_fn(pipeline::apply_cors))
        .layer(from_fn_with_state(state.clone(), pipeline::resolve_tenant))
}

/// Control-plane routes: public auth endpoints plus the admin-gated
/// surface, all behind the stealth host guard and the per-project IP
/// firewall.
fn control_router(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route(
            "/api/control/projects",
            get(api::projects::list_projects).post(api::projects::create_project),
        )
        .route(
            "/api/control/projects/{slug}",
            get(api::projects::get_project)
                .patch(api::projects::update_project)
                .delete(api::projects::delete_project),
        )
        .route(
            "/api/control/projects/{slug}/rotate-keys",
            post(api::projects::rotate_keys),
        )
        .route(
            "/api/control/projects/{slug}/reveal-key",
            post(api::projects::reveal_key),
        )
        .route(
            "/api/control/projects/{slug}/block-ip",
            post(api::projects::block_ip),
        )
        .route(
            "/api/control/projects/{slug}/block-ip/{ip}",
            delete(api::projects::unblock_ip),
        )
        .route(
            "/api/control/projects/{slug}/panic",
            post(api::projects::set_panic),
        )
        .layer(from_fn_with_state(state.clone(), api::auth::require_admin))
        .layer(from_fn_with_state(
            state.clone(),
            pipeline::control_firewall,
        ));

    Router::new()
        .route("/api/control/auth/login", post(api::auth::login))
        .route("/api/control/auth/verify", post(api::auth::verify))
        .merge(admin)
        .route("/api/health", get(api::system::health))
        .route(
            "/api/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        )
        .layer(from_fn_with_state(state.clone(), pipeline::host_guard))
}

/// Composes the full router for the configured service mode.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    if state.config.service_mode.serves_data_plane() {
        router = router.merge(data_router(&state));
    }
    if matches!(
        state.config.service_mode,
        ServiceMode::ControlPlane | ServiceMode::All
    ) {
        router = router.merge(control_router(&state));
    } else {
        // The data-plane-only deployment still answers health checks.
        router = router.route("/api/health", get(api::system::health));
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(pipeline::security_headers))
        .with_state(state)
}

/// Drains shared resources inside the shutdown deadline.
pub async fn drain(state: &AppState, background: &Background) {
    background.stop();
    state.bridge.shutdown();
    state.registry.close_all().await;
}

/// Test constructor: memory store, memory rate limits, no queues. Lets
/// router tests run with zero external services.
pub fn test_state(config: GatewayConfig) -> AppState {
    let config = Arc::new(config);
    let store: Arc<dyn ControlStore> = Arc::new(InMemoryStore::new());
    // Router tests never consume bridge events; the receiver drops here.
    let (bridge, _events) = RealtimeBridge::new(Arc::clone(&config));
    AppState {
        directory: TenantDirectory::new(Arc::clone(&store)),
        registry: PoolRegistry::new(config.registry_settings()),
        rate: Arc::new(MemoryRateStore::new()),
        bridge,
        queues: None,
        store,
        config,
    }
}

//! Stealth host guard and the control-plane IP firewall.

use super::client_ip;
use crate::app::AppState;
use crate::directory::{host_without_port, is_local_host};
use crate::error::ApiError;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

/// Requests with no tenant context arriving on a public host that is not
/// the configured system hostname get a bare 404. The control plane does
/// not announce itself.
pub async fn host_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_local_host(host) {
        let bare = host_without_port(host);
        let matches_system = state
            .config
            .system_hostname
            .as_deref()
            .is_some_and(|system| system == bare);
        if !matches_system {
            return ApiError::NotFound("not found".to_string()).into_response();
        }
    }
    next.run(request).await
}

/// For control paths scoped to a slug, rejects clients on that project's
/// blocklist. Unknown projects fall through; the handler produces its own
/// 404.
pub async fn control_firewall(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(slug) = slug_from_control_path(request.uri().path()) {
        if let Ok(project) = state.store.get_project(&slug).await {
            let socket = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0);
            let ip = client_ip(request.headers(), socket);
            if project.blocked_ips.iter().any(|blocked| *blocked == ip) {
                return ApiError::Forbidden("address is blocked".to_string()).into_response();
            }
        }
    }
    next.run(request).await
}

fn slug_from_control_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/api/control/projects/")?;
    let slug = rest.split('/').next()?;
    (!slug.is_empty() && slug != "import").then(|| slug.to_string())
}

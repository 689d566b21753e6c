//! Authorisation, pool attachment, and the dynamic body limit.
//!
//! Runs after tenant resolution: applies the role state machine, selects
//! and acquires the tenant pool for this request's access pattern, and
//! buffers the body under the project's effective size limit so oversized
//! payloads are rejected with 413 before any handler runs.

use super::{DataContext, TenantContext};
use crate::app::AppState;
use crate::auth::authorize;
use crate::error::ApiError;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const BASE_BODY_LIMIT: u64 = 2 * 1024 * 1024;
const ROUTE_BODY_LIMIT: u64 = 10 * 1024 * 1024;
const HARD_BODY_CAP: u64 = 50 * 1024 * 1024;

/// Resolves the request body limit: 2 MiB base, 10 MiB for edge/import
/// routes, the metadata override when present, and a 50 MiB hard cap over
/// everything.
pub fn effective_body_limit(max_json_size: Option<u64>, path: &str) -> u64 {
    let default = if path.contains("/edge/") || path.contains("/import/") {
        ROUTE_BODY_LIMIT
    } else {
        BASE_BODY_LIMIT
    };
    max_json_size.unwrap_or(default).min(HARD_BODY_CAP)
}

pub async fn authorize_data_plane(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(tenant) = request.extensions().get::<TenantContext>().cloned() else {
        return ApiError::Internal("tenant context missing".to_string()).into_response();
    };
    let path = request.uri().path().to_string();

    let auth = match authorize(&tenant.project, &tenant.credentials, &path, tenant.is_admin) {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    // Pool selection: reads may go to a replica, everything else to the
    // primary (internal or ejected).
    let is_read = request.method() == Method::GET || request.method() == Method::HEAD;
    let target = tenant.project.pool_target(is_read);
    let pool_key = cascata_pool::pool_key(&target.db, &target.config);
    let pool = match state.registry.get(&target.db, &target.config).await {
        Ok(pool) => pool,
        Err(err) => return ApiError::from(err).into_response(),
    };

    // Buffer the body under the project's limit; 413 on overflow.
    let limit = effective_body_limit(tenant.project.metadata.max_json_size(), &path);
    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, limit as usize).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::PayloadTooLarge(format!("body exceeds {limit} bytes"))
                .into_response();
        }
    };

    parts.extensions.insert(tenant.clone());
    parts.extensions.insert(DataContext {
        project: tenant.project,
        auth,
        pool,
        pool_key,
    });
    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

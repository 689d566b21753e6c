//! Health endpoint.

use crate::api::types::HealthResponse;
use crate::app::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::extract::State;

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "system",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.store.health_check().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        store: state.store.backend_name().to_string(),
        active_pools: state.registry.len(),
        realtime_tenants: state.bridge.active_tenants(),
    }))
}

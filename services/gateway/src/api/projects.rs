//! Project administration handlers.
//!
//! # Purpose
//! Admin CRUD of projects, key rotation and reveal, the IP blocklist, and
//! the panic shield switch. Every mutation invalidates the directory cache
//! and, where pools may be affected, closes the project's pool variants.

use crate::api::auth::verify_admin_password;
use crate::api::types::{
    BlockIpRequest, PanicRequest, ProjectListResponse, RevealKeyRequest, RotateKeyRequest,
    RotateKeyResponse,
};
use crate::app::AppState;
use crate::auth::AdminClaims;
use crate::error::ApiError;
use crate::model::Project;
use crate::store::{KeyKind, NewProject, ProjectPatch};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

#[utoipa::path(
    get,
    path = "/api/control/projects",
    tag = "projects",
    responses((status = 200, description = "All projects", body = ProjectListResponse))
)]
pub async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<ProjectListResponse>, ApiError> {
    let items = state.store.list_projects().await?;
    Ok(Json(ProjectListResponse { items }))
}

#[utoipa::path(
    post,
    path = "/api/control/projects",
    tag = "projects",
    responses(
        (status = 201, description = "Project created", body = Project),
        (status = 409, description = "Slug already taken")
    )
)]
pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.store.create_project(body).await?;
    // Best-effort provisioning of the physical database; a pre-provisioned
    // cluster simply logs the conflict.
    if let Err(err) = state.store.provision_database(&project.db_name).await {
        tracing::warn!(slug = %project.slug, error = %err, "database provisioning failed");
    }
    state.directory.invalidate(&project.slug, project.custom_domain.as_deref());
    Ok((StatusCode::CREATED, Json(project)))
}

#[utoipa::path(
    get,
    path = "/api/control/projects/{slug}",
    tag = "projects",
    responses(
        (status = 200, description = "Project record", body = Project),
        (status = 404, description = "No such project")
    )
)]
pub async fn get_project(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.store.get_project(&slug).await?))
}

#[utoipa::path(
    patch,
    path = "/api/control/projects/{slug}",
    tag = "projects",
    responses((status = 200, description = "Updated project", body = Project))
)]
pub async fn update_project(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<ProjectPatch>,
) -> Result<Json<Project>, ApiError> {
    let previous = state.store.get_project(&slug).await?;
    let project = state.store.update_project(&slug, patch).await?;
    state
        .directory
        .invalidate(&slug, previous.custom_domain.as_deref());
    state
        .directory
        .invalidate(&slug, project.custom_domain.as_deref());
    // Pool-affecting settings may have changed; drop every variant so the
    // next acquire rebuilds with fresh options.
    state.registry.close(&project.db_name).await;
    Ok(Json(project))
}

#[utoipa::path(
    delete,
    path = "/api/control/projects/{slug}",
    tag = "projects",
    responses((status = 204, description = "Project deleted"))
)]
pub async fn delete_project(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    let project = state.store.delete_project(&slug).await?;
    state
        .directory
        .invalidate(&slug, project.custom_domain.as_deref());
    state.registry.close(&project.db_name).await;
    state.bridge.set_pin(&project, false);
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/control/projects/{slug}/rotate-keys",
    tag = "projects",
    request_body = RotateKeyRequest,
    responses((status = 200, description = "New key", body = RotateKeyResponse))
)]
pub async fn rotate_keys(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<RotateKeyRequest>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let key = state.store.rotate_key(&slug, body.kind).await?;
    state.directory.invalidate(&slug, None);
    Ok(Json(RotateKeyResponse { key }))
}

#[utoipa::path(
    post,
    path = "/api/control/projects/{slug}/reveal-key",
    tag = "projects",
    request_body = RevealKeyRequest,
    responses((status = 200, description = "Plaintext key", body = RotateKeyResponse))
)]
pub async fn reveal_key(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Json(body): Json<RevealKeyRequest>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    verify_admin_password(&state, &claims, &body.password).await?;
    let project = state.store.get_project(&slug).await?;
    let key = match body.kind {
        KeyKind::Anon => project.secrets.anon_key,
        KeyKind::Service => project.secrets.service_key,
        KeyKind::Jwt => project.secrets.jwt_secret,
    };
    Ok(Json(RotateKeyResponse { key }))
}

#[utoipa::path(
    post,
    path = "/api/control/projects/{slug}/block-ip",
    tag = "projects",
    request_body = BlockIpRequest,
    responses((status = 204, description = "Address blocked"))
)]
pub async fn block_ip(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<BlockIpRequest>,
) -> Result<StatusCode, ApiError> {
    if body.ip.parse::<std::net::IpAddr>().is_err() {
        return Err(ApiError::Validation(format!("not an IP address: {}", body.ip)));
    }
    state.store.block_ip(&slug, &body.ip).await?;
    state.directory.invalidate(&slug, None);
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/control/projects/{slug}/block-ip/{ip}",
    tag = "projects",
    responses((status = 204, description = "Address unblocked"))
)]
pub async fn unblock_ip(
    Path((slug, ip)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.store.unblock_ip(&slug, &ip).await?;
    state.directory.invalidate(&slug, None);
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/control/projects/{slug}/panic",
    tag = "projects",
    request_body = PanicRequest,
    responses((status = 204, description = "Panic flag updated"))
)]
pub async fn set_panic(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PanicRequest>,
) -> Result<StatusCode, ApiError> {
    // Ensure the project exists so a typo cannot silently flag nothing.
    state.store.get_project(&slug).await?;
    state
        .rate
        .set_panic(&slug, body.engaged)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    tracing::warn!(slug = %slug, engaged = body.engaged, "panic shield toggled");
    Ok(StatusCode::NO_CONTENT)
}

//! Tenant resolution stage.
//!
//! Resolves the project for a data-plane request, verifies whether the
//! bearer is a platform admin, consults the panic shield, and enforces
//! domain locking. Later stages find everything they need in the attached
//! `TenantContext`.

use super::{TenantContext, extract_credentials};
use crate::app::AppState;
use crate::auth::verify_admin_token;
use crate::directory::TenantDirectory;
use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = request.uri().path().to_string();
    let credentials = extract_credentials(request.headers(), request.uri().query());

    let resolved = match state.directory.resolve(&host, &path).await {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };
    let Some((project, via)) = resolved else {
        return ApiError::NotFound("project not found".to_string()).into_response();
    };

    let is_admin = credentials
        .bearer
        .as_deref()
        .and_then(|bearer| verify_admin_token(&state.config.system_jwt_secret, bearer))
        .is_some();

    // Panic shield: a project under panic accepts admin traffic only. The
    // flag lives in the shared rate-limit store; read failures fail open so
    // a sick Redis cannot take every healthy tenant down with it.
    if !is_admin {
        match state.rate.is_panicked(&project.slug).await {
            Ok(true) => return ApiError::LockedDown.into_response(),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(slug = %project.slug, error = %err, "panic shield check failed");
            }
        }
    }

    if let Err(err) = TenantDirectory::enforce_domain_lock(&project, via, &host, is_admin) {
        return err.into_response();
    }

    request.extensions_mut().insert(TenantContext {
        project,
        via,
        credentials,
        is_admin,
    });
    next.run(request).await
}

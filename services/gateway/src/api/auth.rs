//! Admin authentication endpoints and the control-plane admin gate.

use crate::api::types::{LoginRequest, LoginResponse, VerifyResponse};
use crate::app::AppState;
use crate::auth::{AdminClaims, mint_admin_token, verify_admin_token};
use crate::error::ApiError;
use axum::Json;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

fn bearer_of(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|auth| {
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
        })
        .map(str::to_string)
}

/// Gate for every admin route except login/verify: the bearer must carry
/// the admin role under the process secret. Claims attach to the request.
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(bearer) = bearer_of(&request) else {
        return ApiError::Unauthorized("admin token required".to_string()).into_response();
    };
    let Some(claims) = verify_admin_token(&state.config.system_jwt_secret, &bearer) else {
        return ApiError::Unauthorized("invalid admin token".to_string()).into_response();
    };
    request.extensions_mut().insert(claims);
    next.run(request).await
}

#[utoipa::path(
    post,
    path = "/api/control/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Admin token issued", body = LoginResponse),
        (status = 401, description = "Bad credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(admin) = state.store.find_admin(&body.username).await? else {
        // Hash anyway so unknown usernames cost the same as bad passwords.
        let _ = bcrypt::verify(&body.password, "$2b$12$invalidsaltinvalidsaltinva");
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    };
    let valid = bcrypt::verify(&body.password, &admin.password_hash)
        .map_err(|_| ApiError::Unauthorized("invalid credentials".to_string()))?;
    if !valid {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }
    let token = mint_admin_token(&state.config.system_jwt_secret, &admin.username)
        .map_err(|err| ApiError::Internal(format!("token minting failed: {err}")))?;
    Ok(Json(LoginResponse {
        token,
        expires_in: crate::auth::ADMIN_TOKEN_TTL.as_secs(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/control/auth/verify",
    tag = "auth",
    responses(
        (status = 200, description = "Token is valid", body = VerifyResponse),
        (status = 401, description = "Token is not valid")
    )
)]
pub async fn verify(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Some(bearer) = bearer_of(&request) else {
        return Err(ApiError::Unauthorized("missing token".to_string()));
    };
    let Some(claims) = verify_admin_token(&state.config.system_jwt_secret, &bearer) else {
        return Err(ApiError::Unauthorized("invalid token".to_string()));
    };
    Ok(Json(VerifyResponse {
        valid: true,
        sub: claims.sub,
    }))
}

/// Seeds the admin table from the environment on first boot.
pub async fn seed_admin(state: &AppState) -> Result<(), ApiError> {
    let (Some(username), Some(password)) = (
        state.config.admin_seed_user.as_deref(),
        state.config.admin_seed_password.as_deref(),
    ) else {
        return Ok(());
    };
    if state.store.admin_count().await? > 0 {
        return Ok(());
    }
    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|err| ApiError::Internal(format!("hash failed: {err}")))?;
    state.store.create_admin(username, &hash).await?;
    tracing::info!(username, "seeded initial admin user");
    Ok(())
}

/// Re-verification used by key reveal: the caller proves knowledge of
/// their own password even with a valid session token.
pub async fn verify_admin_password(
    state: &AppState,
    claims: &AdminClaims,
    password: &str,
) -> Result<(), ApiError> {
    let Some(admin) = state.store.find_admin(&claims.sub).await? else {
        return Err(ApiError::Unauthorized("unknown admin".to_string()));
    };
    let valid = bcrypt::verify(password, &admin.password_hash)
        .map_err(|_| ApiError::Unauthorized("invalid password".to_string()))?;
    if !valid {
        return Err(ApiError::Unauthorized("invalid password".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction_tolerates_case() {
        let request: Request = axum::http::Request::builder()
            .header("authorization", "bearer abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_of(&request), Some("abc".to_string()));
    }
}

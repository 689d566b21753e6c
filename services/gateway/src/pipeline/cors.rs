//! Dynamic per-project CORS.
//!
//! Projects listing allowed origins get exact-match echoing; an empty or
//! absent list echoes loopback origins only (development posture).
//! Preflights short-circuit with 200 once the policy headers are set.

use super::TenantContext;
use crate::model::AllowedOrigin;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const ALLOW_METHODS: &str = "GET, POST, PATCH, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Authorization, Content-Type, apikey, Prefer, Range, X-Requested-With";
const EXPOSE_HEADERS: &str =
    "Content-Range, X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset";

fn is_loopback_origin(origin: &str) -> bool {
    origin.starts_with("http://localhost")
        || origin.starts_with("https://localhost")
        || origin.starts_with("http://127.0.0.1")
        || origin.starts_with("https://127.0.0.1")
        || origin.starts_with("http://[::1]")
}

/// Decides whether `origin` may be echoed for the given allow-list. `None`
/// means the origin is not acceptable.
pub fn allowed_origin(origin: &str, configured: Option<&[AllowedOrigin]>) -> Option<String> {
    match configured {
        Some(list) if !list.is_empty() => list
            .iter()
            .find(|allowed| allowed.url().trim_end_matches('/') == origin.trim_end_matches('/'))
            .map(|_| origin.to_string()),
        _ => is_loopback_origin(origin).then(|| origin.to_string()),
    }
}

pub async fn apply_cors(request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let configured = request
        .extensions()
        .get::<TenantContext>()
        .and_then(|ctx| ctx.project.metadata.allowed_origins.clone());
    let is_preflight = request.method() == Method::OPTIONS;

    let mut response = if is_preflight {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if let Some(origin) = origin {
        if let Some(echo) = allowed_origin(&origin, configured.as_deref()) {
            if let Ok(value) = HeaderValue::from_str(&echo) {
                headers.insert("access-control-allow-origin", value);
            }
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
            headers.insert("vary", HeaderValue::from_static("Origin"));
        }
    }
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
    response
}

//! Dynamic rate limiting.
//!
//! Fixed windows keyed by `(slug, path, method, role, client ip)` in the
//! shared store. Responses always carry the `X-RateLimit-*` triple; a
//! rejected request gets 429 with `Retry-After`. A broken rate store fails
//! open with a warning.

use super::{DataContext, client_ip};
use crate::app::AppState;
use crate::auth::RequestRole;
use crate::error::ApiError;
use crate::limits::RateDecision;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

const WINDOW_SECS: u64 = 60;
const SERVICE_LIMIT: u64 = 1_000;
const DEFAULT_LIMIT: u64 = 120;

pub fn rate_key(slug: &str, path: &str, method: &str, role: &str, ip: &str) -> String {
    format!("{slug}:{path}:{method}:{role}:{ip}")
}

fn limit_for(role: RequestRole) -> u64 {
    if role.is_service() { SERVICE_LIMIT } else { DEFAULT_LIMIT }
}

fn stamp(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    let pairs = [
        ("x-ratelimit-limit", decision.limit),
        ("x-ratelimit-remaining", decision.remaining),
        ("x-ratelimit-reset", decision.reset_secs),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, value);
        }
    }
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(data) = request.extensions().get::<DataContext>() else {
        return next.run(request).await;
    };
    let socket = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(request.headers(), socket);
    let role = data.auth.role;
    let key = rate_key(
        &data.project.slug,
        request.uri().path(),
        request.method().as_str(),
        role.as_guc(),
        &ip,
    );
    let limit = limit_for(role);

    let decision = match state.rate.check_rate(&key, limit, WINDOW_SECS).await {
        Ok(decision) => decision,
        Err(err) => {
            tracing::warn!(error = %err, "rate store unavailable, failing open");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        let mut response = ApiError::RateLimited {
            retry_after_secs: decision.reset_secs,
        }
        .into_response();
        stamp(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    stamp(&mut response, &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_every_dimension() {
        let key = rate_key("acme", "/api/data/acme/t", "GET", "anon", "203.0.113.9");
        assert_eq!(key, "acme:/api/data/acme/t:GET:anon:203.0.113.9");
    }

    #[test]
    fn service_role_gets_the_higher_budget() {
        assert_eq!(limit_for(RequestRole::ServiceRole), 1_000);
        assert_eq!(limit_for(RequestRole::Anon), 120);
        assert_eq!(limit_for(RequestRole::Authenticated), 120);
    }
}

//! Request pipeline.
//!
//! # Purpose
//! The ordered middleware chain of the data plane: security headers, tenant
//! resolution, dynamic CORS, stealth host guard, control-plane firewall,
//! authorisation, dynamic body limit, and dynamic rate limiting. Each stage
//! may short-circuit; context accumulates in request extensions.

mod authz;
mod cors;
mod guard;
mod headers;
mod rate;
mod tenant;

pub use authz::{authorize_data_plane, effective_body_limit};
pub use cors::apply_cors;
pub use guard::{control_firewall, host_guard};
pub use headers::security_headers;
pub use rate::rate_limit;
pub use tenant::resolve_tenant;

use crate::auth::{AuthContext, Credentials};
use crate::directory::ResolvedVia;
use crate::model::Project;
use axum::http::HeaderMap;
use sqlx::PgPool;

/// Attached by tenant resolution; consumed by CORS, authorisation, and the
/// rate limiter.
#[derive(Clone)]
pub struct TenantContext {
    pub project: Project,
    pub via: ResolvedVia,
    pub credentials: Credentials,
    /// Bearer verified under the process-wide admin secret.
    pub is_admin: bool,
}

/// Attached once authorisation and pool selection succeed; what data-plane
/// handlers actually consume.
#[derive(Clone)]
pub struct DataContext {
    pub project: Project,
    pub auth: AuthContext,
    pub pool: PgPool,
    /// Registry key of the acquired pool, for reactive invalidation.
    pub pool_key: String,
}

/// Best-effort client address: proxy headers first, then the socket.
pub fn client_ip(headers: &HeaderMap, fallback: Option<std::net::SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    fallback
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Pulls the bearer (from `Authorization` or the `token` query parameter)
/// and the api key (`apikey` header or query parameter).
pub fn extract_credentials(headers: &HeaderMap, query: Option<&str>) -> Credentials {
    let mut bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|auth| {
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
        })
        .map(str::to_string);
    let mut apikey = headers
        .get("apikey")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" if bearer.is_none() => bearer = Some(value.into_owned()),
                "apikey" if apikey.is_none() => apikey = Some(value.into_owned()),
                _ => {}
            }
        }
    }
    Credentials { bearer, apikey }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let socket = "192.0.2.1:4000".parse().ok();
        assert_eq!(client_ip(&headers, socket), "203.0.113.9");
    }

    #[test]
    fn socket_address_is_fallback() {
        let headers = HeaderMap::new();
        let socket = "192.0.2.1:4000".parse().ok();
        assert_eq!(client_ip(&headers, socket), "192.0.2.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn credentials_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));
        headers.insert("apikey", HeaderValue::from_static("key-1"));
        let credentials = extract_credentials(&headers, None);
        assert_eq!(credentials.bearer.as_deref(), Some("tok-1"));
        assert_eq!(credentials.apikey.as_deref(), Some("key-1"));
    }

    #[test]
    fn credentials_from_query_do_not_override_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer head"));
        let credentials = extract_credentials(&headers, Some("token=query&apikey=qkey"));
        assert_eq!(credentials.bearer.as_deref(), Some("head"));
        assert_eq!(credentials.apikey.as_deref(), Some("qkey"));
    }
}

//! SSRF guard for outbound webhook traffic.
//!
//! # Purpose
//! A webhook target must never reach the platform's own network. Three
//! layers: scheme and hostname denylist, literal-address range checks, and
//! DNS resolution with every resolved address checked against the
//! private/loopback/link-local ranges.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

/// Service names on the internal network; a webhook pointed at any of
/// these is hostile or misconfigured.
const INTERNAL_HOSTS: [&str; 10] = [
    "localhost",
    "db",
    "postgres",
    "pgbouncer",
    "redis",
    "dragonfly",
    "nginx",
    "qdrant",
    "minio",
    "gateway",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SsrfError {
    #[error("Security Violation: invalid webhook URL")]
    InvalidUrl,
    #[error("Security Violation: scheme must be http or https")]
    BadScheme,
    #[error("Security Violation: host {0} is not allowed")]
    ForbiddenHost(String),
    #[error("Security Violation: {0} resolves to a private address")]
    PrivateAddress(String),
}

pub fn ipv4_is_private(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets[0] {
        0 | 10 | 127 => true,
        169 => octets[1] == 254,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

pub fn ipv6_is_private(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return ipv4_is_private(mapped);
    }
    let segments = addr.segments();
    // fc00::/7 unique-local, fe80::/10 link-local.
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

pub fn ip_is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => ipv4_is_private(v4),
        IpAddr::V6(v6) => ipv6_is_private(v6),
    }
}

/// Static validation: parse, scheme, denylist, literal addresses. Never
/// performs I/O, so it can gate request admission synchronously.
pub fn validate_url_static(raw: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(raw).map_err(|_| SsrfError::InvalidUrl)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SsrfError::BadScheme);
    }
    let Some(host) = url.host_str() else {
        return Err(SsrfError::InvalidUrl);
    };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let lowered = bare.to_ascii_lowercase();
    if INTERNAL_HOSTS.contains(&lowered.as_str()) {
        return Err(SsrfError::ForbiddenHost(lowered));
    }
    if let Ok(addr) = bare.parse::<IpAddr>() {
        if ip_is_private(addr) {
            return Err(SsrfError::PrivateAddress(bare.to_string()));
        }
    }
    Ok(url)
}

/// Full validation: static checks plus DNS resolution of the hostname.
/// Every resolved A/AAAA record must be public; otherwise no socket is
/// opened at all.
pub async fn validate_url(raw: &str) -> Result<Url, SsrfError> {
    let url = validate_url_static(raw)?;
    let host = url.host_str().unwrap_or_default().to_string();
    if host.parse::<IpAddr>().is_ok() {
        // Literal address, already range-checked.
        return Ok(url);
    }
    let port = url.port_or_known_default().unwrap_or(443);
    let resolved = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| SsrfError::ForbiddenHost(host.clone()))?;
    for addr in resolved {
        if ip_is_private(addr.ip()) {
            return Err(SsrfError::PrivateAddress(host.clone()));
        }
    }
    Ok(url)
}

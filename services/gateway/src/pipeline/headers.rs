//! Security headers and status-class accounting.
//!
//! Outermost stage: scrubs server-identifying headers, adds the standard
//! hardening pair, counts requests by status class, and logs server errors
//! with their route. Client errors are not logged by default.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

pub async fn security_headers(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
    headers.remove("server");
    headers.remove("x-powered-by");

    let status = response.status();
    metrics::counter!(
        "cascata_http_requests_total",
        "class" => format!("{}xx", status.as_u16() / 100)
    )
    .increment(1);
    if status.is_server_error() {
        tracing::error!(%method, path = %path, status = status.as_u16(), "request failed");
    }
    response
}

//! Webhook delivery worker.
//!
//! # Purpose
//! POSTs signed event payloads to tenant-configured targets. Every attempt
//! re-validates the URL against the SSRF guard, signs the canonical JSON
//! body with HMAC-SHA256 under the per-hook secret, and classifies
//! failures: 429 and 5xx retry per policy, other 4xx short-circuit to the
//! final-attempt branch. On exhaustion a fallback alert is delivered once,
//! best-effort.

use super::ssrf;
use cascata_jobs::{JobEnvelope, JobFailure, JobHandler};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("Cascata-Webhook-Engine/", env!("CARGO_PKG_VERSION"));

/// Queue payload for one delivery. The secret rides inside the job store
/// and is never logged or echoed back out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJobPayload {
    pub target_url: String,
    pub payload: Value,
    pub secret: String,
    pub event_type: String,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
}

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over the exact bytes that go on the wire.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn decode(job: &JobEnvelope) -> Result<WebhookJobPayload, JobFailure> {
        serde_json::from_value(job.payload.clone())
            .map_err(|err| JobFailure::permanent(format!("malformed webhook job: {err}")))
    }
}

#[async_trait::async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<Value, JobFailure> {
        let webhook = Self::decode(job)?;
        let url = ssrf::validate_url(&webhook.target_url)
            .await
            .map_err(|err| JobFailure::permanent(err.to_string()))?;

        let body = webhook.payload.to_string();
        let signature = sign_payload(&webhook.secret, body.as_bytes());

        let response = self
            .client
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("X-Cascata-Signature", signature)
            .header("X-Cascata-Event", &webhook.event_type)
            .header("X-Cascata-Table", &webhook.table_name)
            .body(body)
            .send()
            .await
            .map_err(|err| JobFailure::transient(format!("delivery failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            metrics::counter!("cascata_webhooks_delivered").increment(1);
            return Ok(json!({"status": "sent", "code": status.as_u16()}));
        }
        let message = format!("target responded {status}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(JobFailure::transient(message))
        } else {
            // Dead 4xx targets are not retried beyond the fallback.
            Err(JobFailure::permanent(message))
        }
    }

    async fn on_exhausted(&self, job: &JobEnvelope, error: &JobFailure) {
        metrics::counter!("cascata_webhooks_failed").increment(1);
        let Ok(webhook) = Self::decode(job) else { return };
        let Some(fallback) = webhook.fallback_url.as_deref() else {
            return;
        };
        let url = match ssrf::validate_url(fallback).await {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "fallback target failed SSRF validation");
                return;
            }
        };
        let alert = json!({
            "alert": "webhook_delivery_failed",
            "original_target": webhook.target_url,
            "error": error.message,
            "event": webhook.event_type,
            "table": webhook.table_name,
            "original_payload": webhook.payload,
        });
        let result = self
            .client
            .post(url)
            .timeout(FALLBACK_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .json(&alert)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(job = %job.id, "fallback alert delivered");
            }
            Ok(response) => {
                tracing::warn!(job = %job.id, status = %response.status(), "fallback alert rejected");
            }
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "fallback alert failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign_payload("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_depends_on_secret_and_body() {
        let body = br#"{"a":1}"#;
        assert_ne!(sign_payload("s1", body), sign_payload("s2", body));
        assert_ne!(sign_payload("s1", body), sign_payload("s1", br#"{"a":2}"#));
    }

    #[test]
    fn payload_round_trips_without_leaking_fallback_null() {
        let payload = WebhookJobPayload {
            target_url: "https://sink.example.com".to_string(),
            payload: json!({"x": 1}),
            secret: "sekrit".to_string(),
            event_type: "INSERT".to_string(),
            table_name: "orders".to_string(),
            fallback_url: None,
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert!(encoded.get("fallback_url").is_none());
        let decoded: WebhookJobPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.secret, "sekrit");
    }

    #[test]
    fn user_agent_names_the_engine() {
        assert!(USER_AGENT.starts_with("Cascata-Webhook-Engine/"));
    }
}

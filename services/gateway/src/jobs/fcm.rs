//! FCM HTTP v1 client.
//!
//! # Purpose
//! Exchanges an RS256-signed service-account assertion for a short-lived
//! OAuth bearer (cached until shortly before expiry) and posts
//! platform-tuned messages. `UNREGISTERED`/404 answers are surfaced so the
//! push worker can prune dead tokens.

use crate::model::{DevicePlatform, FcmServiceAccount};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const ASSERTION_TTL: Duration = Duration::from_secs(60 * 60);
/// Refresh slack so a token is never used right at its expiry edge.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum FcmError {
    #[error("invalid service-account key")]
    BadKey,
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("send failed: {0}")]
    Send(String),
    /// The token is dead; delete the device row.
    #[error("device unregistered")]
    Unregistered,
}

#[derive(Clone)]
struct CachedToken {
    bearer: String,
    expires_at: Instant,
}

/// Per-service-account bearer cache, shared by all push worker tasks.
#[derive(Default)]
pub struct FcmTokenCache {
    tokens: DashMap<String, CachedToken>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The RS256 assertion FCM's OAuth endpoint expects.
pub fn mint_assertion(account: &FcmServiceAccount) -> Result<String, FcmError> {
    let now = now_epoch_seconds();
    let claims = json!({
        "iss": account.client_email,
        "scope": FCM_SCOPE,
        "aud": account.token_uri,
        "iat": now,
        "exp": now + ASSERTION_TTL.as_secs() as i64,
    });
    let key =
        EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(|_| FcmError::BadKey)?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|_| FcmError::BadKey)
}

impl FcmTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a bearer for the account, minting a new one when the cache
    /// is cold or near expiry.
    pub async fn bearer(
        &self,
        client: &reqwest::Client,
        account: &FcmServiceAccount,
    ) -> Result<String, FcmError> {
        if let Some(cached) = self.tokens.get(&account.client_email) {
            if cached.expires_at > Instant::now() + EXPIRY_SLACK {
                return Ok(cached.bearer.clone());
            }
        }
        let assertion = mint_assertion(account)?;
        let response = client
            .post(&account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| FcmError::Exchange(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FcmError::Exchange(format!(
                "token endpoint responded {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| FcmError::Exchange(err.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3_600));
        self.tokens.insert(
            account.client_email.clone(),
            CachedToken {
                bearer: token.access_token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(token.access_token)
    }
}

/// Builds the platform-tuned FCM v1 message body.
pub fn build_message(
    token: &str,
    platform: DevicePlatform,
    title: &str,
    body: &str,
    data: Option<&Value>,
) -> Value {
    let mut message = json!({
        "token": token,
        "notification": {"title": title, "body": body},
    });
    match platform {
        DevicePlatform::Android => {
            message["android"] = json!({"priority": "HIGH"});
        }
        DevicePlatform::Ios => {
            message["apns"] = json!({
                "headers": {"apns-priority": "10"},
                "payload": {"aps": {"sound": "default"}}
            });
        }
        DevicePlatform::Web | DevicePlatform::Other => {
            message["webpush"] = json!({"headers": {"Urgency": "high"}});
        }
    }
    if let Some(data) = data {
        message["data"] = data.clone();
    }
    json!({"message": message})
}

/// Sends one message. Distinguishes dead tokens from transient failures.
pub async fn send_message(
    client: &reqwest::Client,
    bearer: &str,
    project_id: &str,
    message: &Value,
) -> Result<(), FcmError> {
    let endpoint = format!("https://fcm.googleapis.com/v1/projects/{project_id}/messages:send");
    let response = client
        .post(endpoint)
        .bearer_auth(bearer)
        .json(message)
        .send()
        .await
        .map_err(|err| FcmError::Send(err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 404 || body.contains("UNREGISTERED") {
        return Err(FcmError::Unregistered);
    }
    Err(FcmError::Send(format!("{status}: {body}")))
}

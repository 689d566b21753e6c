//! The project metadata bag.
//!
//! # Purpose
//! Semi-structured per-project configuration with a typed surface: pool
//! sizing, external/replica connection strings, allowed origins, security
//! limits, push credentials, and webhook targets. Keys the gateway does not
//! recognise are preserved opaquely so older records survive newer writers.

use cascata_pool::PoolConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolSizing>,
    /// Ejected mode: the tenant's primary database, reached by URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_db_url: Option<String>,
    /// Optional read replica; GETs are routed here when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_db_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<AllowedOrigin>>,
    /// Gates the generated per-tenant OpenAPI document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_exposure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushCredentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhooks: Option<Vec<WebhookConfig>>,
    /// Unrecognised keys, preserved verbatim.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PoolSizing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
}

/// An allowed CORS origin: either a bare URL string or a record that also
/// demands authenticated traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum AllowedOrigin {
    Plain(String),
    Detailed {
        url: String,
        #[serde(default)]
        require_auth: bool,
    },
}

impl AllowedOrigin {
    pub fn url(&self) -> &str {
        match self {
            AllowedOrigin::Plain(url) => url,
            AllowedOrigin::Detailed { url, .. } => url,
        }
    }

    pub fn require_auth(&self) -> bool {
        matches!(self, AllowedOrigin::Detailed { require_auth: true, .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SecuritySettings {
    /// Override of the request body limit, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_json_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PushCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm: Option<FcmServiceAccount>,
}

/// FCM HTTP v1 service-account credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FcmServiceAccount {
    pub project_id: String,
    pub client_email: String,
    /// RS256 private key in PEM form. Never logged.
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// A table-event webhook target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC signing secret; never logged or echoed back.
    pub secret: String,
    /// Event kinds to deliver (`INSERT`/`UPDATE`/`DELETE`); empty means all.
    #[serde(default)]
    pub events: Vec<String>,
    /// Restrict to one table; unset delivers every table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    /// Named retry policy: `none`, `linear`, or `standard` (default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl WebhookConfig {
    pub fn matches(&self, table: &str, action: &str) -> bool {
        if let Some(own_table) = &self.table {
            if own_table != table {
                return false;
            }
        }
        self.events.is_empty() || self.events.iter().any(|event| event == action)
    }
}

impl ProjectMetadata {
    /// Pool options for the tenant's primary database.
    pub fn pool_config(&self) -> PoolConfig {
        self.pool_config_for(self.external_db_url.clone())
    }

    /// Pool options for the read replica, when one is configured.
    pub fn replica_pool_config(&self) -> Option<PoolConfig> {
        self.replica_db_url
            .clone()
            .map(|url| self.pool_config_for(Some(url)))
    }

    fn pool_config_for(&self, connection_string: Option<String>) -> PoolConfig {
        let sizing = self.pool.clone().unwrap_or_default();
        let defaults = PoolConfig::default();
        PoolConfig {
            max_connections: sizing.max_connections.unwrap_or(defaults.max_connections),
            idle_ms: sizing
                .idle_timeout_secs
                .map(|secs| secs * 1_000)
                .unwrap_or(defaults.idle_ms),
            statement_timeout_ms: sizing
                .statement_timeout_ms
                .unwrap_or(defaults.statement_timeout_ms),
            use_direct: false,
            connection_string,
        }
    }

    pub fn schema_exposed(&self) -> bool {
        self.schema_exposure == Some(true)
    }

    pub fn max_json_size(&self) -> Option<u64> {
        self.security.as_ref().and_then(|security| security.max_json_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_are_preserved() {
        let raw = json!({
            "schema_exposure": true,
            "future_feature": {"nested": [1, 2, 3]}
        });
        let metadata: ProjectMetadata = serde_json::from_value(raw).unwrap();
        assert!(metadata.schema_exposed());
        assert_eq!(
            metadata.extra.get("future_feature"),
            Some(&json!({"nested": [1, 2, 3]}))
        );
        let round_tripped = serde_json::to_value(&metadata).unwrap();
        assert_eq!(round_tripped["future_feature"]["nested"], json!([1, 2, 3]));
    }

    #[test]
    fn allowed_origin_accepts_both_shapes() {
        let origins: Vec<AllowedOrigin> = serde_json::from_value(json!([
            "https://app.example.com",
            {"url": "https://admin.example.com", "require_auth": true}
        ]))
        .unwrap();
        assert_eq!(origins[0].url(), "https://app.example.com");
        assert!(!origins[0].require_auth());
        assert!(origins[1].require_auth());
    }

    #[test]
    fn pool_config_applies_sizing_hints() {
        let metadata: ProjectMetadata = serde_json::from_value(json!({
            "pool": {"max_connections": 25, "idle_timeout_secs": 120, "statement_timeout_ms": 5000}
        }))
        .unwrap();
        let config = metadata.pool_config();
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.idle_ms, 120_000);
        assert_eq!(config.statement_timeout_ms, 5_000);
        assert!(config.connection_string.is_none());
    }

    #[test]
    fn external_url_marks_pool_external() {
        let metadata: ProjectMetadata = serde_json::from_value(json!({
            "external_db_url": "postgres://u:p@tenant.example.com/db"
        }))
        .unwrap();
        let config = metadata.pool_config();
        assert!(config.connection_string.is_some());
    }

    #[test]
    fn webhook_matching() {
        let hook: WebhookConfig = serde_json::from_value(json!({
            "url": "https://sink.example.com/hook",
            "secret": "s",
            "events": ["INSERT"],
            "table": "orders"
        }))
        .unwrap();
        assert!(hook.matches("orders", "INSERT"));
        assert!(!hook.matches("orders", "DELETE"));
        assert!(!hook.matches("customers", "INSERT"));

        let any: WebhookConfig =
            serde_json::from_value(json!({"url": "https://x", "secret": "s"})).unwrap();
        assert!(any.matches("anything", "UPDATE"));
    }
}

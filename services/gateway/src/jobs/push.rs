//! Push delivery worker.
//!
//! # Purpose
//! For each job: rebuild the tenant pool from the job's db selector, load
//! the recipient's active devices, exchange the service-account assertion
//! for an FCM bearer, deliver one platform-tuned message per device, prune
//! tokens FCM reports dead, and write an audit row into the control
//! database's history table.

use super::fcm::{self, FcmError, FcmTokenCache};
use crate::data::devices;
use crate::model::{FcmServiceAccount, Project};
use crate::store::{ControlStore, NotificationRecord};
use cascata_jobs::{JobEnvelope, JobFailure, JobHandler};
use cascata_pool::{PoolConfig, PoolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

/// Everything needed to reconstruct the tenant's pool without a directory
/// lookup, carried inside the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSelector {
    pub db_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_db_url: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

impl DbSelector {
    pub fn for_project(project: &Project) -> Self {
        let sizing = project.metadata.pool.clone().unwrap_or_default();
        Self {
            db_name: project.db_name.clone(),
            external_db_url: project.metadata.external_db_url.clone(),
            max_connections: sizing.max_connections,
            statement_timeout_ms: sizing.statement_timeout_ms,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            statement_timeout_ms: self
                .statement_timeout_ms
                .unwrap_or(defaults.statement_timeout_ms),
            connection_string: self.external_db_url.clone(),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushJobPayload {
    pub project_slug: String,
    pub user_id: String,
    pub notification: PushNotification,
    /// Service-account credentials captured at enqueue time. Absent when
    /// the project has no push provider configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm: Option<FcmServiceAccount>,
    pub db: DbSelector,
}

pub struct PushHandler {
    registry: Arc<PoolRegistry>,
    store: Arc<dyn ControlStore>,
    client: reqwest::Client,
    tokens: FcmTokenCache,
}

impl PushHandler {
    pub fn new(
        registry: Arc<PoolRegistry>,
        store: Arc<dyn ControlStore>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            registry,
            store,
            client,
            tokens: FcmTokenCache::new(),
        }
    }

    async fn audit(&self, payload: &PushJobPayload, status: &str, detail: Value) {
        let record = NotificationRecord {
            project_slug: payload.project_slug.clone(),
            user_id: payload.user_id.clone(),
            title: payload.notification.title.clone(),
            body: payload.notification.body.clone(),
            status: status.to_string(),
            detail: Some(detail),
        };
        if let Err(err) = self.store.record_notification(record).await {
            tracing::warn!(slug = %payload.project_slug, error = %err, "audit write failed");
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for PushHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<Value, JobFailure> {
        let payload: PushJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobFailure::permanent(format!("malformed push job: {err}")))?;

        let pool = self
            .registry
            .get(&payload.db.db_name, &payload.db.pool_config())
            .await
            .map_err(|err| JobFailure::transient(format!("pool acquire failed: {err}")))?;

        let devices = devices::active_devices(&pool, &payload.user_id)
            .await
            .map_err(|err| JobFailure::transient(format!("device load failed: {err}")))?;
        if devices.is_empty() {
            return Ok(json!({"reason": "no_devices"}));
        }

        let Some(account) = &payload.fcm else {
            return Err(JobFailure::permanent("no push credentials configured"));
        };
        let bearer = self
            .tokens
            .bearer(&self.client, account)
            .await
            .map_err(|err| match err {
                FcmError::BadKey => JobFailure::permanent(err.to_string()),
                other => JobFailure::transient(other.to_string()),
            })?;

        let mut sent = 0u32;
        let mut failed = 0u32;
        let mut pruned = 0u32;
        for device in &devices {
            let message = fcm::build_message(
                &device.token,
                device.platform,
                &payload.notification.title,
                &payload.notification.body,
                payload.notification.data.as_ref(),
            );
            match fcm::send_message(&self.client, &bearer, &account.project_id, &message).await {
                Ok(()) => sent += 1,
                Err(FcmError::Unregistered) => {
                    // Dead token: delete the row so it never fires again.
                    if let Err(err) =
                        devices::delete_device(&pool, &device.user_id, &device.token).await
                    {
                        tracing::warn!(error = %err, "device prune failed");
                    }
                    pruned += 1;
                }
                Err(err) => {
                    tracing::warn!(user = %payload.user_id, error = %err, "push send failed");
                    failed += 1;
                }
            }
        }

        let status = if failed == 0 { "completed" } else { "partial" };
        let detail = json!({"sent": sent, "failed": failed, "pruned": pruned});
        self.audit(&payload, status, detail.clone()).await;
        metrics::counter!("cascata_push_delivered").increment(sent as u64);

        if sent == 0 && failed > 0 {
            return Err(JobFailure::transient(format!(
                "all {failed} deliveries failed"
            )));
        }
        Ok(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectMetadata, ProjectSecrets, ProjectStatus};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn project_with_metadata(metadata: ProjectMetadata) -> Project {
        Project {
            id: Uuid::new_v4(),
            slug: "acme".to_string(),
            display_name: "Acme".to_string(),
            db_name: "tenant_acme".to_string(),
            custom_domain: None,
            status: ProjectStatus::Active,
            blocked_ips: Vec::new(),
            metadata,
            secrets: ProjectSecrets {
                anon_key: "a".to_string(),
                service_key: "s".to_string(),
                jwt_secret: "j".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn selector_captures_pool_hints() {
        let metadata: ProjectMetadata = serde_json::from_value(json!({
            "pool": {"max_connections": 3, "statement_timeout_ms": 2500},
            "external_db_url": "postgres://u:p@ext.example.com/db"
        }))
        .unwrap();
        let selector = DbSelector::for_project(&project_with_metadata(metadata));
        assert_eq!(selector.db_name, "tenant_acme");
        let config = selector.pool_config();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.statement_timeout_ms, 2_500);
        assert_eq!(
            config.connection_string.as_deref(),
            Some("postgres://u:p@ext.example.com/db")
        );
    }

    #[test]
    fn payload_round_trips() {
        let payload = PushJobPayload {
            project_slug: "acme".to_string(),
            user_id: "u1".to_string(),
            notification: PushNotification {
                title: "Order 42".to_string(),
                body: "Status paid".to_string(),
                data: None,
            },
            fcm: None,
            db: DbSelector {
                db_name: "tenant_acme".to_string(),
                external_db_url: None,
                max_connections: None,
                statement_timeout_ms: None,
            },
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        let decoded: PushJobPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.notification.title, "Order 42");
        assert_eq!(decoded.db.db_name, "tenant_acme");
    }
}

//! Control-plane store.
//!
//! # Purpose
//! Durable home of project records, notification rules, delivery history,
//! and admin users. Two implementations: Postgres for real deployments and
//! an in-memory store for development and router tests. Secrets are
//! encrypted at rest; both implementations hand out projects with secrets
//! already decrypted so request paths never touch the cipher.

use crate::error::ApiError;
use crate::model::{NotificationRule, Project, ProjectMetadata, ProjectSecrets, RuleCondition, RuleEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => ApiError::NotFound(message),
            StoreError::Conflict(message) => ApiError::Conflict(message),
            StoreError::Invalid(message) => ApiError::Validation(message),
            StoreError::Unexpected(err) => {
                tracing::error!(error = ?err, "control store failure");
                ApiError::Internal("control store failure".to_string())
            }
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db_err.message().to_string())
            }
            _ => StoreError::Unexpected(err.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub metadata: ProjectMetadata,
}

/// Partial project update. `custom_domain: Some("")` clears the domain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub status: Option<crate::model::ProjectStatus>,
    #[serde(default)]
    pub metadata: Option<ProjectMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Anon,
    Service,
    Jwt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub project_slug: String,
    pub table_name: String,
    pub event: RuleEvent,
    pub recipient_column: String,
    pub title_template: String,
    pub body_template: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub data_payload: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub title_template: Option<String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub conditions: Option<Vec<RuleCondition>>,
    #[serde(default)]
    pub data_payload: Option<Value>,
}

/// Audit row for one push delivery attempt.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub project_slug: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    /// `completed` or `partial`.
    pub status: String,
    pub detail: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct AdminUser {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Generates the three per-project secrets in plaintext. Encryption is the
/// store's concern.
pub fn fresh_secrets() -> ProjectSecrets {
    ProjectSecrets {
        anon_key: crate::crypto::generate_api_key(),
        service_key: crate::crypto::generate_api_key(),
        jwt_secret: crate::crypto::generate_api_key(),
    }
}

/// Physical database name for a managed tenant.
pub fn tenant_db_name(slug: &str) -> String {
    format!("tenant_{}", slug.replace('-', "_"))
}

#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn list_projects(&self) -> StoreResult<Vec<Project>>;
    async fn get_project(&self, slug: &str) -> StoreResult<Project>;
    async fn find_by_domain(&self, host: &str) -> StoreResult<Option<Project>>;
    async fn create_project(&self, new: NewProject) -> StoreResult<Project>;
    async fn update_project(&self, slug: &str, patch: ProjectPatch) -> StoreResult<Project>;
    /// Returns the deleted record so callers can tear down its pools.
    async fn delete_project(&self, slug: &str) -> StoreResult<Project>;
    /// Replaces one secret and returns the new plaintext.
    async fn rotate_key(&self, slug: &str, kind: KeyKind) -> StoreResult<String>;
    async fn block_ip(&self, slug: &str, ip: &str) -> StoreResult<()>;
    async fn unblock_ip(&self, slug: &str, ip: &str) -> StoreResult<()>;

    async fn list_rules(&self, slug: &str) -> StoreResult<Vec<NotificationRule>>;
    /// Active rules for one `(project, table)`; event filtering is the rule
    /// engine's job because `ALL` is a wildcard.
    async fn active_rules(&self, slug: &str, table: &str) -> StoreResult<Vec<NotificationRule>>;
    async fn has_active_rules(&self, slug: &str) -> StoreResult<bool>;
    async fn create_rule(&self, rule: NewRule) -> StoreResult<NotificationRule>;
    async fn update_rule(&self, slug: &str, id: Uuid, patch: RulePatch)
    -> StoreResult<NotificationRule>;
    async fn delete_rule(&self, slug: &str, id: Uuid) -> StoreResult<()>;

    async fn record_notification(&self, record: NotificationRecord) -> StoreResult<()>;

    /// Best-effort creation of a tenant's physical database. Pre-existing
    /// databases are not an error.
    async fn provision_database(&self, db_name: &str) -> StoreResult<()>;

    async fn find_admin(&self, username: &str) -> StoreResult<Option<AdminUser>>;
    async fn create_admin(&self, username: &str, password_hash: &str) -> StoreResult<()>;
    async fn admin_count(&self) -> StoreResult<i64>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Applies a patch to a project value; shared by both store backends so the
/// merge semantics cannot drift.
pub(crate) fn apply_patch(project: &mut Project, patch: ProjectPatch) {
    if let Some(display_name) = patch.display_name {
        project.display_name = display_name;
    }
    if let Some(domain) = patch.custom_domain {
        project.custom_domain = if domain.is_empty() { None } else { Some(domain) };
    }
    if let Some(status) = patch.status {
        project.status = status;
    }
    if let Some(metadata) = patch.metadata {
        project.metadata = metadata;
    }
    project.updated_at = Utc::now();
}

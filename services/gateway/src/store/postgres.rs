//! Postgres-backed control store.
//!
//! # Purpose
//! Authoritative storage for control-plane metadata. Secrets are encrypted
//! with the process key before they touch a row; reads decrypt eagerly so
//! the rest of the gateway only ever sees plaintext `ProjectSecrets`.
//!
//! Row structs are kept separate from domain types so schema details stay
//! localised here. Migrations are embedded and run once at boot.

use super::{
    AdminUser, ControlStore, KeyKind, NewProject, NewRule, NotificationRecord, ProjectPatch,
    RulePatch, StoreError, StoreResult, apply_patch, fresh_secrets, tenant_db_name,
};
use crate::crypto::SecretBox;
use crate::model::{
    NotificationRule, Project, ProjectMetadata, ProjectSecrets, ProjectStatus, RuleEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
    secrets: SecretBox,
}

/// Row shape for the `projects` table.
#[derive(Debug, Clone, FromRow)]
struct DbProject {
    id: Uuid,
    slug: String,
    display_name: String,
    db_name: String,
    custom_domain: Option<String>,
    status: String,
    blocked_ips: Value,
    anon_key_enc: String,
    service_key_enc: String,
    jwt_secret_enc: String,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DbProject {
    fn into_project(self, secrets: &SecretBox) -> StoreResult<Project> {
        let decrypt = |encoded: &str| {
            secrets
                .decrypt(encoded)
                .map_err(|err| StoreError::Invalid(format!("secret decryption failed: {err}")))
        };
        let metadata: ProjectMetadata = serde_json::from_value(self.metadata)
            .map_err(|err| StoreError::Invalid(format!("metadata: {err}")))?;
        let blocked_ips: Vec<String> =
            serde_json::from_value(self.blocked_ips).unwrap_or_default();
        Ok(Project {
            id: self.id,
            slug: self.slug,
            display_name: self.display_name,
            db_name: self.db_name,
            custom_domain: self.custom_domain,
            status: ProjectStatus::parse(&self.status),
            blocked_ips,
            metadata,
            secrets: ProjectSecrets {
                anon_key: decrypt(&self.anon_key_enc)?,
                service_key: decrypt(&self.service_key_enc)?,
                jwt_secret: decrypt(&self.jwt_secret_enc)?,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row shape for `notification_rules`.
#[derive(Debug, Clone, FromRow)]
struct DbRule {
    id: Uuid,
    project_slug: String,
    table_name: String,
    event: String,
    recipient_column: String,
    title_template: String,
    body_template: String,
    conditions: Value,
    data_payload: Option<Value>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl DbRule {
    fn into_rule(self) -> StoreResult<NotificationRule> {
        let conditions = serde_json::from_value(self.conditions)
            .map_err(|err| StoreError::Invalid(format!("rule conditions: {err}")))?;
        Ok(NotificationRule {
            id: self.id,
            project_slug: self.project_slug,
            table_name: self.table_name,
            event: RuleEvent::parse(&self.event),
            recipient_column: self.recipient_column,
            title_template: self.title_template,
            body_template: self.body_template,
            conditions,
            data_payload: self.data_payload,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct DbAdmin {
    id: Uuid,
    username: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

const PROJECT_COLUMNS: &str = "id, slug, display_name, db_name, custom_domain, status, \
     blocked_ips, anon_key_enc, service_key_enc, jwt_secret_enc, metadata, created_at, updated_at";

const RULE_COLUMNS: &str = "id, project_slug, table_name, event, recipient_column, \
     title_template, body_template, conditions, data_payload, is_active, created_at";

impl PostgresStore {
    /// Connects, runs migrations, and returns the store. Pool timeouts are
    /// explicit; a hanging control database must not hang boot forever.
    pub async fn connect(url: &str, secrets: SecretBox) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(Self { pool, secrets })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_project(&self, slug: &str) -> StoreResult<Project> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE slug = $1");
        let row = sqlx::query_as::<_, DbProject>(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        row.into_project(&self.secrets)
    }

    async fn write_blocked_ips(&self, slug: &str, blocked: &[String]) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE projects SET blocked_ips = $2, updated_at = now() WHERE slug = $1",
        )
        .bind(slug)
        .bind(serde_json::to_value(blocked).unwrap_or(Value::Array(Vec::new())))
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {slug}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlStore for PostgresStore {
    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY slug");
        let rows = sqlx::query_as::<_, DbProject>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.into_project(&self.secrets))
            .collect()
    }

    async fn get_project(&self, slug: &str) -> StoreResult<Project> {
        self.fetch_project(slug).await
    }

    async fn find_by_domain(&self, host: &str) -> StoreResult<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE custom_domain = $1");
        let row = sqlx::query_as::<_, DbProject>(&sql)
            .bind(host)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.into_project(&self.secrets)).transpose()
    }

    async fn create_project(&self, new: NewProject) -> StoreResult<Project> {
        if !Project::valid_slug(&new.slug) {
            return Err(StoreError::Invalid(format!("invalid slug: {}", new.slug)));
        }
        let plaintext = fresh_secrets();
        let encrypt = |value: &str| {
            self.secrets
                .encrypt(value)
                .map_err(|err| StoreError::Invalid(format!("secret encryption failed: {err}")))
        };
        let metadata = serde_json::to_value(&new.metadata)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let sql = format!(
            "INSERT INTO projects \
             (slug, display_name, db_name, custom_domain, status, blocked_ips, \
              anon_key_enc, service_key_enc, jwt_secret_enc, metadata) \
             VALUES ($1, $2, $3, $4, 'active', '[]'::jsonb, $5, $6, $7, $8) \
             RETURNING {PROJECT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbProject>(&sql)
            .bind(&new.slug)
            .bind(&new.display_name)
            .bind(tenant_db_name(&new.slug))
            .bind(&new.custom_domain)
            .bind(encrypt(&plaintext.anon_key)?)
            .bind(encrypt(&plaintext.service_key)?)
            .bind(encrypt(&plaintext.jwt_secret)?)
            .bind(metadata)
            .fetch_one(&self.pool)
            .await?;
        row.into_project(&self.secrets)
    }

    async fn update_project(&self, slug: &str, patch: ProjectPatch) -> StoreResult<Project> {
        let mut project = self.fetch_project(slug).await?;
        apply_patch(&mut project, patch);
        let metadata = serde_json::to_value(&project.metadata)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        sqlx::query(
            "UPDATE projects SET display_name = $2, custom_domain = $3, status = $4, \
             metadata = $5, updated_at = now() WHERE slug = $1",
        )
        .bind(slug)
        .bind(&project.display_name)
        .bind(&project.custom_domain)
        .bind(project.status.as_str())
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        self.fetch_project(slug).await
    }

    async fn delete_project(&self, slug: &str) -> StoreResult<Project> {
        let project = self.fetch_project(slug).await?;
        sqlx::query("DELETE FROM projects WHERE slug = $1")
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(project)
    }

    async fn rotate_key(&self, slug: &str, kind: KeyKind) -> StoreResult<String> {
        let plaintext = crate::crypto::generate_api_key();
        let encrypted = self
            .secrets
            .encrypt(&plaintext)
            .map_err(|err| StoreError::Invalid(format!("secret encryption failed: {err}")))?;
        let column = match kind {
            KeyKind::Anon => "anon_key_enc",
            KeyKind::Service => "service_key_enc",
            KeyKind::Jwt => "jwt_secret_enc",
        };
        let sql =
            format!("UPDATE projects SET {column} = $2, updated_at = now() WHERE slug = $1");
        let updated = sqlx::query(&sql)
            .bind(slug)
            .bind(&encrypted)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {slug}")));
        }
        Ok(plaintext)
    }

    async fn block_ip(&self, slug: &str, ip: &str) -> StoreResult<()> {
        let project = self.fetch_project(slug).await?;
        let mut blocked = project.blocked_ips;
        if !blocked.iter().any(|existing| existing == ip) {
            blocked.push(ip.to_string());
        }
        self.write_blocked_ips(slug, &blocked).await
    }

    async fn unblock_ip(&self, slug: &str, ip: &str) -> StoreResult<()> {
        let project = self.fetch_project(slug).await?;
        let blocked: Vec<String> = project
            .blocked_ips
            .into_iter()
            .filter(|existing| existing != ip)
            .collect();
        self.write_blocked_ips(slug, &blocked).await
    }

    async fn list_rules(&self, slug: &str) -> StoreResult<Vec<NotificationRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM notification_rules \
             WHERE project_slug = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, DbRule>(&sql)
            .bind(slug)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DbRule::into_rule).collect()
    }

    async fn active_rules(&self, slug: &str, table: &str) -> StoreResult<Vec<NotificationRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM notification_rules \
             WHERE project_slug = $1 AND table_name = $2 AND is_active"
        );
        let rows = sqlx::query_as::<_, DbRule>(&sql)
            .bind(slug)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DbRule::into_rule).collect()
    }

    async fn has_active_rules(&self, slug: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notification_rules WHERE project_slug = $1 AND is_active)",
        )
        .bind(slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_rule(&self, rule: NewRule) -> StoreResult<NotificationRule> {
        let conditions = serde_json::to_value(&rule.conditions)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let sql = format!(
            "INSERT INTO notification_rules \
             (project_slug, table_name, event, recipient_column, title_template, \
              body_template, conditions, data_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {RULE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbRule>(&sql)
            .bind(&rule.project_slug)
            .bind(&rule.table_name)
            .bind(rule.event.as_str())
            .bind(&rule.recipient_column)
            .bind(&rule.title_template)
            .bind(&rule.body_template)
            .bind(conditions)
            .bind(&rule.data_payload)
            .fetch_one(&self.pool)
            .await?;
        row.into_rule()
    }

    async fn update_rule(
        &self,
        slug: &str,
        id: Uuid,
        patch: RulePatch,
    ) -> StoreResult<NotificationRule> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM notification_rules WHERE project_slug = $1 AND id = $2"
        );
        let row = sqlx::query_as::<_, DbRule>(&sql)
            .bind(slug)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rule {id}")))?;
        let mut rule = row.into_rule()?;
        if let Some(is_active) = patch.is_active {
            rule.is_active = is_active;
        }
        if let Some(title) = patch.title_template {
            rule.title_template = title;
        }
        if let Some(body) = patch.body_template {
            rule.body_template = body;
        }
        if let Some(conditions) = patch.conditions {
            rule.conditions = conditions;
        }
        if let Some(data_payload) = patch.data_payload {
            rule.data_payload = Some(data_payload);
        }
        let conditions = serde_json::to_value(&rule.conditions)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        sqlx::query(
            "UPDATE notification_rules SET is_active = $3, title_template = $4, \
             body_template = $5, conditions = $6, data_payload = $7 \
             WHERE project_slug = $1 AND id = $2",
        )
        .bind(slug)
        .bind(id)
        .bind(rule.is_active)
        .bind(&rule.title_template)
        .bind(&rule.body_template)
        .bind(conditions)
        .bind(&rule.data_payload)
        .execute(&self.pool)
        .await?;
        Ok(rule)
    }

    async fn delete_rule(&self, slug: &str, id: Uuid) -> StoreResult<()> {
        let deleted = sqlx::query(
            "DELETE FROM notification_rules WHERE project_slug = $1 AND id = $2",
        )
        .bind(slug)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    async fn provision_database(&self, db_name: &str) -> StoreResult<()> {
        // db_name is derived from a validated slug; quote it anyway.
        let quoted = format!("\"{}\"", db_name.replace('"', ""));
        let result = sqlx::query(&format!("CREATE DATABASE {quoted}"))
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P04") => {
                // duplicate_database: already provisioned.
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn record_notification(&self, record: NotificationRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO notification_history \
             (project_slug, user_id, title, body, status, detail) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.project_slug)
        .bind(&record.user_id)
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.status)
        .bind(&record.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_admin(&self, username: &str) -> StoreResult<Option<AdminUser>> {
        let row = sqlx::query_as::<_, DbAdmin>(
            "SELECT id, username, password_hash, created_at FROM admin_users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| AdminUser {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }))
    }

    async fn create_admin(&self, username: &str, password_hash: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO admin_users (username, password_hash) VALUES ($1, $2)")
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn admin_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admin_users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

//! In-memory control store.
//!
//! # Purpose
//! Development and test backend with the same semantics as Postgres, minus
//! durability. State resets on process restart.

use super::{
    AdminUser, ControlStore, KeyKind, NewProject, NewRule, NotificationRecord, ProjectPatch,
    RulePatch, StoreError, StoreResult, apply_patch, fresh_secrets, tenant_db_name,
};
use crate::model::{NotificationRule, Project, ProjectStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    rules: Vec<NotificationRule>,
    history: Vec<NotificationRecord>,
    admins: Vec<AdminUser>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: the number of recorded notification audit rows.
    pub fn history_len(&self) -> usize {
        self.inner.lock().expect("store lock").history.len()
    }
}

#[async_trait]
impl ControlStore for InMemoryStore {
    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let inner = self.inner.lock().expect("store lock");
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(projects)
    }

    async fn get_project(&self, slug: &str) -> StoreResult<Project> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .projects
            .get(slug)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))
    }

    async fn find_by_domain(&self, host: &str) -> StoreResult<Option<Project>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .projects
            .values()
            .find(|project| project.custom_domain.as_deref() == Some(host))
            .cloned())
    }

    async fn create_project(&self, new: NewProject) -> StoreResult<Project> {
        if !Project::valid_slug(&new.slug) {
            return Err(StoreError::Invalid(format!("invalid slug: {}", new.slug)));
        }
        let mut inner = self.inner.lock().expect("store lock");
        if inner.projects.contains_key(&new.slug) {
            return Err(StoreError::Conflict(format!("project {} exists", new.slug)));
        }
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            slug: new.slug.clone(),
            display_name: new.display_name,
            db_name: tenant_db_name(&new.slug),
            custom_domain: new.custom_domain,
            status: ProjectStatus::Active,
            blocked_ips: Vec::new(),
            metadata: new.metadata,
            secrets: fresh_secrets(),
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(new.slug, project.clone());
        Ok(project)
    }

    async fn update_project(&self, slug: &str, patch: ProjectPatch) -> StoreResult<Project> {
        let mut inner = self.inner.lock().expect("store lock");
        let project = inner
            .projects
            .get_mut(slug)
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        apply_patch(project, patch);
        Ok(project.clone())
    }

    async fn delete_project(&self, slug: &str) -> StoreResult<Project> {
        let mut inner = self.inner.lock().expect("store lock");
        let project = inner
            .projects
            .remove(slug)
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        inner.rules.retain(|rule| rule.project_slug != slug);
        Ok(project)
    }

    async fn rotate_key(&self, slug: &str, kind: KeyKind) -> StoreResult<String> {
        let mut inner = self.inner.lock().expect("store lock");
        let project = inner
            .projects
            .get_mut(slug)
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        let plaintext = crate::crypto::generate_api_key();
        match kind {
            KeyKind::Anon => project.secrets.anon_key = plaintext.clone(),
            KeyKind::Service => project.secrets.service_key = plaintext.clone(),
            KeyKind::Jwt => project.secrets.jwt_secret = plaintext.clone(),
        }
        project.updated_at = Utc::now();
        Ok(plaintext)
    }

    async fn block_ip(&self, slug: &str, ip: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let project = inner
            .projects
            .get_mut(slug)
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        if !project.blocked_ips.iter().any(|existing| existing == ip) {
            project.blocked_ips.push(ip.to_string());
        }
        Ok(())
    }

    async fn unblock_ip(&self, slug: &str, ip: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let project = inner
            .projects
            .get_mut(slug)
            .ok_or_else(|| StoreError::NotFound(format!("project {slug}")))?;
        project.blocked_ips.retain(|existing| existing != ip);
        Ok(())
    }

    async fn list_rules(&self, slug: &str) -> StoreResult<Vec<NotificationRule>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .rules
            .iter()
            .filter(|rule| rule.project_slug == slug)
            .cloned()
            .collect())
    }

    async fn active_rules(&self, slug: &str, table: &str) -> StoreResult<Vec<NotificationRule>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .rules
            .iter()
            .filter(|rule| {
                rule.project_slug == slug && rule.table_name == table && rule.is_active
            })
            .cloned()
            .collect())
    }

    async fn has_active_rules(&self, slug: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .rules
            .iter()
            .any(|rule| rule.project_slug == slug && rule.is_active))
    }

    async fn create_rule(&self, rule: NewRule) -> StoreResult<NotificationRule> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.projects.contains_key(&rule.project_slug) {
            return Err(StoreError::NotFound(format!("project {}", rule.project_slug)));
        }
        let created = NotificationRule {
            id: Uuid::new_v4(),
            project_slug: rule.project_slug,
            table_name: rule.table_name,
            event: rule.event,
            recipient_column: rule.recipient_column,
            title_template: rule.title_template,
            body_template: rule.body_template,
            conditions: rule.conditions,
            data_payload: rule.data_payload,
            is_active: true,
            created_at: Utc::now(),
        };
        inner.rules.push(created.clone());
        Ok(created)
    }

    async fn update_rule(
        &self,
        slug: &str,
        id: Uuid,
        patch: RulePatch,
    ) -> StoreResult<NotificationRule> {
        let mut inner = self.inner.lock().expect("store lock");
        let rule = inner
            .rules
            .iter_mut()
            .find(|rule| rule.project_slug == slug && rule.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("rule {id}")))?;
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
        Ok(rule.clone())
    }

    async fn delete_rule(&self, slug: &str, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let before = inner.rules.len();
        inner
            .rules
            .retain(|rule| !(rule.project_slug == slug && rule.id == id));
        if inner.rules.len() == before {
            return Err(StoreError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    async fn provision_database(&self, _db_name: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn record_notification(&self, record: NotificationRecord) -> StoreResult<()> {
        self.inner.lock().expect("store lock").history.push(record);
        Ok(())
    }

    async fn find_admin(&self, username: &str) -> StoreResult<Option<AdminUser>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .admins
            .iter()
            .find(|admin| admin.username == username)
            .cloned())
    }

    async fn create_admin(&self, username: &str, password_hash: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.admins.iter().any(|admin| admin.username == username) {
            return Err(StoreError::Conflict(format!("admin {username} exists")));
        }
        inner.admins.push(AdminUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn admin_count(&self) -> StoreResult<i64> {
        Ok(self.inner.lock().expect("store lock").admins.len() as i64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleEvent;

    fn new_project(slug: &str) -> NewProject {
        NewProject {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            custom_domain: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = InMemoryStore::new();
        let created = store.create_project(new_project("acme")).await.unwrap();
        assert_eq!(created.db_name, "tenant_acme");
        assert_eq!(created.secrets.anon_key.len(), 64);
        let fetched = store.get_project("acme").await.unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let store = InMemoryStore::new();
        store.create_project(new_project("acme")).await.unwrap();
        let err = store.create_project(new_project("acme")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_slug_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .create_project(new_project("Not A Slug"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn rotate_key_changes_only_target() {
        let store = InMemoryStore::new();
        let created = store.create_project(new_project("acme")).await.unwrap();
        let rotated = store.rotate_key("acme", KeyKind::Anon).await.unwrap();
        let fetched = store.get_project("acme").await.unwrap();
        assert_eq!(fetched.secrets.anon_key, rotated);
        assert_ne!(fetched.secrets.anon_key, created.secrets.anon_key);
        assert_eq!(fetched.secrets.service_key, created.secrets.service_key);
    }

    #[tokio::test]
    async fn blocklist_round_trip() {
        let store = InMemoryStore::new();
        store.create_project(new_project("acme")).await.unwrap();
        store.block_ip("acme", "203.0.113.7").await.unwrap();
        store.block_ip("acme", "203.0.113.7").await.unwrap();
        let project = store.get_project("acme").await.unwrap();
        assert_eq!(project.blocked_ips, vec!["203.0.113.7".to_string()]);
        store.unblock_ip("acme", "203.0.113.7").await.unwrap();
        assert!(store.get_project("acme").await.unwrap().blocked_ips.is_empty());
    }

    #[tokio::test]
    async fn rules_follow_project_lifecycle() {
        let store = InMemoryStore::new();
        store.create_project(new_project("acme")).await.unwrap();
        let rule = store
            .create_rule(NewRule {
                project_slug: "acme".to_string(),
                table_name: "orders".to_string(),
                event: RuleEvent::Insert,
                recipient_column: "user_id".to_string(),
                title_template: "Order {{id}}".to_string(),
                body_template: "Status {{status}}".to_string(),
                conditions: Vec::new(),
                data_payload: None,
            })
            .await
            .unwrap();
        assert!(store.has_active_rules("acme").await.unwrap());
        assert_eq!(store.active_rules("acme", "orders").await.unwrap().len(), 1);
        assert!(store.active_rules("acme", "other").await.unwrap().is_empty());

        store
            .update_rule("acme", rule.id, RulePatch {
                is_active: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!store.has_active_rules("acme").await.unwrap());

        store.delete_project("acme").await.unwrap();
        assert!(store.list_rules("acme").await.unwrap().is_empty());
    }
}

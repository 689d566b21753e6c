//! Rule-driven notification triggering and webhook fan-out.
//!
//! # Purpose
//! Consumes the bridge's event stream. For each row change: matching
//! webhooks from the project metadata are enqueued for delivery, and active
//! notification rules are evaluated — fetch the fresh row, check every
//! condition, render the `{{field}}` templates, enqueue a push job. Nothing
//! is ever sent synchronously from here.

use crate::directory::TenantDirectory;
use crate::jobs::{DbSelector, PushJobPayload, PushNotification, QueueSet, WebhookJobPayload};
use crate::model::{ChangeEvent, ConditionOp, NotificationRule, Project, RuleCondition};
use crate::store::ControlStore;
use cascata_jobs::RetryPolicy;
use cascata_pool::PoolRegistry;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct EventDispatcher {
    store: Arc<dyn ControlStore>,
    directory: Arc<TenantDirectory>,
    registry: Arc<PoolRegistry>,
    queues: Option<Arc<QueueSet>>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn ControlStore>,
        directory: Arc<TenantDirectory>,
        registry: Arc<PoolRegistry>,
        queues: Option<Arc<QueueSet>>,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            queues,
        }
    }

    /// Drains the bridge's event stream until the sender side closes.
    pub fn spawn(
        self,
        mut events: mpsc::UnboundedReceiver<(String, ChangeEvent)>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((slug, event)) = events.recv().await {
                if let Err(err) = self.dispatch(&slug, &event).await {
                    tracing::warn!(slug = %slug, error = %err, "event dispatch failed");
                }
            }
        })
    }

    async fn dispatch(&self, slug: &str, event: &ChangeEvent) -> Result<(), crate::error::ApiError> {
        let Some(project) = self.directory.by_slug(slug).await? else {
            return Ok(());
        };
        self.dispatch_webhooks(&project, event).await;
        self.dispatch_rules(&project, event).await?;
        Ok(())
    }

    async fn dispatch_webhooks(&self, project: &Project, event: &ChangeEvent) {
        let Some(queues) = &self.queues else { return };
        let Some(hooks) = &project.metadata.webhooks else {
            return;
        };
        for hook in hooks {
            if !hook.matches(&event.table, &event.action) {
                continue;
            }
            let payload = WebhookJobPayload {
                target_url: hook.url.clone(),
                payload: json!({
                    "project": project.slug,
                    "table": event.table,
                    "action": event.action,
                    "record_id": event.record_id,
                    "timestamp": event.timestamp,
                }),
                secret: hook.secret.clone(),
                event_type: event.action.clone(),
                table_name: event.table.clone(),
                fallback_url: hook.fallback_url.clone(),
            };
            let policy = RetryPolicy::from_name(hook.policy.as_deref().unwrap_or("standard"));
            match serde_json::to_value(&payload) {
                Ok(encoded) => {
                    if let Err(err) = queues.webhooks.enqueue(encoded, policy).await {
                        tracing::warn!(slug = %project.slug, error = %err, "webhook enqueue failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "webhook payload encode failed"),
            }
        }
    }

    async fn dispatch_rules(
        &self,
        project: &Project,
        event: &ChangeEvent,
    ) -> Result<(), crate::error::ApiError> {
        let Some(queues) = &self.queues else {
            return Ok(());
        };
        let rules = self.store.active_rules(&project.slug, &event.table).await?;
        let rules: Vec<&NotificationRule> = rules
            .iter()
            .filter(|rule| rule.event.matches(&event.action))
            .collect();
        if rules.is_empty() {
            return Ok(());
        }
        // The row is gone for DELETE; there is nothing to render from.
        if event.action == "DELETE" {
            return Ok(());
        }
        let Some(row) = self.fetch_row(project, event).await? else {
            return Ok(());
        };

        for rule in rules {
            if !conditions_match(&rule.conditions, &row) {
                continue;
            }
            let recipient = value_to_string(row.get(&rule.recipient_column).unwrap_or(&Value::Null));
            if recipient.is_empty() {
                continue;
            }
            let payload = PushJobPayload {
                project_slug: project.slug.clone(),
                user_id: recipient,
                notification: PushNotification {
                    title: render_template(&rule.title_template, &row),
                    body: render_template(&rule.body_template, &row),
                    data: rule.data_payload.clone(),
                },
                fcm: project.metadata.push.as_ref().and_then(|push| push.fcm.clone()),
                db: DbSelector::for_project(project),
            };
            match serde_json::to_value(&payload) {
                Ok(encoded) => {
                    if let Err(err) = queues.push.enqueue(encoded, RetryPolicy::push()).await {
                        tracing::warn!(slug = %project.slug, error = %err, "push enqueue failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "push payload encode failed"),
            }
        }
        Ok(())
    }

    /// Fetches the fresh row by primary key from the tenant's primary.
    async fn fetch_row(
        &self,
        project: &Project,
        event: &ChangeEvent,
    ) -> Result<Option<Map<String, Value>>, crate::error::ApiError> {
        let target = project.pool_target(false);
        let pool = self.registry.get(&target.db, &target.config).await?;
        let sql = format!(
            "SELECT COALESCE(jsonb_agg(_r), '[]'::jsonb) FROM \
             (SELECT * FROM {} WHERE \"id\" = $1) AS _r",
            cascata_query::quote_ident(&cascata_query::sanitize_column(&event.table))
        );
        let query = sqlx::query_scalar::<_, Value>(&sql);
        let query = match &event.record_id {
            Value::Number(number) if number.is_i64() => {
                query.bind(number.as_i64().unwrap_or_default())
            }
            Value::String(text) => query.bind(text.clone()),
            other => query.bind(other.clone()),
        };
        let rows: Value = query
            .fetch_one(&pool)
            .await
            .map_err(crate::error::map_db_error)?;
        Ok(rows
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.as_object())
            .cloned())
    }
}

/// Replaces `{{field}}` with the stringified field value; null and missing
/// fields render as the empty string.
pub fn render_template(template: &str, row: &Map<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in row {
        let needle = format!("{{{{{key}}}}}");
        if rendered.contains(&needle) {
            rendered = rendered.replace(&needle, &value_to_string(value));
        }
    }
    rendered
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    Some(value_to_string(left).cmp(&value_to_string(right)))
}

/// All conditions must hold against the fresh row.
pub fn conditions_match(conditions: &[RuleCondition], row: &Map<String, Value>) -> bool {
    conditions.iter().all(|condition| {
        let actual = row.get(&condition.field).unwrap_or(&Value::Null);
        match condition.op {
            ConditionOp::Eq => {
                actual == &condition.value
                    || value_to_string(actual) == value_to_string(&condition.value)
            }
            ConditionOp::Neq => {
                actual != &condition.value
                    && value_to_string(actual) != value_to_string(&condition.value)
            }
            ConditionOp::Gt => {
                compare(actual, &condition.value) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOp::Gte => matches!(
                compare(actual, &condition.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            ConditionOp::Lt => compare(actual, &condition.value) == Some(std::cmp::Ordering::Less),
            ConditionOp::Lte => matches!(
                compare(actual, &condition.value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            ConditionOp::Contains => match actual {
                Value::String(text) => text.contains(&value_to_string(&condition.value)),
                Value::Array(items) => items.contains(&condition.value),
                _ => false,
            },
        }
    })
}

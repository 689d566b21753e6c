//! Notification rules.
//!
//! A rule binds `(project, table, event)` to a templated push message.
//! Conditions are evaluated against the fresh row; all must hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleEvent {
    Insert,
    Update,
    Delete,
    All,
}

impl RuleEvent {
    pub fn matches(&self, action: &str) -> bool {
        match self {
            RuleEvent::Insert => action == "INSERT",
            RuleEvent::Update => action == "UPDATE",
            RuleEvent::Delete => action == "DELETE",
            RuleEvent::All => matches!(action, "INSERT" | "UPDATE" | "DELETE"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleEvent::Insert => "INSERT",
            RuleEvent::Update => "UPDATE",
            RuleEvent::Delete => "DELETE",
            RuleEvent::All => "ALL",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "INSERT" => RuleEvent::Insert,
            "UPDATE" => RuleEvent::Update,
            "DELETE" => RuleEvent::Delete,
            _ => RuleEvent::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleCondition {
    pub field: String,
    pub op: ConditionOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotificationRule {
    pub id: Uuid,
    pub project_slug: String,
    pub table_name: String,
    pub event: RuleEvent,
    /// Row column holding the push recipient's user id.
    pub recipient_column: String,
    pub title_template: String,
    pub body_template: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Extra payload attached verbatim to the notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_payload: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_matching() {
        assert!(RuleEvent::Insert.matches("INSERT"));
        assert!(!RuleEvent::Insert.matches("DELETE"));
        assert!(RuleEvent::All.matches("UPDATE"));
        assert!(!RuleEvent::All.matches("TRUNCATE"));
    }

    #[test]
    fn event_serialises_uppercase() {
        assert_eq!(
            serde_json::to_string(&RuleEvent::Insert).unwrap(),
            "\"INSERT\""
        );
        let parsed: RuleEvent = serde_json::from_str("\"ALL\"").unwrap();
        assert_eq!(parsed, RuleEvent::All);
    }
}

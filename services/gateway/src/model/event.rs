//! Row-change events carried on the tenant NOTIFY channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The payload `pg_notify('cascata_events', …)` emits from row triggers and
/// that the bridge fans out verbatim to SSE subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// `INSERT`, `UPDATE`, or `DELETE` (trigger `TG_OP`).
    pub action: String,
    /// `coalesce(NEW.id, OLD.id)`; shape depends on the table's key type.
    #[serde(default)]
    pub record_id: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trigger_payload() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"table":"customers","schema":"public","action":"INSERT","record_id":42,"timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(event.table, "customers");
        assert_eq!(event.action, "INSERT");
        assert_eq!(event.record_id, serde_json::json!(42));
    }

    #[test]
    fn missing_schema_defaults_to_public() {
        let event: ChangeEvent =
            serde_json::from_str(r#"{"table":"t","action":"DELETE"}"#).unwrap();
        assert_eq!(event.schema, "public");
        assert!(event.record_id.is_null());
    }
}

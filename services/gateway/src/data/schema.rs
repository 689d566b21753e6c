//! Schema introspection and admin DDL.
//!
//! # Purpose
//! Table/column/function/trigger introspection for any role, plus the
//! admin-only surface: table creation (with the change-event trigger
//! attached), soft/hard deletion, the recycle bin, restore, stats, and the
//! generated per-tenant OpenAPI document.

use crate::error::{ApiError, map_db_error};
use cascata_query::quote_ident;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix carried by soft-deleted tables: `_deleted_{unix_ms}_{name}`.
const DELETED_PREFIX: &str = "_deleted_";

/// Column types accepted by `create_table`. Everything else is rejected
/// before any SQL is built.
const ALLOWED_COLUMN_TYPES: [&str; 14] = [
    "text",
    "varchar",
    "integer",
    "bigint",
    "boolean",
    "numeric",
    "double precision",
    "timestamptz",
    "timestamp",
    "date",
    "jsonb",
    "uuid",
    "serial",
    "bigserial",
];

/// The trigger function every platform-created table is wired to. DELETE
/// rows no longer have NEW, so the record id branches on TG_OP.
const NOTIFY_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION cascata_notify_row_change() RETURNS trigger AS $fn$
DECLARE
    rid jsonb;
BEGIN
    IF TG_OP = 'DELETE' THEN
        rid := to_jsonb(OLD.id);
    ELSE
        rid := to_jsonb(NEW.id);
    END IF;
    PERFORM pg_notify('cascata_events', jsonb_build_object(
        'table', TG_TABLE_NAME,
        'schema', TG_TABLE_SCHEMA,
        'action', TG_OP,
        'record_id', rid,
        'timestamp', now()
    )::text);
    RETURN COALESCE(NEW, OLD);
END
$fn$ LANGUAGE plpgsql;
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct NewColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<NewColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropMode {
    Soft,
    Cascade,
    Restrict,
}

impl Default for DropMode {
    fn default() -> Self {
        DropMode::Soft
    }
}

fn ident(name: &str) -> Result<String, ApiError> {
    let cleaned = cascata_query::sanitize_column(name);
    if cleaned.is_empty() || cleaned.contains("->") {
        return Err(ApiError::Validation(format!("invalid identifier: {name}")));
    }
    Ok(cleaned)
}

pub async fn list_tables(pool: &PgPool) -> Result<Vec<String>, ApiError> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
           AND table_name NOT LIKE '\\_deleted\\_%' \
         ORDER BY table_name",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    Ok(tables)
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: String,
    pub column_default: Option<String>,
}

pub async fn get_columns(pool: &PgPool, table: &str) -> Result<Vec<ColumnInfo>, ApiError> {
    let columns = sqlx::query_as::<_, ColumnInfo>(
        "SELECT column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    if columns.is_empty() {
        return Err(ApiError::NotFound(format!("table {table}")));
    }
    Ok(columns)
}

pub async fn list_functions(pool: &PgPool) -> Result<Vec<String>, ApiError> {
    let functions: Vec<String> = sqlx::query_scalar(
        "SELECT p.proname FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE n.nspname = 'public' ORDER BY p.proname",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    Ok(functions)
}

pub async fn list_triggers(pool: &PgPool) -> Result<Vec<Value>, ApiError> {
    let rows: Vec<PgRow> = sqlx::query(
        "SELECT trigger_name, event_object_table, event_manipulation, action_timing \
         FROM information_schema.triggers WHERE trigger_schema = 'public' \
         ORDER BY trigger_name",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "name": row.get::<String, _>(0),
                "table": row.get::<String, _>(1),
                "event": row.get::<String, _>(2),
                "timing": row.get::<String, _>(3),
            })
        })
        .collect())
}

pub async fn get_function_definition(pool: &PgPool, name: &str) -> Result<String, ApiError> {
    let definition: Option<String> = sqlx::query_scalar(
        "SELECT pg_get_functiondef(p.oid) FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE n.nspname = 'public' AND p.proname = $1 LIMIT 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;
    definition.ok_or_else(|| ApiError::NotFound(format!("function {name}")))
}

/// Creates a table with an `id BIGSERIAL PRIMARY KEY` (unless the caller
/// supplies its own `id`), then attaches the change-event trigger.
pub async fn create_table(pool: &PgPool, spec: &NewTable) -> Result<(), ApiError> {
    let table = ident(&spec.name)?;
    let mut columns: Vec<String> = Vec::with_capacity(spec.columns.len() + 1);
    if !spec.columns.iter().any(|column| column.name == "id") {
        columns.push("\"id\" BIGSERIAL PRIMARY KEY".to_string());
    }
    for column in &spec.columns {
        let name = ident(&column.name)?;
        let column_type = column.column_type.to_ascii_lowercase();
        if !ALLOWED_COLUMN_TYPES.contains(&column_type.as_str()) {
            return Err(ApiError::Validation(format!(
                "unsupported column type: {}",
                column.column_type
            )));
        }
        let mut rendered = format!("{} {}", quote_ident(&name), column_type);
        if name == "id" {
            rendered.push_str(" PRIMARY KEY");
        } else if !column.nullable {
            rendered.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            // Defaults are quoted as literals; expressions are not accepted.
            rendered.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")));
        }
        columns.push(rendered);
    }

    let create_sql = format!(
        "CREATE TABLE {} ({})",
        quote_ident(&table),
        columns.join(", ")
    );
    sqlx::query(&create_sql)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    attach_notify_trigger(pool, &table).await?;
    Ok(())
}

/// Installs the notify function (idempotent) and wires the table's row
/// trigger.
pub async fn attach_notify_trigger(pool: &PgPool, table: &str) -> Result<(), ApiError> {
    sqlx::query(NOTIFY_FUNCTION_SQL)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    let trigger_name = format!("cascata_events_{table}");
    let trigger_sql = format!(
        "CREATE OR REPLACE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
         FOR EACH ROW EXECUTE FUNCTION cascata_notify_row_change()",
        quote_ident(&trigger_name),
        quote_ident(table)
    );
    sqlx::query(&trigger_sql)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Computes the recycle-bin name for a table.
pub fn deleted_name(table: &str, stamp_ms: u128) -> String {
    format!("{DELETED_PREFIX}{stamp_ms}_{table}")
}

/// Strips the recycle-bin prefix, returning the original name.
pub fn restored_name(deleted: &str) -> Option<&str> {
    let rest = deleted.strip_prefix(DELETED_PREFIX)?;
    let (stamp, original) = rest.split_once('_')?;
    if stamp.is_empty() || !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    (!original.is_empty()).then_some(original)
}

pub async fn delete_table(pool: &PgPool, table: &str, mode: DropMode) -> Result<(), ApiError> {
    let table = ident(table)?;
    let sql = match mode {
        DropMode::Soft => format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&table),
            quote_ident(&deleted_name(&table, unix_ms()))
        ),
        DropMode::Cascade => format!("DROP TABLE {} CASCADE", quote_ident(&table)),
        DropMode::Restrict => format!("DROP TABLE {} RESTRICT", quote_ident(&table)),
    };
    sqlx::query(&sql).execute(pool).await.map_err(map_db_error)?;
    Ok(())
}

pub async fn list_recycle_bin(pool: &PgPool) -> Result<Vec<String>, ApiError> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name LIKE '\\_deleted\\_%' \
         ORDER BY table_name",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    Ok(tables)
}

pub async fn restore_table(pool: &PgPool, deleted: &str) -> Result<String, ApiError> {
    let deleted = ident(deleted)?;
    let Some(original) = restored_name(&deleted) else {
        return Err(ApiError::Validation(format!(
            "not a recycled table: {deleted}"
        )));
    };
    let sql = format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&deleted),
        quote_ident(original)
    );
    sqlx::query(&sql).execute(pool).await.map_err(map_db_error)?;
    Ok(original.to_string())
}

/// Table count, row estimate, user count (0 when the auth schema is
/// absent), and formatted database size.
pub async fn get_stats(pool: &PgPool) -> Result<Value, ApiError> {
    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
           AND table_name NOT LIKE '\\_deleted\\_%'",
    )
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let row_estimate: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(GREATEST(c.reltuples, 0))::bigint, 0) FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = 'public' AND c.relkind = 'r'",
    )
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth.users")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    let db_size: String =
        sqlx::query_scalar("SELECT pg_size_pretty(pg_database_size(current_database()))")
            .fetch_one(pool)
            .await
            .map_err(map_db_error)?;

    Ok(json!({
        "tables": table_count,
        "rows": row_estimate,
        "users": user_count,
        "database_size": db_size,
    }))
}

fn openapi_type(data_type: &str) -> &'static str {
    match data_type {
        "integer" | "bigint" | "smallint" => "integer",
        "numeric" | "double precision" | "real" => "number",
        "boolean" => "boolean",
        "json" | "jsonb" | "ARRAY" => "object",
        _ => "string",
    }
}

/// Builds the per-tenant OpenAPI document from live introspection.
pub async fn build_openapi(pool: &PgPool, slug: &str) -> Result<Value, ApiError> {
    let tables = list_tables(pool).await?;
    let mut paths = Map::new();
    let mut schemas = Map::new();
    for table in &tables {
        let columns = get_columns(pool, table).await?;
        let mut properties = Map::new();
        for column in &columns {
            properties.insert(
                column.column_name.clone(),
                json!({"type": openapi_type(&column.data_type)}),
            );
        }
        schemas.insert(table.clone(), json!({"type": "object", "properties": properties}));
        let reference = json!({"$ref": format!("#/components/schemas/{table}")});
        paths.insert(
            format!("/api/data/{slug}/{table}"),
            json!({
                "get": {"summary": format!("List {table} rows"), "responses": {"200": {
                    "description": "rows",
                    "content": {"application/json": {"schema": {"type": "array", "items": reference}}}
                }}},
                "post": {"summary": format!("Insert into {table}"), "responses": {"201": {"description": "created"}}},
                "patch": {"summary": format!("Update {table} rows"), "responses": {"200": {"description": "updated"}}},
                "delete": {"summary": format!("Delete {table} rows"), "responses": {"200": {"description": "deleted"}}},
            }),
        );
    }
    Ok(json!({
        "openapi": "3.0.3",
        "info": {"title": format!("{slug} data API"), "version": "1"},
        "paths": paths,
        "components": {"schemas": schemas},
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_name_round_trips() {
        let name = deleted_name("customers", 1700000000000);
        assert_eq!(name, "_deleted_1700000000000_customers");
        assert_eq!(restored_name(&name), Some("customers"));
    }

    #[test]
    fn restored_name_rejects_non_recycled() {
        assert_eq!(restored_name("customers"), None);
        assert_eq!(restored_name("_deleted_abc_t"), None);
        assert_eq!(restored_name("_deleted_123_"), None);
    }

    #[test]
    fn restored_name_keeps_underscored_tables_whole() {
        let name = deleted_name("order_items", 42);
        assert_eq!(restored_name(&name), Some("order_items"));
    }

    #[test]
    fn openapi_type_mapping() {
        assert_eq!(openapi_type("bigint"), "integer");
        assert_eq!(openapi_type("numeric"), "number");
        assert_eq!(openapi_type("boolean"), "boolean");
        assert_eq!(openapi_type("jsonb"), "object");
        assert_eq!(openapi_type("character varying"), "string");
        assert_eq!(openapi_type("timestamp with time zone"), "string");
    }

    #[test]
    fn column_type_allowlist_is_case_insensitive() {
        let spec = NewColumn {
            name: "n".to_string(),
            column_type: "TEXT".to_string(),
            nullable: true,
            default: None,
        };
        assert!(ALLOWED_COLUMN_TYPES.contains(&spec.column_type.to_ascii_lowercase().as_str()));
    }
}

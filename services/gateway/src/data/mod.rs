//! Data controller execution core.
//!
//! # Purpose
//! Runs translated statements against a tenant pool inside a transaction
//! that first pins the session role (`SET LOCAL role = …`), so row-level
//! security applies to everything the statement touches. Also hosts the
//! service-role raw SQL runner and positional RPC calls.

pub mod devices;
pub mod schema;

use crate::auth::RequestRole;
use crate::error::{ApiError, map_db_error, map_raw_sql_error};
use base64::Engine;
use cascata_query::Statement;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value, json};
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row};
use std::time::Instant;

/// Result of one data-plane statement.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// JSON array of rows, absent for `return=minimal` mutations.
    pub rows: Option<Value>,
    pub row_count: u64,
}

/// Binds translator parameter values. JSON scalars become typed parameters;
/// arrays and objects bind as jsonb. Two variants because `query` and
/// `query_scalar` are distinct builder types in sqlx.
macro_rules! bind_json_values {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for value in $params {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(flag) => query.bind(*flag),
                Value::Number(number) => {
                    if let Some(int) = number.as_i64() {
                        query.bind(int)
                    } else {
                        query.bind(number.as_f64().unwrap_or(0.0))
                    }
                }
                Value::String(text) => query.bind(text.clone()),
                other => query.bind(other.clone()),
            };
        }
        query
    }};
}

fn bind_values<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    bind_json_values!(query, params)
}

fn bind_scalar_values<'q, O>(
    query: sqlx::query::QueryScalar<'q, Postgres, O, PgArguments>,
    params: &[Value],
) -> sqlx::query::QueryScalar<'q, Postgres, O, PgArguments> {
    bind_json_values!(query, params)
}

/// Wraps a row-returning statement so the database serialises the result
/// set to a single jsonb array.
fn json_wrap(sql: &str) -> String {
    format!("WITH _result AS ({sql}) SELECT COALESCE(jsonb_agg(_result), '[]'::jsonb) AS data FROM _result")
}

async fn set_local_role(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    role: RequestRole,
) -> Result<(), ApiError> {
    // The role vocabulary is fixed by the enum; this is not user input.
    let sql = format!("SET LOCAL role = {}", role.as_guc());
    sqlx::query(&sql)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

/// Executes one translated statement under `role`. Statements that return
/// rows are json-wrapped; minimal mutations report the affected count only.
pub async fn run_statement(
    pool: &PgPool,
    role: RequestRole,
    statement: &Statement,
    expects_rows: bool,
) -> Result<QueryOutcome, ApiError> {
    let mut tx = pool.begin().await.map_err(map_db_error)?;
    set_local_role(&mut tx, role).await?;

    let outcome = if expects_rows {
        let wrapped = json_wrap(&statement.sql);
        let data: Value = bind_scalar_values(sqlx::query_scalar(&wrapped), &statement.params)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let row_count = data.as_array().map(|rows| rows.len() as u64).unwrap_or(0);
        QueryOutcome {
            rows: Some(data),
            row_count,
        }
    } else {
        let result = bind_values(sqlx::query(&statement.sql), &statement.params)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        QueryOutcome {
            rows: None,
            row_count: result.rows_affected(),
        }
    };

    tx.commit().await.map_err(map_db_error)?;
    Ok(outcome)
}

/// Companion `COUNT(*)` for `Prefer: count=exact`.
pub async fn run_count(
    pool: &PgPool,
    role: RequestRole,
    count: &cascata_query::CountStatement,
) -> Result<u64, ApiError> {
    let mut tx = pool.begin().await.map_err(map_db_error)?;
    set_local_role(&mut tx, role).await?;
    let total: i64 = bind_scalar_values(sqlx::query_scalar(&count.sql), &count.params)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
    tx.commit().await.map_err(map_db_error)?;
    Ok(total.max(0) as u64)
}

/// Positional RPC: resolves the function's declared argument order from the
/// catalog, pulls values out of the JSON object, and calls it with the rows
/// aggregated to json.
pub async fn execute_rpc(
    pool: &PgPool,
    role: RequestRole,
    name: &str,
    args: &Map<String, Value>,
) -> Result<Value, ApiError> {
    let ident = cascata_query::sanitize_column(name);
    if ident.is_empty() {
        return Err(ApiError::Validation("invalid function name".to_string()));
    }

    // One row per function; proargnames is NULL for zero-argument functions.
    let found: Option<Option<Vec<String>>> = sqlx::query_scalar(
        "SELECT p.proargnames FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE n.nspname = 'public' AND p.proname = $1 LIMIT 1",
    )
    .bind(&ident)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;
    let Some(arg_names) = found else {
        return Err(ApiError::NotFound(format!("function {ident}")));
    };
    let arg_names = arg_names.unwrap_or_default();

    let params: Vec<Value> = arg_names
        .iter()
        .map(|arg| args.get(arg).cloned().unwrap_or(Value::Null))
        .collect();
    let placeholders: Vec<String> = (1..=params.len()).map(|n| format!("${n}")).collect();
    let sql = format!(
        "SELECT COALESCE(jsonb_agg(_r), '[]'::jsonb) AS data \
         FROM {}({}) AS _r",
        cascata_query::quote_ident(&ident),
        placeholders.join(", ")
    );

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    set_local_role(&mut tx, role).await?;
    let data: Value = bind_scalar_values(sqlx::query_scalar(&sql), &params)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
    tx.commit().await.map_err(map_db_error)?;
    Ok(data)
}

/// Service-role raw SQL. Database errors map to 400 with code and position.
pub async fn run_raw_query(pool: &PgPool, sql: &str) -> Result<Value, ApiError> {
    let started = Instant::now();
    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .map_err(map_raw_sql_error)?;
    let duration_ms = started.elapsed().as_millis() as u64;
    let decoded: Vec<Value> = rows.iter().map(row_to_value).collect();
    let command = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    Ok(json!({
        "rows": decoded,
        "rowCount": decoded.len(),
        "command": command,
        "duration_ms": duration_ms,
    }))
}

/// Best-effort decoding of an arbitrary row into JSON. Types without a
/// natural JSON form fall back to text, then null.
pub fn row_to_value(row: &PgRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().to_string();
        let value = decode_column(row, index, &type_name);
        object.insert(name, value);
    }
    Value::Object(object)
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| {
                v.map(|bytes| {
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
                })
                .unwrap_or(Value::Null)
            })
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_wrap_preserves_inner_statement() {
        let wrapped = json_wrap(r#"SELECT * FROM "t" WHERE "a" = $1"#);
        assert!(wrapped.starts_with("WITH _result AS (SELECT * FROM"));
        assert!(wrapped.contains("jsonb_agg(_result)"));
        assert!(wrapped.contains("'[]'::jsonb"));
    }

    #[test]
    fn command_word_is_first_token() {
        // Mirrors run_raw_query's command extraction.
        let command = "select 1 from t"
            .split_whitespace()
            .next()
            .unwrap()
            .to_ascii_uppercase();
        assert_eq!(command, "SELECT");
    }
}

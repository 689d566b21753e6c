//! Data-plane handlers.
//!
//! # Purpose
//! PostgREST-compatible table CRUD plus the controller surface: raw SQL
//! (service role), RPC, schema introspection, table lifecycle (admin),
//! stats, and the generated OpenAPI document. Every statement runs through
//! the pool attached by the pipeline, under the request's role.

use crate::api::types::RawQueryRequest;
use crate::app::AppState;
use crate::data::{self, schema};
use crate::error::ApiError;
use crate::pipeline::DataContext;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use cascata_query::{RequestParts, Statement, Verb};
use serde_json::{Map, Value, json};

const SINGLE_OBJECT_ACCEPT: &str = "application/vnd.pgrst.object+json";

fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else { return Vec::new() };
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn parse_body(body: &Bytes) -> Result<Option<Value>, ApiError> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

fn wants_single_object(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(SINGLE_OBJECT_ACCEPT))
}

/// Pool-level failures also drop the registry entry so the next request
/// rebuilds a clean pool.
fn react_to_pool_error(state: &AppState, ctx: &DataContext, err: ApiError) -> ApiError {
    if matches!(err, ApiError::BadGateway(_)) {
        state.registry.invalidate(&ctx.pool_key);
    }
    err
}

fn content_range(offset: u64, returned: usize, total: u64) -> String {
    if returned == 0 {
        format!("*/{total}")
    } else {
        format!("{}-{}/{}", offset, offset + returned as u64 - 1, total)
    }
}

async fn run_crud(
    state: &AppState,
    ctx: &DataContext,
    table: &str,
    verb: Verb,
    parts: &RequestParts<'_>,
) -> Result<(Statement, data::QueryOutcome), ApiError> {
    let statement = cascata_query::translate(table, verb, parts)?;
    let expects_rows = statement.returning || verb == Verb::Select;
    let outcome = data::run_statement(&ctx.pool, ctx.auth.role, &statement, expects_rows)
        .await
        .map_err(|err| react_to_pool_error(state, ctx, err))?;
    Ok((statement, outcome))
}

pub async fn select_rows(
    Path((_slug, table)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let params = query_pairs(raw_query.as_deref());
    let parts = RequestParts {
        params: &params,
        body: None,
        prefer: headers.get("prefer").and_then(|value| value.to_str().ok()),
        range: headers.get("range").and_then(|value| value.to_str().ok()),
    };
    let (statement, outcome) = run_crud(&state, &ctx, &table, Verb::Select, &parts).await?;
    let rows = outcome.rows.unwrap_or_else(|| json!([]));

    let mut response = if wants_single_object(&headers) {
        let first = rows
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .unwrap_or(Value::Null);
        Json(first).into_response()
    } else {
        Json(rows.clone()).into_response()
    };

    if let Some(count) = &statement.count {
        let total = data::run_count(&ctx.pool, ctx.auth.role, count)
            .await
            .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
        let returned = rows.as_array().map(|rows| rows.len()).unwrap_or(0);
        let range = content_range(statement.offset, returned, total);
        if let Ok(value) = HeaderValue::from_str(&range) {
            response.headers_mut().insert("content-range", value);
        }
    }
    Ok(response)
}

pub async fn insert_rows(
    Path((_slug, table)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params = query_pairs(raw_query.as_deref());
    let parsed = parse_body(&body)?;
    let parts = RequestParts {
        params: &params,
        body: parsed.as_ref(),
        prefer: headers.get("prefer").and_then(|value| value.to_str().ok()),
        range: None,
    };
    let (statement, outcome) = run_crud(&state, &ctx, &table, Verb::Insert, &parts).await?;
    if statement.returning {
        Ok((StatusCode::CREATED, Json(outcome.rows.unwrap_or_else(|| json!([])))).into_response())
    } else {
        Ok(StatusCode::CREATED.into_response())
    }
}

pub async fn update_rows(
    Path((_slug, table)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params = query_pairs(raw_query.as_deref());
    let parsed = parse_body(&body)?;
    let parts = RequestParts {
        params: &params,
        body: parsed.as_ref(),
        prefer: headers.get("prefer").and_then(|value| value.to_str().ok()),
        range: None,
    };
    let (statement, outcome) = run_crud(&state, &ctx, &table, Verb::Update, &parts).await?;
    if statement.returning {
        Ok(Json(outcome.rows.unwrap_or_else(|| json!([]))).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

pub async fn delete_rows(
    Path((_slug, table)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let params = query_pairs(raw_query.as_deref());
    let parts = RequestParts {
        params: &params,
        body: None,
        prefer: headers.get("prefer").and_then(|value| value.to_str().ok()),
        range: None,
    };
    let (statement, outcome) = run_crud(&state, &ctx, &table, Verb::Delete, &parts).await?;
    if statement.returning {
        Ok(Json(outcome.rows.unwrap_or_else(|| json!([]))).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

pub async fn list_tables(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<String>>, ApiError> {
    let tables = schema::list_tables(&ctx.pool)
        .await
        .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
    Ok(Json(tables))
}

pub async fn get_columns(
    Path((_slug, table)): Path<(String, String)>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<schema::ColumnInfo>>, ApiError> {
    Ok(Json(schema::get_columns(&ctx.pool, &table).await?))
}

pub async fn create_table(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    let spec: schema::NewTable = serde_json::from_slice(&body)?;
    schema::create_table(&ctx.pool, &spec)
        .await
        .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, serde::Deserialize)]
pub struct DeleteTableQuery {
    #[serde(default)]
    mode: Option<schema::DropMode>,
}

pub async fn delete_table(
    Path((_slug, table)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<DeleteTableQuery>,
    Extension(ctx): Extension<DataContext>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    schema::delete_table(&ctx.pool, &table, query.mode.unwrap_or_default()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_recycle_bin(
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<String>>, ApiError> {
    require_admin(&ctx)?;
    Ok(Json(schema::list_recycle_bin(&ctx.pool).await?))
}

pub async fn restore_table(
    Path((_slug, name)): Path<(String, String)>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let restored = schema::restore_table(&ctx.pool, &name).await?;
    Ok(Json(json!({"restored": restored})))
}

pub async fn list_functions(
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(schema::list_functions(&ctx.pool).await?))
}

pub async fn get_function_definition(
    Path((_slug, name)): Path<(String, String)>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Value>, ApiError> {
    let definition = schema::get_function_definition(&ctx.pool, &name).await?;
    Ok(Json(json!({"name": name, "definition": definition})))
}

pub async fn list_triggers(
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<Value>>, ApiError> {
    Ok(Json(schema::list_triggers(&ctx.pool).await?))
}

pub async fn execute_rpc(
    Path((_slug, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let args: Map<String, Value> = if body.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice::<Value>(&body)?
            .as_object()
            .cloned()
            .ok_or_else(|| ApiError::Validation("rpc arguments must be an object".to_string()))?
    };
    let result = data::execute_rpc(&ctx.pool, ctx.auth.role, &name, &args)
        .await
        .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
    Ok(Json(result))
}

pub async fn run_raw_query(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    Json(body): Json<RawQueryRequest>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.auth.role.is_service() {
        return Err(ApiError::Forbidden(
            "raw SQL requires the service role".to_string(),
        ));
    }
    let result = data::run_raw_query(&ctx.pool, &body.sql)
        .await
        .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
    Ok(Json(result))
}

pub async fn get_stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Value>, ApiError> {
    let stats = schema::get_stats(&ctx.pool)
        .await
        .map_err(|err| react_to_pool_error(&state, &ctx, err))?;
    Ok(Json(stats))
}

pub async fn get_openapi_spec(
    Path(slug): Path<String>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.project.metadata.schema_exposed() && !ctx.auth.is_admin {
        return Err(ApiError::Forbidden(
            "schema discovery is disabled for this project".to_string(),
        ));
    }
    Ok(Json(schema::build_openapi(&ctx.pool, &slug).await?))
}

fn require_admin(ctx: &DataContext) -> Result<(), ApiError> {
    if ctx.auth.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin required".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_preserve_order_and_repeats() {
        let pairs = query_pairs(Some("a=eq.1&b=gte.2&a=lt.9"));
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "eq.1".to_string()),
                ("b".to_string(), "gte.2".to_string()),
                ("a".to_string(), "lt.9".to_string()),
            ]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn content_range_shapes() {
        assert_eq!(content_range(0, 10, 57), "0-9/57");
        assert_eq!(content_range(20, 5, 57), "20-24/57");
        assert_eq!(content_range(0, 0, 0), "*/0");
    }

    #[test]
    fn single_object_accept_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_single_object(&headers));
        headers.insert(
            "accept",
            HeaderValue::from_static("application/vnd.pgrst.object+json"),
        );
        assert!(wants_single_object(&headers));
    }

    #[test]
    fn empty_body_is_none() {
        assert!(parse_body(&Bytes::new()).unwrap().is_none());
        assert!(parse_body(&Bytes::from_static(b"not json")).is_err());
        assert_eq!(
            parse_body(&Bytes::from_static(b"{\"a\":1}")).unwrap(),
            Some(json!({"a": 1}))
        );
    }
}

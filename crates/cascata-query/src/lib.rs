//! PostgREST-style query translation.
//!
//! # Purpose
//! Turns the declarative URL/body dialect spoken by the data plane
//! (`?name=eq.A&order=name.asc&limit=10`, `Prefer: resolution=merge-duplicates`,
//! `Range: 0-9`) into a single parameterised Postgres statement. User-supplied
//! values only ever travel through `$n` placeholders; identifiers are
//! sanitised and quoted before they reach SQL text.
//!
//! The translator is deliberately free of any database dependency so it can
//! be tested exhaustively without a server.

use serde_json::{Map, Value};

mod filter;
mod ident;

pub use filter::{Filter, FilterOp};
pub use ident::{quote_ident, sanitize_column};

/// Query-string keys that configure the statement rather than filter rows.
const RESERVED_PARAMS: [&str; 6] = ["select", "order", "limit", "offset", "on_conflict", "columns"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Select,
    Insert,
    Update,
    Delete,
}

/// One translated request. `params` line up with `$1..$n` in `sql`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Companion `COUNT(*)` statement when `Prefer: count=exact` was sent.
    pub count: Option<CountStatement>,
    /// Whether the statement ends in `RETURNING *`.
    pub returning: bool,
    /// Effective offset, used by callers to build `Content-Range`.
    pub offset: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Inputs extracted from the HTTP request by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestParts<'a> {
    /// Decoded query pairs in arrival order. Repeated keys are permitted.
    pub params: &'a [(String, String)],
    pub body: Option<&'a Value>,
    /// Raw `Prefer` header value.
    pub prefer: Option<&'a str>,
    /// Raw `Range` header value (`start-end`).
    pub range: Option<&'a str>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("request body must be a JSON object or array of objects")]
    InvalidBody,
    #[error("mutations require at least one filter")]
    FilterlessMutation,
    #[error("insert requires at least one column")]
    EmptyColumns,
}

/// Preferences parsed from the `Prefer` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Preferences {
    merge_duplicates: bool,
    ignore_duplicates: bool,
    return_minimal: bool,
    count_exact: bool,
}

fn parse_prefer(raw: Option<&str>) -> Preferences {
    let mut prefs = Preferences::default();
    let Some(raw) = raw else { return prefs };
    for token in raw.split(',') {
        match token.trim() {
            "resolution=merge-duplicates" => prefs.merge_duplicates = true,
            "resolution=ignore-duplicates" => prefs.ignore_duplicates = true,
            "return=minimal" => prefs.return_minimal = true,
            "count=exact" => prefs.count_exact = true,
            _ => {}
        }
    }
    prefs
}

/// Pagination resolved from the `Range` header and explicit parameters.
/// Explicit `limit`/`offset` win over the header.
fn resolve_pagination(
    parts: &RequestParts<'_>,
) -> Result<(u64, Option<u64>), QueryError> {
    let mut offset = 0u64;
    let mut limit = None;

    if let Some(range) = parts.range {
        let range = range.trim().trim_start_matches("items=");
        if let Some((start, end)) = range.split_once('-') {
            let start: u64 = start
                .trim()
                .parse()
                .map_err(|_| QueryError::InvalidRange(range.to_string()))?;
            let end: u64 = end
                .trim()
                .parse()
                .map_err(|_| QueryError::InvalidRange(range.to_string()))?;
            if end < start {
                return Err(QueryError::InvalidRange(range.to_string()));
            }
            offset = start;
            limit = Some(end - start + 1);
        }
    }

    for (key, value) in parts.params {
        match key.as_str() {
            "limit" => {
                limit = Some(
                    value
                        .parse()
                        .map_err(|_| QueryError::InvalidRange(value.clone()))?,
                )
            }
            "offset" => {
                offset = value
                    .parse()
                    .map_err(|_| QueryError::InvalidRange(value.clone()))?
            }
            _ => {}
        }
    }
    Ok((offset, limit))
}

fn single_param(parts: &RequestParts<'_>, name: &str) -> Option<String> {
    parts
        .params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

/// Builds the select list. `*` and absent both mean every column;
/// `col:alias` becomes `"col" AS "alias"`; anything that looks like an
/// expression (function call, JSON traversal, dotted path) passes through
/// with quote characters stripped.
fn select_list(parts: &RequestParts<'_>) -> String {
    let Some(raw) = single_param(parts, "select") else {
        return "*".to_string();
    };
    if raw.trim().is_empty() || raw.trim() == "*" {
        return "*".to_string();
    }
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.contains('(') || item.contains("->") || item.contains('.') {
                // Expression passthrough. Quotes and statement separators are
                // stripped so the expression cannot escape its position.
                item.chars()
                    .filter(|c| !matches!(c, '\'' | '"' | ';'))
                    .collect::<String>()
            } else if let Some((column, alias)) = item.split_once(':') {
                format!(
                    "{} AS {}",
                    quote_ident(&sanitize_column(column)),
                    quote_ident(&sanitize_column(alias))
                )
            } else {
                quote_ident(&sanitize_column(item))
            }
        })
        .collect();
    if items.is_empty() {
        "*".to_string()
    } else {
        items.join(", ")
    }
}

/// Builds the ORDER BY clause. Column names are hard-sanitised; direction
/// defaults to ascending.
fn order_clause(parts: &RequestParts<'_>) -> Option<String> {
    let raw = single_param(parts, "order")?;
    let mut terms = Vec::new();
    for item in raw.split(',') {
        let mut segments = item.split('.');
        let column = sanitize_column(segments.next().unwrap_or_default());
        if column.is_empty() {
            continue;
        }
        let mut direction = "ASC";
        let mut nulls = None;
        for segment in segments {
            match segment {
                "asc" => direction = "ASC",
                "desc" => direction = "DESC",
                "nullsfirst" => nulls = Some("NULLS FIRST"),
                "nullslast" => nulls = Some("NULLS LAST"),
                _ => {}
            }
        }
        let rendered_column = if column.contains("->") {
            column
        } else {
            quote_ident(&column)
        };
        let mut term = format!("{rendered_column} {direction}");
        if let Some(nulls) = nulls {
            term.push(' ');
            term.push_str(nulls);
        }
        terms.push(term);
    }
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(", "))
    }
}

fn collect_filters(parts: &RequestParts<'_>) -> Vec<Filter> {
    parts
        .params
        .iter()
        .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()))
        .map(|(key, value)| Filter::parse(key, value))
        .collect()
}

fn count_statement(table: &str, filters: &[Filter]) -> CountStatement {
    let mut params = Vec::new();
    let where_clause = filter::where_clause(filters, &mut params);
    let mut sql = format!("SELECT COUNT(*) AS total FROM {}", quote_ident(table));
    if let Some(where_clause) = where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }
    CountStatement { sql, params }
}

/// Translates one data-plane request into a statement.
pub fn translate(
    table: &str,
    verb: Verb,
    parts: &RequestParts<'_>,
) -> Result<Statement, QueryError> {
    match verb {
        Verb::Select => translate_select(table, parts),
        Verb::Insert => translate_insert(table, parts),
        Verb::Update => translate_update(table, parts),
        Verb::Delete => translate_delete(table, parts),
    }
}

fn translate_select(table: &str, parts: &RequestParts<'_>) -> Result<Statement, QueryError> {
    let prefs = parse_prefer(parts.prefer);
    let filters = collect_filters(parts);
    let (offset, limit) = resolve_pagination(parts)?;

    let mut params = Vec::new();
    let mut sql = format!("SELECT {} FROM {}", select_list(parts), quote_ident(table));
    if let Some(where_clause) = filter::where_clause(&filters, &mut params) {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }
    if let Some(order) = order_clause(parts) {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if offset > 0 {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    let count = prefs.count_exact.then(|| count_statement(table, &filters));
    Ok(Statement {
        sql,
        params,
        count,
        returning: false,
        offset,
        limit,
    })
}

fn insert_rows(body: Option<&Value>) -> Result<Vec<&Map<String, Value>>, QueryError> {
    match body {
        Some(Value::Object(object)) => Ok(vec![object]),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| item.as_object().ok_or(QueryError::InvalidBody))
            .collect(),
        _ => Err(QueryError::InvalidBody),
    }
}

/// INSERT goes through `jsonb_populate_recordset` so values coerce into the
/// table's own column types server-side. Only the named columns are listed
/// in the INSERT, so columns absent from the body keep their defaults.
fn translate_insert(table: &str, parts: &RequestParts<'_>) -> Result<Statement, QueryError> {
    let prefs = parse_prefer(parts.prefer);
    let rows = insert_rows(parts.body)?;

    let columns: Vec<String> = match single_param(parts, "columns") {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .map(sanitize_column)
            .collect(),
        None => rows[0].keys().map(|key| sanitize_column(key)).collect(),
    };
    if columns.is_empty() {
        return Err(QueryError::EmptyColumns);
    }

    let quoted = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let payload = Value::Array(rows.iter().map(|row| Value::Object((*row).clone())).collect());
    let params = vec![payload];

    let table_ident = quote_ident(table);
    let mut sql = format!(
        "INSERT INTO {table_ident} ({quoted}) \
         SELECT {quoted} FROM jsonb_populate_recordset(NULL::{table_ident}, $1)"
    );

    if prefs.ignore_duplicates {
        sql.push_str(" ON CONFLICT DO NOTHING");
    } else if prefs.merge_duplicates {
        let target = single_param(parts, "on_conflict").unwrap_or_else(|| "id".to_string());
        let target: Vec<String> = target
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .map(|column| quote_ident(&sanitize_column(column)))
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .map(|column| {
                let column = quote_ident(column);
                format!("{column} = EXCLUDED.{column}")
            })
            .collect();
        sql.push_str(&format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            target.join(", "),
            updates.join(", ")
        ));
    }

    let returning = !prefs.return_minimal;
    if returning {
        sql.push_str(" RETURNING *");
    }
    Ok(Statement {
        sql,
        params,
        count: None,
        returning,
        offset: 0,
        limit: None,
    })
}

/// UPDATE binds the change set as one jsonb object; each assignment pulls
/// its column out of `jsonb_populate_record` so values coerce into the
/// column's type. Scalar subqueries keep the WHERE clause unambiguous.
fn translate_update(table: &str, parts: &RequestParts<'_>) -> Result<Statement, QueryError> {
    let prefs = parse_prefer(parts.prefer);
    let filters = collect_filters(parts);
    if filters.is_empty() {
        return Err(QueryError::FilterlessMutation);
    }
    let Some(Value::Object(changes)) = parts.body else {
        return Err(QueryError::InvalidBody);
    };
    if changes.is_empty() {
        return Err(QueryError::InvalidBody);
    }

    let table_ident = quote_ident(table);
    let mut params = vec![Value::Object(changes.clone())];
    let assignments: Vec<String> = changes
        .keys()
        .map(|column| {
            let column = quote_ident(&sanitize_column(column));
            format!(
                "{column} = (SELECT {column} FROM jsonb_populate_record(NULL::{table_ident}, $1))"
            )
        })
        .collect();

    let mut sql = format!("UPDATE {} SET {}", table_ident, assignments.join(", "));
    // Filters are guaranteed non-empty here, so a WHERE clause always renders.
    if let Some(where_clause) = filter::where_clause(&filters, &mut params) {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }
    let returning = !prefs.return_minimal;
    if returning {
        sql.push_str(" RETURNING *");
    }
    Ok(Statement {
        sql,
        params,
        count: None,
        returning,
        offset: 0,
        limit: None,
    })
}

fn translate_delete(table: &str, parts: &RequestParts<'_>) -> Result<Statement, QueryError> {
    let prefs = parse_prefer(parts.prefer);
    let filters = collect_filters(parts);
    if filters.is_empty() {
        return Err(QueryError::FilterlessMutation);
    }

    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    if let Some(where_clause) = filter::where_clause(&filters, &mut params) {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }
    let returning = !prefs.return_minimal;
    if returning {
        sql.push_str(" RETURNING *");
    }
    Ok(Statement {
        sql,
        params,
        count: None,
        returning,
        offset: 0,
        limit: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn bare_select_returns_everything() {
        let params = pairs(&[]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("customers", Verb::Select, &parts).unwrap();
        assert_eq!(statement.sql, r#"SELECT * FROM "customers""#);
        assert!(statement.params.is_empty());
    }

    #[test]
    fn filters_become_placeholders() {
        let params = pairs(&[("name", "eq.A"), ("age", "gte.21")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("customers", Verb::Select, &parts).unwrap();
        assert_eq!(
            statement.sql,
            r#"SELECT * FROM "customers" WHERE "name" = $1 AND "age" >= $2"#
        );
        assert_eq!(statement.params, vec![json!("A"), json!(21)]);
    }

    #[test]
    fn select_aliases_and_expressions() {
        let params = pairs(&[("select", "id,name:label,count(*)")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert_eq!(
            statement.sql,
            r#"SELECT "id", "name" AS "label", count(*) FROM "t""#
        );
    }

    #[test]
    fn expression_passthrough_strips_quotes() {
        let params = pairs(&[("select", "data->>'k';drop")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert!(!statement.sql.contains('\''));
        assert!(!statement.sql.contains(';'));
    }

    #[test]
    fn order_clause_strips_dangerous_characters() {
        let params = pairs(&[("order", "name;--.desc")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert_eq!(statement.sql, r#"SELECT * FROM "t" ORDER BY "name--" DESC"#);
    }

    #[test]
    fn order_defaults_to_ascending_with_nulls() {
        let params = pairs(&[("order", "name,age.desc.nullslast")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert!(statement.sql.ends_with(r#"ORDER BY "name" ASC, "age" DESC NULLS LAST"#));
    }

    #[test]
    fn range_header_maps_to_limit_offset() {
        let params = pairs(&[]);
        let parts = RequestParts {
            params: &params,
            range: Some("0-9"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert!(statement.sql.ends_with("LIMIT 10"));
        assert_eq!(statement.offset, 0);
        assert_eq!(statement.limit, Some(10));
    }

    #[test]
    fn single_item_range() {
        let params = pairs(&[]);
        let parts = RequestParts {
            params: &params,
            range: Some("0-0"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert_eq!(statement.limit, Some(1));
    }

    #[test]
    fn inverted_range_rejected() {
        let params = pairs(&[]);
        let parts = RequestParts {
            params: &params,
            range: Some("100-50"),
            ..Default::default()
        };
        assert!(matches!(
            translate("t", Verb::Select, &parts),
            Err(QueryError::InvalidRange(_))
        ));
    }

    #[test]
    fn explicit_limit_overrides_range() {
        let params = pairs(&[("limit", "5"), ("offset", "20")]);
        let parts = RequestParts {
            params: &params,
            range: Some("0-9"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        assert!(statement.sql.ends_with("LIMIT 5 OFFSET 20"));
    }

    #[test]
    fn count_exact_produces_companion_statement() {
        let params = pairs(&[("status", "eq.open")]);
        let parts = RequestParts {
            params: &params,
            prefer: Some("count=exact"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Select, &parts).unwrap();
        let count = statement.count.unwrap();
        assert_eq!(
            count.sql,
            r#"SELECT COUNT(*) AS total FROM "t" WHERE "status" = $1"#
        );
        assert_eq!(count.params, vec![json!("open")]);
    }

    #[test]
    fn insert_single_object() {
        let params = pairs(&[]);
        let body = json!({"name": "A"});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            ..Default::default()
        };
        let statement = translate("customers", Verb::Insert, &parts).unwrap();
        assert_eq!(
            statement.sql,
            r#"INSERT INTO "customers" ("name") SELECT "name" FROM jsonb_populate_recordset(NULL::"customers", $1) RETURNING *"#
        );
        assert_eq!(statement.params, vec![json!([{"name": "A"}])]);
    }

    #[test]
    fn insert_array_binds_one_jsonb_payload() {
        let params = pairs(&[]);
        let body = json!([{"name": "A"}, {"name": "B"}]);
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            ..Default::default()
        };
        let statement = translate("customers", Verb::Insert, &parts).unwrap();
        assert_eq!(statement.params, vec![json!([{"name": "A"}, {"name": "B"}])]);
        assert!(statement.sql.contains("jsonb_populate_recordset"));
    }

    #[test]
    fn insert_column_list_comes_from_first_object() {
        let params = pairs(&[]);
        let body = json!([{"a": 1, "b": 2}, {"a": 3}]);
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            ..Default::default()
        };
        let statement = translate("t", Verb::Insert, &parts).unwrap();
        assert!(statement.sql.starts_with(r#"INSERT INTO "t" ("a", "b")"#));
        assert_eq!(statement.params.len(), 1);
    }

    #[test]
    fn merge_duplicates_upserts_every_column() {
        let params = pairs(&[("on_conflict", "slug")]);
        let body = json!({"slug": "a", "name": "A"});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            prefer: Some("resolution=merge-duplicates"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Insert, &parts).unwrap();
        assert!(statement.sql.contains(r#"ON CONFLICT ("slug") DO UPDATE SET"#));
        assert!(statement.sql.contains(r#""name" = EXCLUDED."name""#));
        assert!(statement.sql.contains(r#""slug" = EXCLUDED."slug""#));
    }

    #[test]
    fn ignore_duplicates_does_nothing() {
        let params = pairs(&[]);
        let body = json!({"id": 1});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            prefer: Some("resolution=ignore-duplicates"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Insert, &parts).unwrap();
        assert!(statement.sql.contains("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn return_minimal_omits_returning() {
        let params = pairs(&[]);
        let body = json!({"id": 1});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            prefer: Some("return=minimal"),
            ..Default::default()
        };
        let statement = translate("t", Verb::Insert, &parts).unwrap();
        assert!(!statement.sql.contains("RETURNING"));
        assert!(!statement.returning);
    }

    #[test]
    fn filterless_update_rejected() {
        let params = pairs(&[]);
        let body = json!({"name": "AA"});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            ..Default::default()
        };
        assert_eq!(
            translate("t", Verb::Update, &parts),
            Err(QueryError::FilterlessMutation)
        );
    }

    #[test]
    fn filterless_delete_rejected() {
        let params = pairs(&[]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        assert_eq!(
            translate("t", Verb::Delete, &parts),
            Err(QueryError::FilterlessMutation)
        );
    }

    #[test]
    fn update_sets_and_filters() {
        let params = pairs(&[("name", "eq.A")]);
        let body = json!({"name": "AA"});
        let parts = RequestParts {
            params: &params,
            body: Some(&body),
            ..Default::default()
        };
        let statement = translate("customers", Verb::Update, &parts).unwrap();
        assert_eq!(
            statement.sql,
            r#"UPDATE "customers" SET "name" = (SELECT "name" FROM jsonb_populate_record(NULL::"customers", $1)) WHERE "name" = $2 RETURNING *"#
        );
        assert_eq!(statement.params, vec![json!({"name": "AA"}), json!("A")]);
    }

    #[test]
    fn delete_with_in_filter() {
        let params = pairs(&[("name", "in.(AA,B)")]);
        let parts = RequestParts {
            params: &params,
            ..Default::default()
        };
        let statement = translate("customers", Verb::Delete, &parts).unwrap();
        assert_eq!(
            statement.sql,
            r#"DELETE FROM "customers" WHERE "name" IN ($1, $2) RETURNING *"#
        );
        assert_eq!(statement.params, vec![json!("AA"), json!("B")]);
    }

    // Invariant: for arbitrary values the placeholder count always equals the
    // parameter count and the raw value never appears in the SQL text.
    #[test]
    fn fuzzish_values_never_reach_sql_text() {
        let hostile = [
            "'; DROP TABLE t; --",
            "Robert\"); DROP TABLE students;--",
            "ユニコード👾",
            "a\0b",
            "))) OR 1=1",
        ];
        for value in hostile {
            let params = vec![("name".to_string(), format!("eq.{value}"))];
            let parts = RequestParts {
                params: &params,
                ..Default::default()
            };
            let statement = translate("t", Verb::Select, &parts).unwrap();
            let placeholders = statement.sql.matches('$').count();
            assert_eq!(placeholders, statement.params.len());
            assert!(!statement.sql.contains(value));
        }
    }
}

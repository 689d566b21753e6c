//! Filter parsing and WHERE-clause rendering.
//!
//! A filter arrives as `column=op.value`. The operator table mirrors the
//! dialect: `eq,neq,gt,gte,lt,lte,like,ilike,is,in,cs,cd`. Anything else is
//! treated as literal equality against the raw value.

use crate::ident::{quote_ident, sanitize_column};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    Is,
    In,
    /// `@>` containment.
    Cs,
    /// `<@` contained-by.
    Cd,
}

impl FilterOp {
    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::Ilike => "ILIKE",
            FilterOp::Is => "IS",
            FilterOp::In => "IN",
            FilterOp::Cs => "@>",
            FilterOp::Cd => "<@",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
    /// Elements of an `in.(…)` list; empty renders as `1=0`.
    pub list: Vec<String>,
}

impl Filter {
    /// Parses `column=raw`. Never fails; unknown operators degrade to
    /// equality on the whole raw value.
    pub fn parse(column: &str, raw: &str) -> Self {
        let column = sanitize_column(column);
        let (op, value) = match raw.split_once('.') {
            Some(("eq", rest)) => (FilterOp::Eq, rest),
            Some(("neq", rest)) => (FilterOp::Neq, rest),
            Some(("gt", rest)) => (FilterOp::Gt, rest),
            Some(("gte", rest)) => (FilterOp::Gte, rest),
            Some(("lt", rest)) => (FilterOp::Lt, rest),
            Some(("lte", rest)) => (FilterOp::Lte, rest),
            Some(("like", rest)) => (FilterOp::Like, rest),
            Some(("ilike", rest)) => (FilterOp::Ilike, rest),
            Some(("is", rest)) => (FilterOp::Is, rest),
            Some(("in", rest)) => (FilterOp::In, rest),
            Some(("cs", rest)) => (FilterOp::Cs, rest),
            Some(("cd", rest)) => (FilterOp::Cd, rest),
            _ => (FilterOp::Eq, raw),
        };

        let list = if op == FilterOp::In {
            let inner = value
                .trim()
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
                .unwrap_or(value);
            inner
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        Self {
            column,
            op,
            value: value.to_string(),
            list,
        }
    }

    fn rendered_column(&self) -> String {
        if self.column.contains("->") {
            self.column.clone()
        } else {
            quote_ident(&self.column)
        }
    }
}

/// Types a query-string literal. Parameters travel typed over the wire, so
/// numeric and boolean literals are promoted; everything else stays text.
pub(crate) fn literal(raw: &str) -> Value {
    if let Ok(number) = raw.parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = raw.parse::<f64>() {
        if number.is_finite() {
            return Value::from(number);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Converts `*` wildcards into SQL `%` for LIKE-family operators.
fn like_pattern(raw: &str) -> String {
    raw.replace('*', "%")
}

/// Renders the conjunction of all filters, appending bound values to
/// `params`. Returns `None` when there is nothing to filter on.
pub(crate) fn where_clause(filters: &[Filter], params: &mut Vec<Value>) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    let mut clauses = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = filter.rendered_column();
        let clause = match &filter.op {
            FilterOp::Is => match filter.value.as_str() {
                "null" => format!("{column} IS NULL"),
                "true" => format!("{column} IS TRUE"),
                "false" => format!("{column} IS FALSE"),
                other => {
                    params.push(Value::String(other.to_string()));
                    format!("{column} = ${}", params.len())
                }
            },
            FilterOp::In => {
                if filter.list.is_empty() {
                    // An empty list matches nothing, not everything.
                    "1=0".to_string()
                } else {
                    let mut placeholders = Vec::with_capacity(filter.list.len());
                    for item in &filter.list {
                        params.push(literal(item));
                        placeholders.push(format!("${}", params.len()));
                    }
                    format!("{column} IN ({})", placeholders.join(", "))
                }
            }
            FilterOp::Like | FilterOp::Ilike => {
                params.push(Value::String(like_pattern(&filter.value)));
                format!("{column} {} ${}", filter.op.sql(), params.len())
            }
            FilterOp::Cs | FilterOp::Cd => {
                params.push(Value::String(filter.value.clone()));
                format!("{column} {} ${}::jsonb", filter.op.sql(), params.len())
            }
            op => {
                params.push(literal(&filter.value));
                format!("{column} {} ${}", op.sql(), params.len())
            }
        };
        clauses.push(clause);
    }
    Some(clauses.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_operators() {
        assert_eq!(Filter::parse("a", "gte.5").op, FilterOp::Gte);
        assert_eq!(Filter::parse("a", "ilike.*x*").op, FilterOp::Ilike);
        assert_eq!(Filter::parse("a", "cd.[1,2]").op, FilterOp::Cd);
    }

    #[test]
    fn unknown_operator_is_literal_equality() {
        let filter = Filter::parse("a", "raw-value");
        assert_eq!(filter.op, FilterOp::Eq);
        assert_eq!(filter.value, "raw-value");
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let filter = Filter::parse("id", "in.()");
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, "1=0");
        assert!(params.is_empty());
    }

    #[test]
    fn in_list_without_parens() {
        let filter = Filter::parse("id", "in.1,2,3");
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, r#""id" IN ($1, $2, $3)"#);
        assert_eq!(params, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn is_null_renders_without_parameter() {
        let filter = Filter::parse("deleted_at", "is.null");
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, r#""deleted_at" IS NULL"#);
        assert!(params.is_empty());
    }

    #[test]
    fn like_translates_star_to_percent() {
        let filter = Filter::parse("name", "like.Jo*");
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, r#""name" LIKE $1"#);
        assert_eq!(params, vec![json!("Jo%")]);
    }

    #[test]
    fn containment_casts_to_jsonb() {
        let filter = Filter::parse("tags", r#"cs.["a"]"#);
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, r#""tags" @> $1::jsonb"#);
    }

    #[test]
    fn literal_typing() {
        assert_eq!(literal("42"), json!(42));
        assert_eq!(literal("4.5"), json!(4.5));
        assert_eq!(literal("true"), json!(true));
        assert_eq!(literal("hello"), json!("hello"));
    }

    #[test]
    fn json_traversal_column_not_quoted() {
        let filter = Filter::parse("data->>k", "eq.v");
        let mut params = Vec::new();
        let clause = where_clause(&[filter], &mut params).unwrap();
        assert_eq!(clause, "data->>k = $1");
    }
}

//! Identifier handling.
//!
//! Two layers of defence: column names are first reduced to a safe character
//! set, then quoted with inner quotes doubled. Values never pass through
//! here; they are bound as parameters.

/// Characters permitted in column names: letters, digits, underscore,
/// space, dash, and `>` for JSON traversal (`data->>key`). Everything else
/// is stripped silently.
pub fn sanitize_column(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '-' | '>'))
        .collect()
}

/// Double-quotes an identifier, escaping embedded quotes by doubling.
pub fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_json_traversal() {
        assert_eq!(sanitize_column("data->>key"), "data->>key");
    }

    #[test]
    fn sanitize_strips_sql_metacharacters() {
        assert_eq!(sanitize_column("name;--"), "name--");
        assert_eq!(sanitize_column("a'b\"c"), "abc");
        assert_eq!(sanitize_column("col); DROP"), "col DROP");
    }

    #[test]
    fn quote_doubles_inner_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}

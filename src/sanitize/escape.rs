//! Literal escaping for inline substitution

use serde_json::Value;

/// Render a value as a SQL literal.
///
/// * null: `NULL`
/// * booleans: `TRUE` / `FALSE`
/// * numbers: unchanged
/// * strings: single-quoted, inner `'` doubled
/// * arrays: elements escaped and joined with `", "` (empty: `NULL`)
/// * objects: JSON text as a string literal
pub fn escape_value(value: &Value) -> String {
    let mut out = String::new();
    escape_into(&mut out, value);
    out
}

pub(crate) fn escape_into(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(true) => out.push_str("TRUE"),
        Value::Bool(false) => out.push_str("FALSE"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => quote_literal(out, s),
        Value::Array(items) if items.is_empty() => out.push_str("NULL"),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                escape_into(out, item);
            }
        }
        Value::Object(_) => quote_literal(out, &value.to_string()),
    }
}

fn quote_literal(out: &mut String, s: &str) {
    out.reserve(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
}

//! Placeholder rewriting
//!
//! Templates use `?` as the placeholder. A `?` inside a single-quoted literal, a
//! double-quoted identifier, a `--` line comment or a `/* */` block comment is left
//! alone. Parameters are consumed left to right.

mod escape;

pub use escape::escape_value;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How placeholders are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `$1`, `$2`, ... with the values bound separately
    #[default]
    Positional,
    /// Escaped literals substituted into the text
    Inline,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positional => write!(f, "positional"),
            Self::Inline => write!(f, "inline"),
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "positional" => Ok(Self::Positional),
            "inline" => Ok(Self::Inline),
            _ => Err(Error::Config(format!(
                "invalid dialect '{}': expected positional or inline",
                s
            ))),
        }
    }
}

/// Query text ready to send, plus the values to bind
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedQuery {
    /// Rewritten query text
    pub sql: String,
    /// Values for `$n` markers, in order (empty for [`Dialect::Inline`])
    pub values: Vec<Value>,
}

/// Rewrite `?` placeholders in `template` for `dialect`.
///
/// # Errors
///
/// `Error::ParamCountMismatch` when there are more placeholders than parameters.
/// Extra parameters are ignored.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use wirepool::{sanitize, Dialect};
///
/// let q = sanitize("SELECT * FROM t WHERE a = ? AND b = ?", &[json!(1), json!("x")], Dialect::Positional)?;
/// assert_eq!(q.sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
///
/// let q = sanitize("SELECT * FROM t WHERE name = ?", &[json!("O'Brien")], Dialect::Inline)?;
/// assert_eq!(q.sql, "SELECT * FROM t WHERE name = 'O''Brien'");
/// # Ok::<(), wirepool::Error>(())
/// ```
pub fn sanitize(template: &str, params: &[Value], dialect: Dialect) -> Result<SanitizedQuery> {
    let positions = placeholder_positions(template);

    if positions.len() > params.len() {
        return Err(Error::ParamCountMismatch {
            placeholders: positions.len(),
            supplied: params.len(),
        });
    }
    if params.len() > positions.len() {
        tracing::debug!(
            placeholders = positions.len(),
            supplied = params.len(),
            "ignoring extra parameters"
        );
    }

    let mut sql = String::with_capacity(template.len() + positions.len() * 4);
    let mut values = Vec::new();
    let mut last = 0;

    for (index, (&pos, value)) in positions.iter().zip(params).enumerate() {
        sql.push_str(&template[last..pos]);
        match dialect {
            Dialect::Positional => {
                sql.push('$');
                sql.push_str(&(index + 1).to_string());
                values.push(value.clone());
            }
            Dialect::Inline => escape::escape_into(&mut sql, value),
        }
        last = pos + 1;
    }
    sql.push_str(&template[last..]);

    Ok(SanitizedQuery { sql, values })
}

/// Number of placeholders in `template`
pub fn count_placeholders(template: &str) -> usize {
    placeholder_positions(template).len()
}

/// Byte offsets of `?` outside quoted text and comments
fn placeholder_positions(template: &str) -> Vec<usize> {
    let bytes = template.as_bytes();
    let mut positions = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => {
                // A doubled quote is an escaped quote
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'?' => positions.push(i),
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    // Runs to the end of the line
                    i = bytes[i..]
                        .iter()
                        .position(|&c| c == b'\n')
                        .map_or(bytes.len(), |p| i + p);
                    continue;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    // Not nested; unterminated runs to the end
                    i = bytes[i + 2..]
                        .windows(2)
                        .position(|w| w == b"*/")
                        .map_or(bytes.len(), |p| i + 2 + p + 2);
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }

    positions
}

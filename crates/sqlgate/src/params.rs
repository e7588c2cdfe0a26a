//! Rewrites `:name` placeholders into the positional form a driver expects.

use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};

/// Named parameter values as submitted by callers.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... ; a repeated name reuses its index.
    Numbered,
    /// `?` ; a repeated name binds its value again.
    QuestionMark,
}

/// SQL text with positional placeholders and the values in binding order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Replaces every `:name` outside literals, quoted identifiers and comments.
///
/// `::` (PostgreSQL casts) and a colon not followed by an identifier start
/// are copied verbatim. A placeholder without a value in `params` fails with
/// a validation error; unused entries in `params` are ignored.
pub fn bind_named(sql: &str, params: &Params, style: PlaceholderStyle) -> GatewayResult<BoundStatement> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut numbered: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = closing_quote(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| *ch == '\n')
                    .map_or(chars.len(), |pos| i + pos);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_block_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars.get(i + 1).is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_') => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params.get(&name).ok_or_else(|| {
                    GatewayError::validation(format!("missing value for parameter :{name}"))
                })?;
                match style {
                    PlaceholderStyle::Numbered => {
                        let index = match numbered.iter().position(|seen| *seen == name) {
                            Some(pos) => pos + 1,
                            None => {
                                numbered.push(name);
                                values.push(value.clone());
                                numbered.len()
                            }
                        };
                        out.push('$');
                        out.push_str(&index.to_string());
                    }
                    PlaceholderStyle::QuestionMark => {
                        values.push(value.clone());
                        out.push('?');
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(BoundStatement { sql: out, values })
}

/// True when `sql` carries statement text after a top-level `;`.
///
/// Semicolons inside literals, quoted identifiers and comments do not count,
/// and a trailing terminator followed only by whitespace or comments is fine.
pub fn has_stacked_statement(sql: &str) -> bool {
    let chars: Vec<char> = sql.chars().collect();
    let mut terminated = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '-' if chars.get(i + 1) == Some(&'-') => {
                i = chars[i..]
                    .iter()
                    .position(|ch| *ch == '\n')
                    .map_or(chars.len(), |pos| i + pos);
            }
            '/' if chars.get(i + 1) == Some(&'*') => i = find_block_end(&chars, i + 2),
            _ if terminated && !c.is_whitespace() && c != ';' => return true,
            '\'' | '"' | '`' => i = closing_quote(&chars, i, c),
            ';' => {
                terminated = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    false
}

/// Index just past the quote closing the one at `start`. Doubled quotes are
/// escapes. An unterminated literal runs to the end of the input.
fn closing_quote(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find_block_end(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn numbered_style_reuses_indexes() {
        let bound = bind_named(
            "SELECT * FROM t WHERE a = :id OR b = :id AND c = :name",
            &params(json!({"id": 7, "name": "x", "unused": true})),
            PlaceholderStyle::Numbered,
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = $1 OR b = $1 AND c = $2");
        assert_eq!(bound.values, vec![json!(7), json!("x")]);
    }

    #[test]
    fn question_mark_style_repeats_values() {
        let bound = bind_named(
            "UPDATE t SET a = :v WHERE b = :v",
            &params(json!({"v": 1})),
            PlaceholderStyle::QuestionMark,
        )
        .unwrap();
        assert_eq!(bound.sql, "UPDATE t SET a = ? WHERE b = ?");
        assert_eq!(bound.values.len(), 2);
    }

    #[test]
    fn literals_comments_and_casts_are_untouched() {
        let sql = "SELECT ':skip', \"odd:col\", x::text -- :nope\n/* :also */ FROM t WHERE y = :y AND z = 'it''s :fine'";
        let bound = bind_named(sql, &params(json!({"y": 2})), PlaceholderStyle::Numbered).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT ':skip', \"odd:col\", x::text -- :nope\n/* :also */ FROM t WHERE y = $1 AND z = 'it''s :fine'"
        );
        assert_eq!(bound.values, vec![json!(2)]);
    }

    #[test]
    fn missing_parameter_is_a_validation_error() {
        let err = bind_named("SELECT :a", &Params::new(), PlaceholderStyle::QuestionMark).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(msg) if msg.contains(":a")));
    }

    #[test]
    fn stacked_statements_are_detected_outside_literals() {
        assert!(has_stacked_statement("SELECT 1 AS x; DELETE FROM t"));
        assert!(has_stacked_statement("UPDATE t SET v = v;DELETE FROM t"));
        assert!(has_stacked_statement("SELECT 1; -- note\n 'x'"));

        assert!(!has_stacked_statement("SELECT 1"));
        assert!(!has_stacked_statement("SELECT 1;  \n"));
        assert!(!has_stacked_statement("SELECT 1;; -- done\n/* end */"));
        assert!(!has_stacked_statement("SELECT ';DROP TABLE t' AS s, \"a;b\" FROM t"));
        assert!(!has_stacked_statement("SELECT 1 -- ; DELETE FROM t"));
        assert!(!has_stacked_statement("SELECT 1 /* ; DELETE FROM t */"));
    }

    #[test]
    fn statement_without_placeholders_is_unchanged() {
        let bound = bind_named("SELECT 1", &Params::new(), PlaceholderStyle::Numbered).unwrap();
        assert_eq!(bound.sql, "SELECT 1");
        assert!(bound.values.is_empty());
    }
}

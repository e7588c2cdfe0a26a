//! Leading-keyword classification of submitted SQL statements.

/// Statement class derived from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    ReadOnly,
    Write { is_delete: bool },
    Unclassifiable,
}

const READ_KEYWORDS: [&str; 2] = ["select", "with"];
const WRITE_KEYWORDS: [&str; 3] = ["insert", "update", "delete"];

/// Removes leading `--` line comments and `/* */` block comments.
///
/// An unterminated block comment stops the stripping, leaving the `/*` as the
/// first token so the statement cannot be classified.
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(idx) => after[idx + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(idx) => rest = after[idx + 2..].trim_start(),
                None => return rest,
            }
        } else {
            return rest;
        }
    }
}

/// Lower-cased leading keyword, or `None` for a blank statement.
///
/// The first whitespace-delimited token is cut at the first character that
/// cannot be part of an identifier, so `select*from t` yields `select`.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let token = strip_leading_comments(sql).split_whitespace().next()?;
    let keyword: String = token
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if keyword.is_empty() {
        // Punctuation-led tokens such as `(select` or `/*` still need a value
        // that matches no keyword.
        return Some(token.to_ascii_lowercase());
    }
    Some(keyword.to_ascii_lowercase())
}

pub fn classify(sql: &str) -> StatementClass {
    let Some(keyword) = leading_keyword(sql) else {
        return StatementClass::Unclassifiable;
    };
    if READ_KEYWORDS.contains(&keyword.as_str()) {
        StatementClass::ReadOnly
    } else if WRITE_KEYWORDS.contains(&keyword.as_str()) {
        StatementClass::Write {
            is_delete: keyword == "delete",
        }
    } else {
        StatementClass::Unclassifiable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_skipped_before_classifying() {
        assert_eq!(classify("-- comment\nSELECT 1"), StatementClass::ReadOnly);
        assert_eq!(
            classify("/* c */ INSERT INTO t VALUES (1)"),
            StatementClass::Write { is_delete: false }
        );
        assert_eq!(
            classify("/* a */ -- b\n  /* c */\n\tdelete from t"),
            StatementClass::Write { is_delete: true }
        );
    }

    #[test]
    fn blank_and_comment_only_statements_are_unclassifiable() {
        assert_eq!(classify("   "), StatementClass::Unclassifiable);
        assert_eq!(classify(""), StatementClass::Unclassifiable);
        assert_eq!(classify("-- nothing here"), StatementClass::Unclassifiable);
        assert_eq!(
            classify("/* never closed SELECT 1"),
            StatementClass::Unclassifiable
        );
    }

    #[test]
    fn cte_and_mixed_case_are_read_only() {
        assert_eq!(
            classify("WITH x AS (SELECT 1) SELECT * FROM x"),
            StatementClass::ReadOnly
        );
        assert_eq!(classify("SeLeCt*from t"), StatementClass::ReadOnly);
    }

    #[test]
    fn ddl_and_lookalikes_are_unclassifiable() {
        for sql in [
            "DROP TABLE t",
            "TRUNCATE t",
            "selectx from t",
            "(SELECT 1)",
            "PRAGMA table_info(t)",
        ] {
            assert_eq!(classify(sql), StatementClass::Unclassifiable, "{sql}");
        }
    }

    #[test]
    fn leading_keyword_is_lowercased() {
        assert_eq!(leading_keyword("  UPDATE t SET x = 1").as_deref(), Some("update"));
        assert_eq!(leading_keyword("\n"), None);
    }
}

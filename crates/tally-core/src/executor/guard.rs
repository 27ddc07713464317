//! Statement allow-list
//!
//! Every statement entering the executor is normalized and matched against a
//! fixed set of leading verbs before it reaches `SQLite`. Normalization strips
//! comments and trailing separators; any separator left after that means the
//! text carries more than one statement and is rejected outright.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static VERB_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(select|insert|update|delete|create\s+table|create\s+(?:unique\s+)?index)\b",
    )
    .expect("verb pattern is valid")
});

/// Leading verbs the executor admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementVerb {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    CreateIndex,
}

impl StatementVerb {
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Select)
    }

    pub const fn is_schema_change(self) -> bool {
        matches!(self, Self::CreateTable | Self::CreateIndex)
    }

    fn from_match(text: &str) -> Self {
        let lowered = text.to_ascii_lowercase();
        if lowered.starts_with("select") {
            Self::Select
        } else if lowered.starts_with("insert") {
            Self::Insert
        } else if lowered.starts_with("update") {
            Self::Update
        } else if lowered.starts_with("delete") {
            Self::Delete
        } else if lowered.ends_with("table") {
            Self::CreateTable
        } else {
            Self::CreateIndex
        }
    }
}

/// A statement that passed the allow-list, in normalized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedStatement {
    pub sql: String,
    pub verb: StatementVerb,
}

/// Normalize `statement` and match it against the verb allow-list.
pub fn authorize(statement: &str) -> Result<AuthorizedStatement> {
    let sql = normalize(statement)?;
    if sql.is_empty() {
        return Err(Error::UnauthorizedStatement("empty statement".into()));
    }
    if has_separator(&sql) {
        return Err(Error::UnauthorizedStatement(
            "multiple statements are not allowed".into(),
        ));
    }

    let verb = VERB_PATTERN
        .find(&sql)
        .map(|found| StatementVerb::from_match(found.as_str()))
        .ok_or_else(|| {
            let leading = sql.split_whitespace().next().unwrap_or_default();
            Error::UnauthorizedStatement(format!("verb `{leading}` is not allow-listed"))
        })?;

    Ok(AuthorizedStatement { sql, verb })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// Strip comments (outside literals) and trailing separators.
pub fn normalize(statement: &str) -> Result<String> {
    let mut output = String::with_capacity(statement.len());
    let mut state = Scan::Code;
    let mut chars = statement.chars().peekable();

    while let Some(current) = chars.next() {
        match state {
            Scan::Code => match current {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = Scan::LineComment;
                    output.push(' ');
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                    output.push(' ');
                }
                '\'' => {
                    state = Scan::SingleQuoted;
                    output.push(current);
                }
                '"' => {
                    state = Scan::DoubleQuoted;
                    output.push(current);
                }
                _ => output.push(current),
            },
            Scan::SingleQuoted => {
                output.push(current);
                if current == '\'' {
                    state = Scan::Code;
                }
            }
            Scan::DoubleQuoted => {
                output.push(current);
                if current == '"' {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                if current == '\n' {
                    state = Scan::Code;
                    output.push('\n');
                }
            }
            Scan::BlockComment => {
                if current == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = Scan::Code;
                }
            }
        }
    }

    match state {
        Scan::SingleQuoted | Scan::DoubleQuoted => Err(Error::UnauthorizedStatement(
            "unterminated literal".into(),
        )),
        Scan::BlockComment => Err(Error::UnauthorizedStatement(
            "unterminated comment".into(),
        )),
        Scan::Code | Scan::LineComment => Ok(output
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
            .trim()
            .to_string()),
    }
}

/// Whether `sql` contains a `;` outside string literals and quoted identifiers.
fn has_separator(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for current in sql.chars() {
        match quote {
            Some(open) if current == open => quote = None,
            Some(_) => {}
            None if current == '\'' || current == '"' => quote = Some(current),
            None if current == ';' => return true,
            None => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_parameterized_select() {
        let statement = authorize("SELECT * FROM products WHERE id = ?").unwrap();
        assert_eq!(statement.verb, StatementVerb::Select);
        assert_eq!(statement.sql, "SELECT * FROM products WHERE id = ?");
    }

    #[test]
    fn rejects_chained_drop() {
        let error = authorize("SELECT * FROM products; DROP TABLE products; --").unwrap_err();
        assert!(matches!(error, Error::UnauthorizedStatement(_)));
    }

    #[test]
    fn rejects_chain_hidden_behind_comment() {
        let error = authorize("SELECT 1 /* ; */; DELETE FROM products").unwrap_err();
        assert!(matches!(error, Error::UnauthorizedStatement(_)));
    }

    #[test]
    fn strips_trailing_separators_and_comments() {
        let statement = authorize("  update products set payload = ? where id = ? ;; -- done\n")
            .unwrap();
        assert_eq!(statement.verb, StatementVerb::Update);
        assert_eq!(statement.sql, "update products set payload = ? where id = ?");
    }

    #[test]
    fn separator_inside_literal_is_not_a_chain() {
        let statement = authorize("SELECT 'a;b' AS text").unwrap();
        assert_eq!(statement.verb, StatementVerb::Select);
    }

    #[test]
    fn comment_marker_inside_literal_is_kept() {
        let statement = authorize("SELECT '--not a comment' AS text").unwrap();
        assert_eq!(statement.sql, "SELECT '--not a comment' AS text");
    }

    #[test]
    fn rejects_verbs_outside_allow_list() {
        for statement in [
            "DROP TABLE products",
            "PRAGMA writable_schema = 1",
            "ATTACH DATABASE '/tmp/x' AS x",
            "CREATE TRIGGER t AFTER INSERT ON products BEGIN SELECT 1; END",
            "WITH x AS (SELECT 1) DELETE FROM products",
            "-- only a comment",
            "",
        ] {
            assert!(
                matches!(authorize(statement), Err(Error::UnauthorizedStatement(_))),
                "accepted: {statement}"
            );
        }
    }

    #[test]
    fn recognizes_schema_verbs() {
        assert_eq!(
            authorize("CREATE TABLE IF NOT EXISTS t (id TEXT)").unwrap().verb,
            StatementVerb::CreateTable
        );
        assert_eq!(
            authorize("create unique index if not exists i on t(id)").unwrap().verb,
            StatementVerb::CreateIndex
        );
    }

    #[test]
    fn selected_prefix_must_be_a_whole_word() {
        assert!(authorize("SELECTED * FROM products").is_err());
    }

    #[test]
    fn rejects_unterminated_literal() {
        assert!(authorize("SELECT 'open").is_err());
    }
}

//! SQL script splitting.
//!
//! Migrations are executed as a pipelined batch of individual statements,
//! so a script has to be cut on the semicolons that actually terminate a
//! statement. The splitter is a small state machine over characters that
//! tracks quoted strings, quoted identifiers, comments and dollar-quoted
//! bodies, plus SQL-standard `BEGIN ATOMIC ... END` routine bodies whose
//! inner semicolons do not end the statement. Top-level comments are dropped from the output; comments inside
//! quoted text are preserved verbatim.

use crate::error::{Result, StratumError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Default,
    /// `'...'`; `escapes` is set for `E'...'` strings where backslash escapes apply.
    SingleQuote { escapes: bool },
    DoubleQuote,
    LineComment,
    BlockComment { depth: usize },
    /// `$tag$ ... $tag$`; `delimiter` holds the full `$tag$` text.
    DollarBody { delimiter: String },
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Return the full `$tag$` delimiter starting at the beginning of `input`,
/// if there is one. Tags follow identifier rules and may be empty.
fn dollar_delimiter(input: &str) -> Option<&str> {
    let rest = input.strip_prefix('$')?;
    for (idx, c) in rest.char_indices() {
        if c == '$' {
            let numeric = rest[..idx].starts_with(|ch: char| ch.is_ascii_digit());
            return (!numeric).then(|| &input[..idx + 2]);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
    }
    None
}

/// Keyword tracking for `BEGIN ATOMIC ... END` bodies. Inside a body,
/// `CASE` opens a nested `END`.
#[derive(Debug, Default)]
struct AtomicBody {
    word: String,
    previous: String,
    depth: usize,
}

impl AtomicBody {
    fn feed(&mut self, c: char) {
        if c.is_alphanumeric() || c == '_' {
            self.word.push(c);
        } else {
            self.finish_word();
        }
    }

    fn finish_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let word = self.word.to_ascii_uppercase();
        self.word.clear();
        match word.as_str() {
            "ATOMIC" if self.depth == 0 && self.previous == "BEGIN" => self.depth = 1,
            "CASE" if self.depth > 0 => self.depth += 1,
            "END" if self.depth > 0 => self.depth -= 1,
            _ => {}
        }
        self.previous = word;
    }

    fn is_open(&self) -> bool {
        self.depth > 0
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

/// Split a SQL script into trimmed statements without their terminating
/// semicolons. Whitespace-only and comment-only statements are dropped.
///
/// Returns a [`StratumError::ParseError`] when the script ends inside a
/// quoted string, quoted identifier, block comment or dollar-quoted body.
pub fn split_statements(sql: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Default;
    let mut opened_at = 0;
    let mut atomic = AtomicBody::default();
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        match &mut state {
            State::Default => {
                let was_open = atomic.is_open();
                atomic.feed(c);
                if !was_open && atomic.is_open() {
                    opened_at = i;
                }
                match c {
                    ';' if atomic.is_open() => current.push(c),
                    ';' => push_statement(&mut statements, &mut current),
                    '\'' => {
                        let mut before = current.chars().rev();
                        let escapes = matches!(before.next(), Some('E') | Some('e'))
                            && !before.next().is_some_and(is_ident_char);
                        current.push(c);
                        opened_at = i;
                        state = State::SingleQuote { escapes };
                    }
                    '"' => {
                        current.push(c);
                        opened_at = i;
                        state = State::DoubleQuote;
                    }
                    '-' if next == Some('-') => {
                        chars.next();
                        state = State::LineComment;
                    }
                    '/' if next == Some('*') => {
                        chars.next();
                        opened_at = i;
                        state = State::BlockComment { depth: 1 };
                    }
                    '$' => {
                        let follows_ident = current.chars().last().is_some_and(is_ident_char);
                        match dollar_delimiter(&sql[i..]).filter(|_| !follows_ident) {
                            Some(delimiter) => {
                                current.push_str(delimiter);
                                for _ in 1..delimiter.chars().count() {
                                    chars.next();
                                }
                                opened_at = i;
                                state = State::DollarBody {
                                    delimiter: delimiter.to_string(),
                                };
                            }
                            None => current.push(c),
                        }
                    }
                    _ => current.push(c),
                }
            }
            State::SingleQuote { escapes } => {
                current.push(c);
                if *escapes && c == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == '\'' {
                    if next == Some('\'') {
                        chars.next();
                        current.push('\'');
                    } else {
                        state = State::Default;
                    }
                }
            }
            State::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    if next == Some('"') {
                        chars.next();
                        current.push('"');
                    } else {
                        state = State::Default;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = State::Default;
                }
            }
            State::BlockComment { depth } => {
                if c == '/' && next == Some('*') {
                    chars.next();
                    *depth += 1;
                } else if c == '*' && next == Some('/') {
                    chars.next();
                    *depth -= 1;
                    if *depth == 0 {
                        current.push(' ');
                        state = State::Default;
                    }
                }
            }
            State::DollarBody { delimiter } => {
                if c == '$' && sql[i..].starts_with(delimiter.as_str()) {
                    let len = delimiter.chars().count();
                    current.push_str(&sql[i..i + delimiter.len()]);
                    for _ in 1..len {
                        chars.next();
                    }
                    state = State::Default;
                } else {
                    current.push(c);
                }
            }
        }
    }

    atomic.finish_word();
    let unterminated = match &state {
        State::Default | State::LineComment if atomic.is_open() => {
            Some("BEGIN ATOMIC body".to_string())
        }
        State::Default | State::LineComment => None,
        State::SingleQuote { .. } => Some("quoted string".to_string()),
        State::DoubleQuote => Some("quoted identifier".to_string()),
        State::BlockComment { .. } => Some("block comment".to_string()),
        State::DollarBody { delimiter } => Some(format!("dollar-quoted body {}", delimiter)),
    };
    if let Some(what) = unterminated {
        return Err(StratumError::ParseError(format!(
            "unterminated {} starting at line {}",
            what,
            line_number_at(sql, opened_at)
        )));
    }

    push_statement(&mut statements, &mut current);
    Ok(statements)
}

/// 1-based line number of a byte offset.
pub fn line_number_at(sql: &str, offset: usize) -> usize {
    sql[..offset.min(sql.len())].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(sql: &str) -> Vec<String> {
        split_statements(sql).unwrap()
    }

    #[test]
    fn test_split_simple_statements() {
        assert_eq!(split("SELECT 1; SELECT 2;"), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_split_two_statement_migration() {
        assert_eq!(
            split("create table t(id int);\ndrop table t;"),
            vec!["create table t(id int)", "drop table t"]
        );
    }

    #[test]
    fn test_split_respects_string_literals() {
        assert_eq!(
            split("SELECT 'hello;world'; SELECT 2;"),
            vec!["SELECT 'hello;world'", "SELECT 2"]
        );
    }

    #[test]
    fn test_split_doubled_quote_escape() {
        assert_eq!(
            split("SELECT 'it''s; here'; SELECT 2;"),
            vec!["SELECT 'it''s; here'", "SELECT 2"]
        );
    }

    #[test]
    fn test_split_quoted_identifier() {
        assert_eq!(
            split(r#"CREATE TABLE "we;ird""name" (id int); SELECT 1"#),
            vec![r#"CREATE TABLE "we;ird""name" (id int)"#, "SELECT 1"]
        );
    }

    #[test]
    fn test_split_respects_dollar_quoting() {
        let stmts =
            split("CREATE FUNCTION foo() RETURNS void AS $$ BEGIN; END; $$ LANGUAGE plpgsql; SELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("BEGIN; END;"));
    }

    #[test]
    fn test_split_tagged_dollar_quoting_requires_matching_tag() {
        let sql = "CREATE FUNCTION f() RETURNS text AS $body$ SELECT $$;$$; $body$ LANGUAGE sql; SELECT 2;";
        let stmts = split(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("$body$ LANGUAGE sql"));
        assert_eq!(stmts[1], "SELECT 2");
    }

    #[test]
    fn test_split_keeps_begin_atomic_body_together() {
        let sql = "CREATE FUNCTION add(a int, b int) RETURNS int LANGUAGE sql\n\
                   BEGIN ATOMIC\n  SELECT CASE WHEN a > 0 THEN a ELSE 0 END + b;\n  SELECT 1;\nEND;\n\
                   SELECT 2;";
        let stmts = split(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE FUNCTION add"));
        assert!(stmts[0].contains("ELSE 0 END + b;\n  SELECT 1;\nEND"));
        assert_eq!(stmts[1], "SELECT 2");
    }

    #[test]
    fn test_split_begin_transaction_is_not_atomic() {
        assert_eq!(
            split("begin; select 1; end; select 2;"),
            vec!["begin", "select 1", "end", "select 2"]
        );
        assert_eq!(split("select end_date from t; select 2"), vec!["select end_date from t", "select 2"]);
    }

    #[test]
    fn test_split_unterminated_begin_atomic_is_error() {
        let err = split_statements("create procedure p() begin atomic insert into t values (1);")
            .unwrap_err();
        assert!(matches!(err, StratumError::ParseError(msg) if msg.contains("BEGIN ATOMIC")));
    }

    #[test]
    fn test_split_positional_params_are_not_dollar_quotes() {
        let sql = "PREPARE q AS SELECT $1; SELECT a$b FROM t;";
        assert_eq!(split(sql), vec!["PREPARE q AS SELECT $1", "SELECT a$b FROM t"]);
    }

    #[test]
    fn test_split_drops_comments() {
        let sql = "-- header; with semicolon\ncreate table t(id int); -- trailing\n/* block; */ select 1;";
        assert_eq!(split(sql), vec!["create table t(id int)", "select 1"]);
    }

    #[test]
    fn test_split_nested_block_comments() {
        let stmts = split("SELECT /* outer /* inner; */ outer; */ 1; SELECT 2;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "SELECT 2");
    }

    #[test]
    fn test_split_comment_markers_inside_strings_are_kept() {
        assert_eq!(
            split("SELECT '-- not a comment', '/* nor this */';"),
            vec!["SELECT '-- not a comment', '/* nor this */'"]
        );
    }

    #[test]
    fn test_split_e_string_backslash_escape() {
        let stmts = split(r"SELECT E'it\'s; fine'; SELECT 1;");
        assert_eq!(stmts, vec![r"SELECT E'it\'s; fine'", "SELECT 1"]);
    }

    #[test]
    fn test_split_plain_string_backslash_is_literal() {
        let stmts = split(r"SELECT 'C:\'; SELECT 1;");
        assert_eq!(stmts, vec![r"SELECT 'C:\'", "SELECT 1"]);
    }

    #[test]
    fn test_split_preserves_multiline_statements() {
        let sql = "create table t (\n  id int,\n  name text\n);";
        assert_eq!(split(sql), vec!["create table t (\n  id int,\n  name text\n)"]);
    }

    #[test]
    fn test_split_no_trailing_semicolon() {
        assert_eq!(split("SELECT 1"), vec!["SELECT 1"]);
    }

    #[test]
    fn test_split_whitespace_and_comment_only() {
        assert!(split("   \n\t  ").is_empty());
        assert!(split("-- just a comment\n").is_empty());
        assert!(split("/* a */ ; ;").is_empty());
    }

    #[test]
    fn test_split_unterminated_string_is_error() {
        let err = split_statements("select 1;\nselect 'oops;").unwrap_err();
        match err {
            StratumError::ParseError(msg) => {
                assert!(msg.contains("quoted string"));
                assert!(msg.contains("line 2"));
            }
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn test_split_unterminated_constructs_are_errors() {
        assert!(split_statements("select \"abc").is_err());
        assert!(split_statements("select 1 /* open").is_err());
        assert!(split_statements("create function f() as $fn$ begin").is_err());
    }

    #[test]
    fn test_split_trailing_line_comment_without_newline_is_ok() {
        assert_eq!(split("select 1; -- done"), vec!["select 1"]);
    }

    #[test]
    fn test_dollar_delimiter() {
        assert_eq!(dollar_delimiter("$$ body"), Some("$$"));
        assert_eq!(dollar_delimiter("$fn$ body"), Some("$fn$"));
        assert_eq!(dollar_delimiter("$1"), None);
        assert_eq!(dollar_delimiter("$1$"), None);
        assert_eq!(dollar_delimiter("$a b$"), None);
    }

    #[test]
    fn test_line_number_at() {
        assert_eq!(line_number_at("a\nb\nc", 0), 1);
        assert_eq!(line_number_at("a\nb\nc", 2), 2);
        assert_eq!(line_number_at("a\nb\nc", 100), 3);
    }
}

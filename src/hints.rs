//! Hint-comment parsing and statement classification.
//!
//! Clients direct the proxy with `key:value` hints in a leading SQL
//! comment, e.g. `/* file:app.go line:42 ttl:60 batch:10 */ SELECT ...`.
//! Only comments before the first SQL token are inspected; recognized
//! hint comments are removed from the stripped text, unrelated comments
//! are preserved.

/// Upper cap applied to the `batch` hint, milliseconds.
const MAX_BATCH_MS: u64 = 1_000;

/// Statement classification derived from the first SQL keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Use,
    ShowStatus,
    Other,
}

/// An immutable parsed statement: original and stripped text, the
/// statement kind, and every hint the leading comments carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub text: String,
    pub stripped: String,
    pub kind: StatementKind,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Seconds; 0 means not cacheable.
    pub ttl_seconds: u64,
    /// Milliseconds; 0 means no batching. Clamped to [0, 1000].
    pub batch_ms: u64,
    /// Explicit database reference (`USE db`).
    pub database: Option<String>,
}

impl ParsedStatement {
    pub fn is_cacheable(&self) -> bool {
        self.kind == StatementKind::Select && self.ttl_seconds > 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }

    pub fn is_batchable(&self) -> bool {
        self.is_writable() && self.batch_ms > 0
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }

    /// The bytes that identify which writes coalesce.
    pub fn batch_key(&self) -> &str {
        &self.stripped
    }
}

/// Parser over the leading comments of one statement.
pub struct HintParser<'a> {
    text: &'a str,
}

impl<'a> HintParser<'a> {
    pub fn new(text: &'a str) -> HintParser<'a> {
        HintParser { text }
    }

    /// Parse the statement, consuming leading comments for hints.
    pub fn parse(&self) -> ParsedStatement {
        let mut file = None;
        let mut line = None;
        let mut ttl_seconds = 0u64;
        let mut batch_ms = 0u64;

        let mut stripped = String::with_capacity(self.text.len());
        let mut rest = self.text;

        // Walk leading whitespace and comments. A comment carrying at
        // least one recognized hint is dropped from the stripped text.
        loop {
            let trimmed = rest.trim_start();
            stripped.push_str(&rest[..rest.len() - trimmed.len()]);
            rest = trimmed;

            if let Some(after) = rest.strip_prefix("/*") {
                let Some(end) = after.find("*/") else {
                    // Unterminated comment, leave it alone.
                    break;
                };
                let body = &after[..end];
                let consumed = 2 + end + 2;
                if Self::scan_hints(body, &mut file, &mut line, &mut ttl_seconds, &mut batch_ms) {
                    rest = &rest[consumed..];
                } else {
                    stripped.push_str(&rest[..consumed]);
                    rest = &rest[consumed..];
                }
            } else if let Some(after) = rest.strip_prefix("--") {
                let end = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
                let body = &after[..end];
                let consumed = 2 + end;
                if Self::scan_hints(body, &mut file, &mut line, &mut ttl_seconds, &mut batch_ms) {
                    rest = &rest[consumed..];
                } else {
                    stripped.push_str(&rest[..consumed]);
                    rest = &rest[consumed..];
                }
            } else {
                break;
            }
        }

        stripped.push_str(rest);
        let stripped = stripped.trim().to_string();

        let kind = classify(&stripped);
        let database = match kind {
            StatementKind::Use => use_database(&stripped),
            _ => None,
        };

        // A hinted TTL is only meaningful on reads.
        if kind != StatementKind::Select {
            ttl_seconds = 0;
        }

        ParsedStatement {
            text: self.text.to_string(),
            stripped,
            kind,
            file,
            line,
            ttl_seconds,
            batch_ms,
            database,
        }
    }

    /// Scan one comment body for `key:value` hints. Returns true if at
    /// least one recognized hint was found, which marks the whole
    /// comment as a hint comment.
    fn scan_hints(
        body: &str,
        file: &mut Option<String>,
        line: &mut Option<u32>,
        ttl_seconds: &mut u64,
        batch_ms: &mut u64,
    ) -> bool {
        let mut recognized = false;

        for token in body.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            match key {
                "file" => {
                    *file = Some(value.to_string());
                    recognized = true;
                }
                "line" => {
                    *line = value.parse::<u32>().ok();
                    recognized = true;
                }
                "ttl" => {
                    // Negative or invalid values disable caching.
                    *ttl_seconds = value.parse::<i64>().unwrap_or(0).max(0) as u64;
                    recognized = true;
                }
                "batch" => {
                    *batch_ms = value
                        .parse::<i64>()
                        .unwrap_or(0)
                        .clamp(0, MAX_BATCH_MS as i64) as u64;
                    recognized = true;
                }
                // Unknown hints are ignored, not an error.
                _ => {}
            }
        }

        recognized
    }
}

/// Determine the statement kind from the first SQL keyword.
fn classify(stripped: &str) -> StatementKind {
    let mut words = stripped.split_whitespace();
    let Some(first) = words.next() else {
        return StatementKind::Other;
    };
    let first = first.trim_end_matches(';');

    if first.eq_ignore_ascii_case("select") {
        if is_pg_status_query(stripped) {
            return StatementKind::ShowStatus;
        }
        return StatementKind::Select;
    }
    if first.eq_ignore_ascii_case("insert") {
        return StatementKind::Insert;
    }
    if first.eq_ignore_ascii_case("update") {
        return StatementKind::Update;
    }
    if first.eq_ignore_ascii_case("delete") {
        return StatementKind::Delete;
    }
    if first.eq_ignore_ascii_case("begin") {
        return StatementKind::Begin;
    }
    if first.eq_ignore_ascii_case("start") {
        let second = words.next().unwrap_or("");
        if second.trim_end_matches(';').eq_ignore_ascii_case("transaction") {
            return StatementKind::Begin;
        }
        return StatementKind::Other;
    }
    if first.eq_ignore_ascii_case("commit") {
        return StatementKind::Commit;
    }
    if first.eq_ignore_ascii_case("rollback") {
        return StatementKind::Rollback;
    }
    if first.eq_ignore_ascii_case("use") {
        return StatementKind::Use;
    }
    if first.eq_ignore_ascii_case("show") {
        let second = words.next().unwrap_or("").trim_end_matches(';');
        let third = words.next().unwrap_or("").trim_end_matches(';');
        if second.eq_ignore_ascii_case("tqdb") && third.eq_ignore_ascii_case("status") {
            return StatementKind::ShowStatus;
        }
        return StatementKind::Other;
    }

    StatementKind::Other
}

fn is_pg_status_query(stripped: &str) -> bool {
    let lowered = stripped.to_ascii_lowercase();
    let compact: String = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    compact.trim_end_matches(';').trim_end()
        == "select * from pg_tqdb_status()"
}

/// Extract the database name of a `USE db` statement.
fn use_database(stripped: &str) -> Option<String> {
    let name = stripped
        .split_whitespace()
        .nth(1)?
        .trim_end_matches(';')
        .trim_matches('`');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Split a multi-statement query on unquoted `;`, respecting single
/// quotes, double quotes, backticks, backslash escapes, and comments.
/// Empty segments are dropped.
pub fn split_statements(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
        Backtick,
        LineComment,
        BlockComment,
    }
    let mut state = State::Normal;

    while i < bytes.len() {
        let c = bytes[i];
        match state {
            State::Normal => match c {
                b'\'' => state = State::Single,
                b'"' => state = State::Double,
                b'`' => state = State::Backtick,
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = State::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                b';' => {
                    let segment = text[start..i].trim();
                    if !segment.is_empty() {
                        statements.push(segment);
                    }
                    start = i + 1;
                }
                _ => {}
            },
            State::Single => match c {
                b'\\' => i += 1,
                b'\'' => state = State::Normal,
                _ => {}
            },
            State::Double => match c {
                b'\\' => i += 1,
                b'"' => state = State::Normal,
                _ => {}
            },
            State::Backtick => {
                if c == b'`' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = State::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        statements.push(tail);
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_hints() {
        let stmt =
            HintParser::new("/* file:app.go line:42 ttl:60 batch:10 */ SELECT * FROM users")
                .parse();

        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(stmt.file.as_deref(), Some("app.go"));
        assert_eq!(stmt.line, Some(42));
        assert_eq!(stmt.ttl_seconds, 60);
        assert_eq!(stmt.batch_ms, 10);
        assert_eq!(stmt.stripped, "SELECT * FROM users");
        assert!(stmt.is_cacheable());
        assert!(!stmt.is_batchable());
    }

    #[test]
    fn test_line_comment_hint() {
        let stmt = HintParser::new("-- ttl:5\nSELECT 1").parse();
        assert_eq!(stmt.ttl_seconds, 5);
        assert_eq!(stmt.stripped, "SELECT 1");
    }

    #[test]
    fn test_unrelated_comment_preserved() {
        let stmt = HintParser::new("/* keep me */ SELECT 1").parse();
        assert_eq!(stmt.stripped, "/* keep me */ SELECT 1");
        assert_eq!(stmt.kind, StatementKind::Select);
    }

    #[test]
    fn test_kind_detected_behind_preserved_comment() {
        let stmt = HintParser::new("/* note */ INSERT INTO t VALUES (1)").parse();
        assert_eq!(stmt.kind, StatementKind::Insert);
    }

    #[test]
    fn test_unknown_hint_ignored() {
        let stmt = HintParser::new("/* shard:7 ttl:30 */ SELECT 1").parse();
        assert_eq!(stmt.ttl_seconds, 30);
        assert_eq!(stmt.stripped, "SELECT 1");
    }

    #[test]
    fn test_hint_after_first_token_ignored() {
        let stmt = HintParser::new("SELECT 1 /* ttl:60 */").parse();
        assert_eq!(stmt.ttl_seconds, 0);
        assert_eq!(stmt.stripped, "SELECT 1 /* ttl:60 */");
    }

    #[test]
    fn test_batch_clamped_to_cap() {
        let stmt = HintParser::new("/* batch:5000 */ INSERT INTO t VALUES (1)").parse();
        assert_eq!(stmt.batch_ms, 1_000);
        assert!(stmt.is_batchable());
    }

    #[test]
    fn test_negative_and_invalid_values() {
        let stmt = HintParser::new("/* ttl:-5 batch:-1 */ SELECT 1").parse();
        assert_eq!(stmt.ttl_seconds, 0);
        assert_eq!(stmt.batch_ms, 0);

        let stmt = HintParser::new("/* ttl:abc batch:xyz */ SELECT 1").parse();
        assert_eq!(stmt.ttl_seconds, 0);
        assert_eq!(stmt.batch_ms, 0);
    }

    #[test]
    fn test_ttl_meaningless_on_writes() {
        let stmt = HintParser::new("/* ttl:60 */ UPDATE t SET v = 1").parse();
        assert_eq!(stmt.ttl_seconds, 0);
        assert!(!stmt.is_cacheable());
    }

    #[test]
    fn test_transaction_control() {
        assert_eq!(HintParser::new("BEGIN").parse().kind, StatementKind::Begin);
        assert_eq!(
            HintParser::new("start transaction").parse().kind,
            StatementKind::Begin
        );
        assert_eq!(
            HintParser::new("COMMIT;").parse().kind,
            StatementKind::Commit
        );
        assert_eq!(
            HintParser::new("rollback").parse().kind,
            StatementKind::Rollback
        );
        assert!(HintParser::new("BEGIN").parse().is_transaction_control());
    }

    #[test]
    fn test_use_statement() {
        let stmt = HintParser::new("USE `orders`;").parse();
        assert_eq!(stmt.kind, StatementKind::Use);
        assert_eq!(stmt.database.as_deref(), Some("orders"));
    }

    #[test]
    fn test_status_queries() {
        assert_eq!(
            HintParser::new("SHOW TQDB STATUS").parse().kind,
            StatementKind::ShowStatus
        );
        assert_eq!(
            HintParser::new("select * from pg_tqdb_status()").parse().kind,
            StatementKind::ShowStatus
        );
        assert_eq!(
            HintParser::new("SELECT * FROM pg_tqdb_status();").parse().kind,
            StatementKind::ShowStatus
        );
    }

    #[test]
    fn test_strip_reparse_idempotent() {
        let first = HintParser::new("/* ttl:60 batch:10 */ SELECT * FROM t WHERE id = 1").parse();
        let second = HintParser::new(&first.stripped).parse();

        assert_eq!(second.kind, first.kind);
        assert_eq!(second.ttl_seconds, 0);
        assert_eq!(second.batch_ms, 0);
        assert!(second.file.is_none());
        assert_eq!(second.stripped, first.stripped);
    }

    #[test]
    fn test_batch_key_is_stripped_text() {
        let a = HintParser::new("/* batch:10 */ INSERT INTO t(v) VALUES (?)").parse();
        let b = HintParser::new("/* batch:500 file:x.go */ INSERT INTO t(v) VALUES (?)").parse();
        assert_eq!(a.batch_key(), b.batch_key());
    }

    #[test]
    fn test_split_statements_plain() {
        assert_eq!(
            split_statements("SELECT 1; SELECT 2"),
            vec!["SELECT 1", "SELECT 2"]
        );
    }

    #[test]
    fn test_split_statements_quoted_semicolons() {
        assert_eq!(
            split_statements("INSERT INTO t VALUES ('a;b'); SELECT \";\""),
            vec!["INSERT INTO t VALUES ('a;b')", "SELECT \";\""]
        );
        assert_eq!(
            split_statements("SELECT `col;umn` FROM t"),
            vec!["SELECT `col;umn` FROM t"]
        );
    }

    #[test]
    fn test_split_statements_escapes_and_comments() {
        assert_eq!(
            split_statements(r"INSERT INTO t VALUES ('a\';b'); SELECT 1"),
            vec![r"INSERT INTO t VALUES ('a\';b')", "SELECT 1"]
        );
        assert_eq!(
            split_statements("SELECT 1 /* ; */; SELECT 2 -- ;\n"),
            vec!["SELECT 1 /* ; */", "SELECT 2 -- ;"]
        );
    }

    #[test]
    fn test_split_statements_trailing_semicolon() {
        assert_eq!(split_statements("SELECT 1;"), vec!["SELECT 1"]);
        assert_eq!(split_statements(";;"), Vec::<&str>::new());
    }
}

//! Statement boundaries in a SQL dump.
//!
//! Reads line by line and ends a statement at a line whose last character
//! is a `;` outside any quoted text. Quote state carries across lines, so a
//! string literal containing `;\n` stays in one statement. Blank lines and
//! `--` / `/*` comment lines are skipped only outside quotes.
//!
//! A `CREATE TRIGGER` body holds statements of its own, so inside one the
//! scanner also counts `BEGIN`/`CASE` against `END` and only closes the
//! trigger once they balance.

use std::io::{self, BufRead};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-indexed line the statement starts on.
    pub line: usize,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
    Backtick,
}

pub struct StatementScanner<R> {
    reader: R,
    backslash_escapes: bool,
    line_no: usize,
    quote: Quote,
    /// Previous character was a backslash inside a quote.
    escaped: bool,
    buffer: String,
    start_line: usize,
    /// Word being read outside quotes, upper-cased.
    word: String,
    /// First words of the current statement.
    lead: Vec<String>,
    trigger: bool,
    /// Open `BEGIN`/`CASE` blocks inside a trigger.
    depth: i32,
}

impl<R: BufRead> StatementScanner<R> {
    pub fn new(reader: R, backslash_escapes: bool) -> Self {
        Self {
            reader,
            backslash_escapes,
            line_no: 0,
            quote: Quote::None,
            escaped: false,
            buffer: String::new(),
            start_line: 0,
            word: String::new(),
            lead: Vec::new(),
            trigger: false,
            depth: 0,
        }
    }

    /// Lines consumed so far.
    pub fn lines_read(&self) -> usize {
        self.line_no
    }

    /// Advance quote state over `line` and report whether it ends outside quotes.
    fn track(&mut self, line: &str) -> bool {
        for c in line.chars() {
            if self.escaped {
                self.escaped = false;
                continue;
            }
            if self.quote == Quote::None {
                if c.is_ascii_alphanumeric() || c == '_' {
                    self.word.push(c.to_ascii_uppercase());
                    continue;
                }
                self.end_word();
            }
            self.quote = match (self.quote, c) {
                (Quote::None, '\'') => Quote::Single,
                (Quote::None, '"') => Quote::Double,
                (Quote::None, '`') => Quote::Backtick,
                (Quote::Single, '\'') | (Quote::Double, '"') | (Quote::Backtick, '`') => Quote::None,
                (Quote::Single | Quote::Double, '\\') if self.backslash_escapes => {
                    self.escaped = true;
                    self.quote
                }
                (q, _) => q,
            };
        }
        self.end_word();
        self.quote == Quote::None
    }

    fn end_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let word = std::mem::take(&mut self.word);
        if !self.trigger && self.lead.len() < 3 {
            self.lead.push(word.clone());
            self.trigger = opens_trigger(&self.lead);
        }
        if self.trigger {
            match word.as_str() {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => self.depth -= 1,
                _ => {}
            }
        }
    }

    fn take_statement(&mut self) -> Statement {
        self.lead.clear();
        self.trigger = false;
        self.depth = 0;
        Statement {
            line: self.start_line,
            sql: std::mem::take(&mut self.buffer),
        }
    }

    fn next_statement(&mut self) -> io::Result<Option<Statement>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                if self.buffer.trim().is_empty() {
                    self.buffer.clear();
                    return Ok(None);
                }
                // Trailing statement without a terminator.
                return Ok(Some(self.take_statement()));
            }
            self.line_no += 1;

            let outside = self.quote == Quote::None;
            let trimmed = line.trim();
            if outside
                && (trimmed.is_empty() || trimmed.starts_with("--") || trimmed.starts_with("/*"))
            {
                continue;
            }

            if self.buffer.is_empty() {
                self.start_line = self.line_no;
            }
            self.buffer.push_str(&line);

            let closed = self.track(&line);
            let in_body = self.trigger && self.depth > 0;
            if closed && !in_body && line.trim_end().ends_with(';') {
                return Ok(Some(self.take_statement()));
            }
        }
    }
}

/// `CREATE [TEMP|TEMPORARY] TRIGGER`.
fn opens_trigger(lead: &[String]) -> bool {
    match lead {
        [create, trigger] => create == "CREATE" && trigger == "TRIGGER",
        [create, temp, trigger] => {
            create == "CREATE" && (temp == "TEMP" || temp == "TEMPORARY") && trigger == "TRIGGER"
        }
        _ => false,
    }
}

impl<R: BufRead> Iterator for StatementScanner<R> {
    type Item = io::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_statement().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(sql: &str, backslash: bool) -> Vec<Statement> {
        StatementScanner::new(sql.as_bytes(), backslash)
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_skips_comments_and_blank_lines() {
        let sql = "-- header\n\n/* note */\nCREATE TABLE t (id INT);\n\nINSERT INTO t VALUES (1);\n";
        let statements = scan(sql, false);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].line, 4);
        assert_eq!(statements[1].line, 6);
        assert_eq!(statements[1].sql.trim(), "INSERT INTO t VALUES (1);");
    }

    #[test]
    fn test_multi_line_statement_reports_start_line() {
        let sql = "INSERT INTO t VALUES\n(1, 'a'),\n(2, 'b');\n";
        let statements = scan(sql, false);
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].line, 1);
        assert!(statements[0].sql.contains("(2, 'b');"));
    }

    #[test]
    fn test_semicolon_inside_multi_line_literal() {
        let sql = "INSERT INTO t VALUES ('first;\n-- not a comment\n\nsecond');\nSELECT 1;\n";
        let statements = scan(sql, false);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].sql.contains("-- not a comment\n\nsecond"));
        assert_eq!(statements[1].line, 5);
    }

    #[test]
    fn test_doubled_quotes_stay_balanced() {
        let sql = "INSERT INTO t VALUES ('it''s;');\nSELECT 2;\n";
        let statements = scan(sql, false);
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_backslash_escapes_when_dialect_uses_them() {
        let sql = "INSERT INTO t VALUES ('a\\';\nb');\nSELECT 3;\n";
        let escaped = scan(sql, true);
        assert_eq!(escaped.len(), 2);
        assert!(escaped[0].sql.contains("b');"));

        // Without backslash escapes the quote closes after the backslash.
        let plain = scan(sql, false);
        assert_eq!(plain[0].sql, "INSERT INTO t VALUES ('a\\';\n");
    }

    #[test]
    fn test_trigger_body_is_one_statement() {
        let sql = "CREATE TRIGGER wp_posts_log AFTER INSERT ON wp_posts\nBEGIN\n  INSERT INTO wp_log VALUES (NEW.ID, 'end;');\n  UPDATE wp_log SET n = CASE WHEN n < 0 THEN 0 ELSE n END;\nEND;\nINSERT INTO wp_posts VALUES (1);\n";
        let statements = scan(sql, false);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].sql.trim_end().ends_with("END;"));
        assert_eq!(statements[1].line, 6);
    }

    #[test]
    fn test_temp_trigger_and_begin_transaction() {
        let sql = "BEGIN TRANSACTION;\nCREATE TEMP TRIGGER t AFTER DELETE ON a BEGIN\nDELETE FROM b;\nEND;\nCOMMIT;\n";
        let statements = scan(sql, false);
        let lines: Vec<usize> = statements.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 2, 5]);
    }

    #[test]
    fn test_unterminated_tail_is_returned() {
        let statements = scan("SELECT 1;\nSELECT 2", false);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].sql, "SELECT 2");
    }
}

//! Line-oriented cleanup of Oracle dump text.
//!
//! Dumps mix INSERT statements with SQL*Plus directives, comments and
//! schema-qualified names. The cleaner drops the non-data lines, strips the
//! qualifiers, joins multi-line statements and forwards only complete INSERTs,
//! rewritten for the target dialect.

use crate::dialect::{self, Dialect, collapse_whitespace, schema_token_regex};
use regex::Regex;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

/// Leading keywords of lines that never carry row data.
const DIRECTIVE_KEYWORDS: &[&str] = &[
    "REM", "REMARK", "PROMPT", "SET", "CONNECT", "DEFINE", "UNDEFINE", "WHENEVER", "COMMIT",
    "ROLLBACK", "EXEC", "EXECUTE", "COLUMN", "TTITLE", "BTITLE", "BREAK", "COMPUTE", "SPOOL",
    "CLEAR", "PAUSE", "ACCEPT", "VARIABLE", "PRINT",
];

static QUALIFIER_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_qualifier_regex() -> &'static Regex {
    QUALIFIER_REGEX.get_or_init(|| {
        Regex::new(r#"(?i)\bINSERT\s+INTO\s+(?:(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|\w+)\s*\.\s*)+"#)
            .expect("Invalid insert qualifier regex")
    })
}

/// True for lines that are not part of any statement: blanks, comments and
/// SQL*Plus/session directives. Matching is case-insensitive on whole words.
pub fn is_directive_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return true;
    }
    if trimmed.starts_with("--")
        || trimmed.starts_with("/*")
        || trimmed.starts_with("*/")
        || trimmed.starts_with('@')
    {
        return true;
    }

    let mut words = trimmed
        .split(|ch: char| ch.is_whitespace() || ch == ';')
        .filter(|word| !word.is_empty());
    let Some(first) = words.next() else {
        return true;
    };

    if first.eq_ignore_ascii_case("ALTER") {
        return words
            .next()
            .is_some_and(|second| second.eq_ignore_ascii_case("SESSION"));
    }

    DIRECTIVE_KEYWORDS
        .iter()
        .any(|keyword| first.eq_ignore_ascii_case(keyword))
}

/// `line` without a trailing `--` comment. Dashes inside single- or
/// double-quoted text are data and stay.
pub fn strip_line_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        match quote {
            Some(open) if byte == open => quote = None,
            Some(_) => {}
            None if byte == b'\'' || byte == b'"' => quote = Some(byte),
            None if byte == b'-' && bytes.get(i + 1) == Some(&b'-') => return &line[..i],
            None => {}
        }
        i += 1;
    }
    line
}

/// Whether `line` (already known not to be a directive) closes a statement.
pub fn ends_statement(line: &str) -> bool {
    strip_line_comment(line).trim_end().ends_with(';')
}

#[derive(Debug, Clone)]
pub struct StatementCleaner {
    dialect: Dialect,
    schema_patterns: Vec<Regex>,
}

impl StatementCleaner {
    pub fn new(dialect: Dialect, source_schemas: &[String]) -> Self {
        let schema_patterns = source_schemas
            .iter()
            .map(|schema| schema.trim())
            .filter(|schema| !schema.is_empty())
            .map(schema_token_regex)
            .collect();
        Self {
            dialect,
            schema_patterns,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn strip_fragment(&self, text: &str) -> String {
        let mut text = get_qualifier_regex()
            .replace_all(text, "INSERT INTO ")
            .into_owned();
        for pattern in &self.schema_patterns {
            text = pattern.replace_all(&text, "").into_owned();
        }
        collapse_whitespace(&text)
    }

    /// Clean one raw line. `None` means the line carries no statement text.
    pub fn clean_line(&self, line: &str) -> Option<String> {
        if is_directive_line(line) {
            return None;
        }
        let cleaned = self.strip_fragment(strip_line_comment(line));
        (!cleaned.is_empty()).then_some(cleaned)
    }

    /// Final pass over one accumulated statement. Anything that is not an
    /// INSERT is rejected; accepted statements are rewritten for the target.
    /// Cleaning an already-cleaned statement returns it unchanged.
    pub fn clean_statement(&self, statement: &str) -> Option<String> {
        let cleaned = self.strip_fragment(statement);
        let is_insert = cleaned
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"));
        if !is_insert {
            if !cleaned.is_empty() {
                log::trace!("dropping non-insert statement: {:.80}", cleaned);
            }
            return None;
        }
        let cleaned = dialect::unquote_insert_head(&cleaned);
        Some(dialect::translate_insert(self.dialect, &cleaned))
    }

    /// Read every complete INSERT statement from `reader`, in source order.
    ///
    /// Lines are joined with a single space until one ends with `;`, ignoring a
    /// trailing `--` comment. A trailing statement without a terminator is
    /// still returned when it is an INSERT. Input that is not UTF-8 fails with
    /// [`io::ErrorKind::InvalidData`].
    pub fn collect_statements<R: BufRead>(&self, mut reader: R) -> io::Result<Vec<String>> {
        let mut statements = Vec::new();
        let mut buffer = String::new();
        let mut raw = Vec::new();
        let mut in_block_comment = false;
        let mut line_number = 0usize;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line_number += 1;
            let line = std::str::from_utf8(&raw).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line {} is not valid UTF-8: {}", line_number, err),
                )
            })?;
            let line = line.trim();

            if in_block_comment {
                in_block_comment = !line.contains("*/");
                continue;
            }
            if line.starts_with("/*") && !line.contains("*/") {
                in_block_comment = true;
                continue;
            }

            let Some(fragment) = self.clean_line(line) else {
                continue;
            };
            if !buffer.is_empty() {
                buffer.push(' ');
            }
            buffer.push_str(&fragment);

            if ends_statement(&buffer) {
                if let Some(statement) = self.clean_statement(&buffer) {
                    statements.push(statement);
                }
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            if let Some(statement) = self.clean_statement(&buffer) {
                statements.push(statement);
            }
        }

        Ok(statements)
    }

    /// Load the statements of one chunk file.
    pub fn load_chunk(&self, path: &Path) -> io::Result<Vec<String>> {
        let file = File::open(path)?;
        self.collect_statements(BufReader::new(file))
    }
}

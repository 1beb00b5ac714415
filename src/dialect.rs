//! Target dialects and the regex-based translation layer.
//!
//! Every function here maps statement text to statement text, so the rewrites
//! can be exercised without a database. Callers pick the behaviour through the
//! [`Dialect`] of the destination connection.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DialectError {
    #[error("unsupported database type '{0}' (supported: doris, postgresql)")]
    Unsupported(String),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
}

/// Destination database flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Apache Doris, reached through its MySQL-compatible frontend.
    Doris,
    #[serde(rename = "postgresql")]
    Postgres,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Doris => "doris",
            Dialect::Postgres => "postgresql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Doris => 9030,
            Dialect::Postgres => 5432,
        }
    }

    pub fn default_user(&self) -> &'static str {
        match self {
            Dialect::Doris => "root",
            Dialect::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = DialectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "doris" => Ok(Dialect::Doris),
            "postgresql" | "postgres" | "pg" => Ok(Dialect::Postgres),
            other => Err(DialectError::Unsupported(other.to_string())),
        }
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("invalid dialect regex"))
}

fn use_statement_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?i)\bUSE\s+\w+\s*;?\s*")
}

fn create_table_qualifier_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r#"(?i)\bCREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(?:(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|\w+)\s*\.\s*)+"#,
    )
}

fn table_name_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r#"(?i)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|\w+)\s*\.\s*)*["`\[]?(\w+)["`\]]?"#,
    )
}

fn to_date_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?i)\bTO_DATE\s*\(\s*('(?:[^']|'')*')\s*,\s*'([^']*)'\s*\)",
    )
}

fn values_keyword_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?i)\bVALUES\b")
}

fn whitespace_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"\s+")
}

/// Column type rewrites applied to DDL bound for PostgreSQL, in order.
fn postgres_type_rules() -> &'static [(Regex, &'static str)] {
    static CELL: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    CELL.get_or_init(|| {
        [
            (r"(?i)\bTINYINT\b", "SMALLINT"),
            (r"(?i)\bINT\b", "INTEGER"),
            (r"(?i)\bDOUBLE(?:\s+PRECISION)?\b", "DOUBLE PRECISION"),
            (r"(?i)\bFLOAT\b", "REAL"),
            (r"(?i)\bDATETIME\b", "TIMESTAMP"),
            (r"(?i)\b(?:LONG|MEDIUM|TINY)TEXT\b", "TEXT"),
            (r"(?i)\bNUMBER\s*\(\s*(\d+)\s*,\s*(-?\d+)\s*\)", "NUMERIC($1,$2)"),
            (r"(?i)\bNUMBER\s*\(\s*(\d+)\s*\)", "NUMERIC($1)"),
            (r"(?i)\bNUMBER\b", "NUMERIC"),
            (
                r"(?i)\bN?VARCHAR2\s*\(\s*(\d+)(?:\s+(?:CHAR|BYTE))?\s*\)",
                "VARCHAR($1)",
            ),
            (r"(?i)\bN?CLOB\b", "TEXT"),
            (r"(?i)\bBLOB\b", "BYTEA"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| {
            (
                Regex::new(pattern).expect("invalid type rewrite regex"),
                replacement,
            )
        })
        .collect()
    })
}

/// Table options and clauses PostgreSQL does not understand.
fn postgres_strip_rules() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        [
            r"(?i)\bENGINE\s*=\s*\w+",
            r"(?i)\bDEFAULT\s+CHARSET\s*=\s*\w+",
            r"(?i)\bCHARSET\s*=\s*\w+",
            r"(?i)\bCOLLATE\s*=\s*\w+",
            r"(?i)\bAUTO_INCREMENT(?:\s*=\s*\d+)?",
            r"(?i)\bCOMMENT\s*=?\s*'(?:[^']|'')*'",
            r"(?i)\b(?:DUPLICATE|UNIQUE|AGGREGATE)\s+KEY\s*\([^)]*\)",
            r"(?i)\bDISTRIBUTED\s+BY\s+HASH\s*\([^)]*\)(?:\s+BUCKETS\s+(?:\d+|AUTO))?",
            r"(?i)\bPROPERTIES\s*\((?:[^()]|\([^()]*\))*\)",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("invalid clause strip regex"))
        .collect()
    })
}

/// Build the patterns that erase a known source-schema token, bracketed or bare,
/// together with a following dot.
pub(crate) fn schema_token_regex(token: &str) -> Regex {
    let escaped = regex::escape(token);
    Regex::new(&format!(
        r#"(?i)(?:\[{escaped}\]|"{escaped}"|\b{escaped}\b)(?:\s*\.)?"#
    ))
    .expect("escaped schema token always forms a valid regex")
}

/// Collapse whitespace runs to a single space and trim both ends.
pub fn collapse_whitespace(text: &str) -> String {
    whitespace_regex().replace_all(text, " ").trim().to_string()
}

/// Rewrite a `CREATE TABLE` statement for the target dialect.
///
/// Both dialects lose `USE <db>;` prefixes, schema qualifiers on the table name
/// and any known source-schema token. PostgreSQL additionally gets its column
/// types mapped and MySQL/Doris table options removed.
pub fn translate_ddl(dialect: Dialect, ddl: &str, source_schemas: &[String]) -> String {
    let mut ddl = use_statement_regex().replace_all(ddl, "").into_owned();
    ddl = create_table_qualifier_regex()
        .replace_all(&ddl, "CREATE TABLE $1")
        .into_owned();
    for token in source_schemas.iter().filter(|token| !token.is_empty()) {
        ddl = schema_token_regex(token).replace_all(&ddl, "").into_owned();
    }

    if dialect == Dialect::Postgres {
        for (pattern, replacement) in postgres_type_rules() {
            ddl = pattern.replace_all(&ddl, *replacement).into_owned();
        }
        for pattern in postgres_strip_rules() {
            ddl = pattern.replace_all(&ddl, "").into_owned();
        }
        ddl = tidy_separators(&ddl);
    }

    collapse_whitespace(&ddl)
}

fn tidy_separators(ddl: &str) -> String {
    static DOUBLE_COMMA: OnceLock<Regex> = OnceLock::new();
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    static SPACE_BEFORE_COMMA: OnceLock<Regex> = OnceLock::new();

    let mut ddl = regex(&SPACE_BEFORE_COMMA, r"\s+,")
        .replace_all(ddl, ",")
        .into_owned();
    // Stripped clauses can leave ", ," behind; loop until stable.
    loop {
        let next = regex(&DOUBLE_COMMA, r",\s*,").replace_all(&ddl, ",").into_owned();
        if next == ddl {
            break;
        }
        ddl = next;
    }
    regex(&TRAILING_COMMA, r",\s*\)")
        .replace_all(&ddl, ")")
        .into_owned()
}

/// Dialect-specific rewrites for a single complete INSERT statement.
///
/// Oracle `TO_DATE(value, format)` becomes `STR_TO_DATE` with a MySQL format for
/// Doris. PostgreSQL keeps `TO_DATE` for date-only formats and switches to
/// `TO_TIMESTAMP` when the format carries a time of day. Applying this twice
/// yields the same text as applying it once.
pub fn translate_insert(dialect: Dialect, statement: &str) -> String {
    to_date_regex()
        .replace_all(statement, |caps: &Captures<'_>| {
            let literal = &caps[1];
            let format = &caps[2];
            match dialect {
                Dialect::Doris => {
                    format!("STR_TO_DATE({literal}, '{}')", oracle_to_mysql_format(format))
                }
                Dialect::Postgres if oracle_format_has_time(format) => {
                    format!("TO_TIMESTAMP({literal}, '{format}')")
                }
                Dialect::Postgres => caps[0].to_string(),
            }
        })
        .into_owned()
}

const ORACLE_FORMAT_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("HH24", "%H"),
    ("HH12", "%h"),
    ("MON", "%b"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%h"),
    ("MI", "%i"),
    ("SS", "%s"),
];

fn oracle_to_mysql_format(format: &str) -> String {
    let upper = format.to_ascii_uppercase();
    let mut output = String::with_capacity(format.len() + 8);
    let mut position = 0;

    'scan: while position < upper.len() {
        let rest = &upper[position..];
        for (token, replacement) in ORACLE_FORMAT_TOKENS {
            if rest.starts_with(token) {
                output.push_str(replacement);
                position += token.len();
                continue 'scan;
            }
        }
        let Some(ch) = format[position..].chars().next() else {
            break;
        };
        output.push(ch);
        position += ch.len_utf8();
    }

    output
}

fn oracle_format_has_time(format: &str) -> bool {
    let upper = format.to_ascii_uppercase();
    upper.contains("HH") || upper.contains("MI") || upper.contains("SS")
}

/// Drop double quotes around identifiers in the head of an INSERT (the part
/// before `VALUES`). Oracle exports quote upper-case names; unquoted names
/// resolve in both targets.
pub fn unquote_insert_head(statement: &str) -> String {
    let Some(values) = values_keyword_regex().find(statement) else {
        return statement.to_string();
    };
    let (head, tail) = statement.split_at(values.start());
    if !head.contains('"') || head.contains('\'') {
        return statement.to_string();
    }
    format!("{}{}", head.replace('"', ""), tail)
}

/// Table name declared by a `CREATE TABLE` statement, without schema prefix or quoting.
pub fn extract_table_name(ddl: &str) -> Option<String> {
    table_name_regex()
        .captures(ddl)
        .map(|caps| caps[1].to_string())
}

/// Accept only plain identifiers, since table names are interpolated into SQL.
pub fn validate_identifier(name: &str) -> Result<&str, DialectError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$')
        }
        _ => false,
    };

    if valid {
        Ok(name)
    } else {
        Err(DialectError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("doris".parse::<Dialect>(), Ok(Dialect::Doris));
        assert_eq!("PostgreSQL".parse::<Dialect>(), Ok(Dialect::Postgres));
        assert_eq!("pg".parse::<Dialect>(), Ok(Dialect::Postgres));
        assert_eq!(
            "oracle".parse::<Dialect>(),
            Err(DialectError::Unsupported("oracle".to_string()))
        );
        assert_eq!(Dialect::Postgres.to_string(), "postgresql");
        assert_eq!(Dialect::Doris.default_port(), 9030);
    }

    #[test]
    fn test_translate_ddl_for_postgres() {
        let ddl = "USE emr;\nCREATE TABLE emr.patients (\n  id INT NOT NULL,\n  name VARCHAR2(64 CHAR),\n  score NUMBER(10,2),\n  weight DOUBLE,\n  notes CLOB,\n  photo BLOB,\n  seen DATETIME\n) ENGINE=OLAP DEFAULT CHARSET=utf8;";
        let translated = translate_ddl(Dialect::Postgres, ddl, &[]);

        assert_eq!(
            translated,
            "CREATE TABLE patients ( id INTEGER NOT NULL, name VARCHAR(64), score NUMERIC(10,2), weight DOUBLE PRECISION, notes TEXT, photo BYTEA, seen TIMESTAMP ) ;"
        );
    }

    #[test]
    fn test_translate_ddl_strips_doris_clauses_for_postgres() {
        let ddl = "CREATE TABLE t (id BIGINT COMMENT 'primary id', v TEXT) DUPLICATE KEY(id) DISTRIBUTED BY HASH(id) BUCKETS 10 PROPERTIES (\"replication_num\" = \"1\");";
        let translated = translate_ddl(Dialect::Postgres, ddl, &[]);

        assert_eq!(translated, "CREATE TABLE t (id BIGINT, v TEXT) ;");
    }

    #[test]
    fn test_translate_ddl_keeps_doris_types() {
        let ddl = "CREATE TABLE [EMR_HIS].orders (id INT, total DOUBLE) DISTRIBUTED BY HASH(id) BUCKETS 1;";
        let translated = translate_ddl(Dialect::Doris, ddl, &["EMR_HIS".to_string()]);

        assert_eq!(
            translated,
            "CREATE TABLE orders (id INT, total DOUBLE) DISTRIBUTED BY HASH(id) BUCKETS 1;"
        );
    }

    #[test]
    fn test_translate_insert_to_date_for_doris() {
        let statement =
            "INSERT INTO t VALUES (1, TO_DATE('2021-03-04 05:06:07', 'YYYY-MM-DD HH24:MI:SS'));";
        let translated = translate_insert(Dialect::Doris, statement);

        assert_eq!(
            translated,
            "INSERT INTO t VALUES (1, STR_TO_DATE('2021-03-04 05:06:07', '%Y-%m-%d %H:%i:%s'));"
        );
        assert_eq!(translate_insert(Dialect::Doris, &translated), translated);
    }

    #[test]
    fn test_translate_insert_to_date_for_postgres() {
        let with_time = "INSERT INTO t VALUES (TO_DATE('2021-03-04 05:06', 'yyyy-mm-dd hh24:mi'));";
        assert_eq!(
            translate_insert(Dialect::Postgres, with_time),
            "INSERT INTO t VALUES (TO_TIMESTAMP('2021-03-04 05:06', 'yyyy-mm-dd hh24:mi'));"
        );

        let date_only = "INSERT INTO t VALUES (TO_DATE('2021-03-04', 'YYYY-MM-DD'));";
        assert_eq!(translate_insert(Dialect::Postgres, date_only), date_only);
    }

    #[test]
    fn test_unquote_insert_head() {
        assert_eq!(
            unquote_insert_head(r#"INSERT INTO "PATIENTS" ("ID","NAME") VALUES (1,'say "hi"');"#),
            r#"INSERT INTO PATIENTS (ID,NAME) VALUES (1,'say "hi"');"#
        );
        assert_eq!(
            unquote_insert_head("INSERT INTO t SELECT 1;"),
            "INSERT INTO t SELECT 1;"
        );
    }

    #[test]
    fn test_extract_table_name() {
        assert_eq!(
            extract_table_name("CREATE TABLE IF NOT EXISTS db.`orders` (id INT)"),
            Some("orders".to_string())
        );
        assert_eq!(
            extract_table_name("create table patients(id int)"),
            Some("patients".to_string())
        );
        assert_eq!(extract_table_name("DROP TABLE x"), None);
    }

    #[test]
    fn test_validate_identifier() {
        assert_eq!(validate_identifier("orders_2024"), Ok("orders_2024"));
        assert!(validate_identifier("1orders").is_err());
        assert!(validate_identifier("orders; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }
}

//! SQL parsing utilities for routing statements to callback processors.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::hooks::CallbackKind;

/// SQL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Other,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Create => "CREATE",
            SqlOperation::Drop => "DROP",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Truncate => "TRUNCATE",
            SqlOperation::Other => "QUERY",
        }
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The connection entry point a statement arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// `ConnectionTrait::execute`
    Execute,
    /// `ConnectionTrait::query_one` / `query_all`
    Query,
    /// `ConnectionTrait::execute_unprepared`
    Unprepared,
    /// `StreamTrait::stream`
    Stream,
}

// Optional schema qualifier, then the table identifier in any quoting style
macro_rules! table_regex {
    ($prefix:literal) => {
        Lazy::new(|| {
            Regex::new(concat!(
                $prefix,
                r#"\s+(?:[`"\[]?\w+[`"\]]?\.)?[`"\[]?(\w+)[`"\]]?"#
            ))
            .expect("valid table regex")
        })
    };
}

static SELECT_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bFROM");
static INSERT_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bINSERT\s+(?:OR\s+\w+\s+)?INTO");
static UPDATE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bUPDATE");
static DELETE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bDELETE\s+FROM");
static CREATE_TABLE_REGEX: Lazy<Regex> =
    table_regex!(r"(?i)\bCREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE(?:\s+IF\s+NOT\s+EXISTS)?");
static DROP_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bDROP\s+TABLE(?:\s+IF\s+EXISTS)?");
static ALTER_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bALTER\s+TABLE");
static TRUNCATE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"(?i)\bTRUNCATE(?:\s+TABLE)?");

/// Parse the SQL operation type from a query string.
pub fn parse_operation(sql: &str) -> SqlOperation {
    let first_word = sql.split_whitespace().next().unwrap_or("");
    let is = |keyword: &str| first_word.eq_ignore_ascii_case(keyword);

    if is("SELECT") || is("WITH") {
        SqlOperation::Select
    } else if is("INSERT") || is("REPLACE") {
        SqlOperation::Insert
    } else if is("UPDATE") {
        SqlOperation::Update
    } else if is("DELETE") {
        SqlOperation::Delete
    } else if is("CREATE") {
        SqlOperation::Create
    } else if is("DROP") {
        SqlOperation::Drop
    } else if is("ALTER") {
        SqlOperation::Alter
    } else if is("TRUNCATE") {
        SqlOperation::Truncate
    } else {
        SqlOperation::Other
    }
}

/// Extract the primary table name from a SQL query, preserving its case.
///
/// Returns `None` if the table cannot be determined.
pub fn extract_table(sql: &str) -> Option<String> {
    let regex = match parse_operation(sql) {
        SqlOperation::Select => &*SELECT_TABLE_REGEX,
        SqlOperation::Insert => &*INSERT_TABLE_REGEX,
        SqlOperation::Update => &*UPDATE_TABLE_REGEX,
        SqlOperation::Delete => &*DELETE_TABLE_REGEX,
        SqlOperation::Create => &*CREATE_TABLE_REGEX,
        SqlOperation::Drop => &*DROP_TABLE_REGEX,
        SqlOperation::Alter => &*ALTER_TABLE_REGEX,
        SqlOperation::Truncate => &*TRUNCATE_TABLE_REGEX,
        SqlOperation::Other => return None,
    };

    regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parsed SQL information used to pick a processor.
#[derive(Debug)]
pub struct ParsedSql {
    pub operation: SqlOperation,
    pub table: Option<String>,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        Self {
            operation: parse_operation(sql),
            table: extract_table(sql),
        }
    }

    /// The processor a statement runs through.
    ///
    /// Writes route by their SQL verb whichever entry point carried them,
    /// unprepared SQL is always raw and streams are row reads.
    pub fn callback_kind(&self, dispatch: Dispatch) -> CallbackKind {
        match dispatch {
            Dispatch::Unprepared => return CallbackKind::Raw,
            Dispatch::Stream => return CallbackKind::Row,
            Dispatch::Execute | Dispatch::Query => {}
        }

        match self.operation {
            SqlOperation::Insert => CallbackKind::Create,
            SqlOperation::Update => CallbackKind::Update,
            SqlOperation::Delete => CallbackKind::Delete,
            _ if dispatch == Dispatch::Query => CallbackKind::Query,
            _ => CallbackKind::Raw,
        }
    }
}

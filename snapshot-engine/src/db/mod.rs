//! Database capability used by the exporter, importer and URL replacer.
//!
//! The engine never talks to a driver directly; everything goes through the
//! [`Database`] trait so dialect details (identifier quoting, literal
//! escaping, table enumeration, atomic renames) stay with the backend.

pub mod pager;
pub mod sqlite;

pub use pager::{PageStrategy, Pager};
pub use sqlite::SqliteDatabase;

use std::fmt;
use std::path::PathBuf;

/// Error reported by the database backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub message: String,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// A single column value as reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub primary_key: bool,
}

impl ColumnInfo {
    pub fn is_integer(&self) -> bool {
        self.declared_type.to_ascii_uppercase().contains("INT")
    }

    pub fn is_numeric(&self) -> bool {
        let ty = self.declared_type.to_ascii_uppercase();
        ["INT", "REAL", "FLOA", "DOUB", "DEC", "NUMERIC"]
            .iter()
            .any(|marker| ty.contains(marker))
    }
}

/// Kind of a schema object that is not a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    View,
    Trigger,
}

impl ObjectKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            ObjectKind::View => "VIEW",
            ObjectKind::Trigger => "TRIGGER",
        }
    }
}

/// A view or trigger as stored in the schema. Dumps recreate these only
/// after every table holds its data, so triggers never fire on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub name: String,
    pub sql: String,
}

pub trait Database: Send + Sync {
    /// Run a single statement with bound parameters, returning affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<usize>;

    /// Run one or more statements as a script, as read from a dump.
    fn execute_script(&self, sql: &str) -> DbResult<()>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<RowSet>;

    /// Table names, optionally filtered by a LIKE pattern (`\` escapes).
    fn list_tables(&self, like: Option<&str>) -> DbResult<Vec<String>>;

    /// Statements that recreate the table: the CREATE TABLE first, then its
    /// indexes. Triggers are left to [`Database::schema_objects`]. Empty when
    /// the table is unknown.
    fn create_statements(&self, table: &str) -> DbResult<Vec<String>>;

    /// Views then triggers, each in creation order.
    fn schema_objects(&self) -> DbResult<Vec<SchemaObject>>;

    fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>>;

    /// Rename every pair in one atomic step.
    fn rename_tables(&self, pairs: &[(String, String)]) -> DbResult<()>;

    fn repair_table(&self, table: &str) -> DbResult<()>;

    fn optimize_table(&self, table: &str) -> DbResult<()>;

    fn set_foreign_key_checks(&self, enabled: bool) -> DbResult<()>;

    /// Whether string literals use backslash escapes.
    fn backslash_escapes(&self) -> bool;

    fn quote_literal(&self, value: &str) -> String;

    fn dump_preamble(&self) -> Vec<String>;

    fn dump_postamble(&self) -> Vec<String>;

    /// Location an external dump tool can read from, when there is one.
    fn native_dump_source(&self) -> Option<PathBuf>;

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn drop_object_statement(&self, object: &SchemaObject) -> String {
        format!(
            "DROP {} IF EXISTS {}",
            object.kind.keyword(),
            self.quote_identifier(&object.name)
        )
    }

    fn table_exists(&self, table: &str) -> DbResult<bool> {
        if table.is_empty() {
            return Ok(false);
        }
        Ok(self
            .list_tables(Some(&escape_like(table)))?
            .iter()
            .any(|t| t == table))
    }
}

/// Escape LIKE wildcards so `value` matches literally.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// LIKE pattern matching every table that starts with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}%", escape_like(prefix))
}

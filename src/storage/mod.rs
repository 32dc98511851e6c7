//! SQLite storage for requests, events, master data and subscriptions
//!
//! ## Layout
//!
//! - `capture_store` - atomic, set-oriented persistence of one capture request
//! - `event_query` - predicate accumulator, SQL compiler and two-phase event fetch
//! - `masterdata_query` - the same for vocabulary elements
//! - `subscription_store` - subscription rows, parameters and pending requests
//!
//! Schema lives in `/sql/` and is applied by [`run_schema_migrations`].
//! Every call opens its own connection through [`Database::open`] so capture
//! and poll transactions never share state.

pub mod capture_store;
pub mod event_query;
pub mod masterdata_query;
pub mod subscription_store;

use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection};
use std::fs;
use std::path::{Path, PathBuf};

pub use event_query::{
    Comparator, CompiledQuery, CustomFieldSelector, EventField, EventQuery, FilterValue,
    OrderDirection, Predicate,
};
pub use masterdata_query::MasterDataQuery;

/// Highest bound-parameter count of the bundled SQLite build
pub(crate) const MAX_BOUND_PARAMETERS: usize = 32_766;

/// Handle on the database file; cheap to clone and share between tasks
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection with the repository PRAGMAs applied
    pub fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        apply_optimized_pragmas(&conn)?;
        Ok(conn)
    }
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in filename order (00_, 01_, ...)
/// and executes them. Files must use "IF NOT EXISTS" clauses so the
/// migration can run on every startup.
pub fn run_schema_migrations(
    conn: &mut Connection,
    schema_dir: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(format!("Schema directory not found: {}", schema_dir).into());
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::debug!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Multi-row INSERT for one table
///
/// Rows accumulate in memory and are written with as few statements as the
/// bound-parameter limit allows.
pub(crate) struct BulkInsert {
    table: &'static str,
    columns: &'static [&'static str],
    rows: Vec<Vec<Value>>,
}

impl BulkInsert {
    pub(crate) fn new(table: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            rows: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        if self.rows.is_empty() {
            return Ok(0);
        }

        let rows_per_statement = (MAX_BOUND_PARAMETERS / self.columns.len()).max(1);
        let row_placeholder = format!("({})", vec!["?"; self.columns.len()].join(", "));
        let mut inserted = 0;

        for chunk in self.rows.chunks(rows_per_statement) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.table,
                self.columns.join(", "),
                vec![row_placeholder.as_str(); chunk.len()].join(", ")
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            inserted += stmt.execute(params_from_iter(chunk.iter().flatten()))?;
        }

        log::debug!("   ├─ Inserted {} rows into {}", inserted, self.table);
        Ok(inserted)
    }
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

pub(crate) fn optional_text(value: Option<&str>) -> Value {
    value.map(text).unwrap_or(Value::Null)
}

/// Decode a stored enum code, failing the row read on unknown codes
pub(crate) fn decode<T>(
    column: usize,
    code: String,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(&code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            format!("unknown stored code '{}'", code).into(),
        )
    })
}

/// `(?, ?), (?, ?), ...` for composite keys, with the keys appended to `params`
pub(crate) fn key_pairs(keys: &[(i64, i64)], params: &mut Vec<Value>) -> String {
    let mut sql = Vec::with_capacity(keys.len());
    for (first, second) in keys {
        params.push(Value::Integer(*first));
        params.push(Value::Integer(*second));
        sql.push("(?, ?)");
    }
    sql.join(", ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Fresh migrated database in a temporary directory
    pub(crate) fn create_test_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(dir.path().join("traceflow.db"));
        let mut conn = database.open().unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();
        (dir, database)
    }
}

//! Thin typed adapter over the embedded SQLite engine
//!
//! Exposes connections with declarative PRAGMA setup, prepared statements
//! with named parameters, lazy row sets and a drop-safe transaction guard.
//! Also installs the custom scalar functions `PARTSCOUNT` and `REGEXP`
//! used by the search queries.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{OpenFlags, ToSql};

use domla_common::error::{Error, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Journal modes accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    fn as_str(self) -> &'static str {
        match self {
            JournalMode::Delete => "delete",
            JournalMode::Truncate => "truncate",
            JournalMode::Persist => "persist",
            JournalMode::Memory => "memory",
            JournalMode::Wal => "wal",
            JournalMode::Off => "off",
        }
    }
}

/// Per-connection setup; options left at `None` keep the engine default
#[derive(Debug, Clone, Default)]
pub struct SqliteConfig {
    /// Database path, `":memory:"` or a `file:` URI
    pub path: String,
    pub read_only: bool,
    pub busy_timeout_ms: Option<u32>,
    pub cache_size: Option<i64>,
    pub foreign_keys: Option<bool>,
    pub max_page_count: Option<i64>,
    /// Changing the page size of an existing database triggers a VACUUM
    pub page_size: Option<i64>,
    pub journal: Option<JournalMode>,
    pub read_uncommitted: Option<bool>,
    pub cell_size_check: Option<bool>,
}

impl SqliteConfig {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Map an engine result to the archive error type, capturing the caller
/// location for diagnostics.
#[track_caller]
fn check<T>(result: rusqlite::Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) => {
            let code = match &error {
                rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
                _ => -1,
            };
            Err(Error::engine(error.to_string(), code))
        }
    }
}

/// An open database connection
pub struct Connection {
    inner: rusqlite::Connection,
}

impl Connection {
    /// Open an existing database; fails if it is missing
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        Self::open_with(config, false)
    }

    /// Open the database, creating it if absent
    pub fn open_or_create(config: &SqliteConfig) -> Result<Self> {
        Self::open_with(config, true)
    }

    /// Create a fresh database; fails if the file already exists
    pub fn create_new(config: &SqliteConfig) -> Result<Self> {
        if config.path != ":memory:" && Path::new(&config.path).exists() {
            return Err(Error::Invalid(format!(
                "database already exists: {}",
                config.path
            )));
        }
        Self::open_with(config, true)
    }

    fn open_with(config: &SqliteConfig, create: bool) -> Result<Self> {
        // The pool does its own locking, so the engine-side mutex is off.
        let mut flags = OpenFlags::SQLITE_OPEN_SHARED_CACHE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        if config.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if create {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        }

        let inner = check(rusqlite::Connection::open_with_flags(&config.path, flags))?;
        let connection = Self { inner };
        connection.install_functions()?;
        connection.apply(config)?;
        Ok(connection)
    }

    /// Apply every configured PRAGMA whose current value differs
    fn apply(&self, config: &SqliteConfig) -> Result<()> {
        if let Some(timeout) = config.busy_timeout_ms {
            if self.pragma_i64("busy_timeout")? != i64::from(timeout) {
                self.pragma_set("busy_timeout", &i64::from(timeout).to_string())?;
            }
        }
        if let Some(size) = config.cache_size {
            if self.pragma_i64("cache_size")? != size {
                self.pragma_set("cache_size", &size.to_string())?;
            }
        }
        if let Some(enabled) = config.foreign_keys {
            if (self.pragma_i64("foreign_keys")? != 0) != enabled {
                self.pragma_set("foreign_keys", if enabled { "on" } else { "off" })?;
            }
        }
        if let Some(count) = config.max_page_count {
            if self.pragma_i64("max_page_count")? != count {
                self.pragma_set("max_page_count", &count.to_string())?;
            }
        }
        if let Some(size) = config.page_size {
            if self.pragma_i64("page_size")? != size {
                self.pragma_set("page_size", &size.to_string())?;
                // The new size only takes effect once the file is rebuilt.
                check(self.inner.execute_batch("VACUUM"))?;
            }
        }
        if let Some(journal) = config.journal {
            let current = self.pragma_text("journal_mode")?;
            if !current.eq_ignore_ascii_case(journal.as_str()) {
                self.pragma_set("journal_mode", journal.as_str())?;
            }
        }
        if let Some(enabled) = config.read_uncommitted {
            if (self.pragma_i64("read_uncommitted")? != 0) != enabled {
                self.pragma_set("read_uncommitted", if enabled { "on" } else { "off" })?;
            }
        }
        if let Some(enabled) = config.cell_size_check {
            if (self.pragma_i64("cell_size_check")? != 0) != enabled {
                self.pragma_set("cell_size_check", if enabled { "on" } else { "off" })?;
            }
        }
        Ok(())
    }

    fn pragma_i64(&self, name: &str) -> Result<i64> {
        check(
            self.inner
                .query_row(&format!("PRAGMA {name}"), [], |row| row.get(0)),
        )
    }

    fn pragma_text(&self, name: &str) -> Result<String> {
        check(
            self.inner
                .query_row(&format!("PRAGMA {name}"), [], |row| row.get(0)),
        )
    }

    fn pragma_set(&self, name: &str, value: &str) -> Result<()> {
        // journal_mode and friends return a result row; run as a query.
        let mut statement = check(self.inner.prepare(&format!("PRAGMA {name} = {value}")))?;
        let mut rows = check(statement.query([]))?;
        while check(rows.next())?.is_some() {}
        Ok(())
    }

    /// Register the custom scalar functions on this connection
    fn install_functions(&self) -> Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

        check(self.inner.create_scalar_function(
            "partscount",
            2,
            flags,
            |ctx| -> rusqlite::Result<i64> {
                let value = ctx
                    .get_raw(0)
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                let separator = ctx
                    .get_raw(1)
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                if separator.is_empty() {
                    return Err(rusqlite::Error::UserFunctionError(
                        "partscount: empty separator".into(),
                    ));
                }
                let count = value
                    .split(separator)
                    .filter(|part| !part.is_empty())
                    .count();
                Ok(count as i64)
            },
        ))?;

        check(self.inner.create_scalar_function(
            "regexp",
            2,
            flags,
            move |ctx| -> rusqlite::Result<bool> {
                let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                    Ok(Regex::new(vr.as_str()?)?)
                })?;
                let text = ctx
                    .get_raw(1)
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                Ok(pattern.is_match(text))
            },
        ))?;

        Ok(())
    }

    /// Prepare a statement with named `:parameter` placeholders
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let statement = check(self.inner.prepare(sql))?;
        let columns = statement
            .column_names()
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        Ok(Statement { statement, columns })
    }

    /// Run a batch of semicolon-separated statements
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        check(self.inner.execute_batch(sql))
    }

    /// Begin a transaction; the guard rolls back unless committed
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.execute_batch("BEGIN")?;
        Ok(Transaction {
            connection: self,
            open: true,
        })
    }
}

/// A transaction scope; dropping without commit rolls back
pub struct Transaction<'conn> {
    connection: &'conn Connection,
    open: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.open = false;
        self.connection.execute_batch("COMMIT")
    }

    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.connection.execute_batch("ROLLBACK")
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.connection.execute_batch("ROLLBACK");
        }
    }
}

/// A prepared statement with named parameters
#[derive(Debug)]
pub struct Statement<'conn> {
    statement: rusqlite::Statement<'conn>,
    columns: Vec<String>,
}

impl Statement<'_> {
    /// Bind a value to the `:name` parameter; names compare
    /// case-insensitively, with or without the leading colon
    pub fn set<T: ToSql>(&mut self, name: &str, value: T) -> Result<()> {
        let wanted = name.trim_start_matches(':');
        for index in 1..=self.statement.parameter_count() {
            let found = self
                .statement
                .parameter_name(index)
                .map(|n| n.trim_start_matches(':').to_string());
            if let Some(found) = found {
                if found.eq_ignore_ascii_case(wanted) {
                    return check(self.statement.raw_bind_parameter(index, value));
                }
            }
        }
        Err(Error::Invalid(format!("no such parameter: {name}")))
    }

    /// Names of the statement's parameters, without the leading colon
    pub fn parameter_names(&self) -> Vec<String> {
        (1..=self.statement.parameter_count())
            .filter_map(|index| self.statement.parameter_name(index))
            .map(|name| name.trim_start_matches(':').to_string())
            .collect()
    }

    /// Run a statement that yields no rows of interest
    pub fn execute(&mut self) -> Result<()> {
        check(self.statement.raw_execute()).map(|_| ())
    }

    /// Run a single-value query; no row yields 0
    pub fn execute_scalar_int(&mut self) -> Result<i64> {
        let mut rows = self.statement.raw_query();
        match check(rows.next())? {
            Some(row) => check(row.get::<_, i64>(0)),
            None => Ok(0),
        }
    }

    /// Open a lazy, forward-only row sequence
    pub fn query(&mut self) -> Result<RowSet<'_>> {
        let columns = self.columns.clone();
        Ok(RowSet {
            rows: self.statement.raw_query(),
            columns,
        })
    }
}

/// Lazy, forward-only sequence of result rows
pub struct RowSet<'stmt> {
    rows: rusqlite::Rows<'stmt>,
    columns: Vec<String>,
}

impl RowSet<'_> {
    /// Advance to the next row, if any
    pub fn next(&mut self) -> Result<Option<RowView<'_>>> {
        match check(self.rows.next())? {
            Some(row) => Ok(Some(RowView {
                row,
                columns: &self.columns,
            })),
            None => Ok(None),
        }
    }
}

/// Addressing of a result column by index or (case-insensitive) name
pub trait ColumnKey {
    fn resolve(&self, columns: &[String]) -> Result<usize>;
}

impl ColumnKey for usize {
    fn resolve(&self, _columns: &[String]) -> Result<usize> {
        Ok(*self)
    }
}

impl ColumnKey for &str {
    fn resolve(&self, columns: &[String]) -> Result<usize> {
        columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(self))
            .ok_or_else(|| Error::Invalid(format!("no such column: {self}")))
    }
}

/// One result row
pub struct RowView<'a> {
    row: &'a rusqlite::Row<'a>,
    columns: &'a [String],
}

impl RowView<'_> {
    pub fn get_int(&self, key: impl ColumnKey) -> Result<i32> {
        Ok(self.get_i64(key)? as i32)
    }

    pub fn get_i64(&self, key: impl ColumnKey) -> Result<i64> {
        let index = key.resolve(self.columns)?;
        match check(self.row.get_ref(index))? {
            ValueRef::Null => Ok(0),
            ValueRef::Integer(value) => Ok(value),
            other => Err(Error::Invalid(format!(
                "column {index} is not an integer: {other:?}"
            ))),
        }
    }

    /// Text value; NULL reads as the empty string
    pub fn get_text(&self, key: impl ColumnKey) -> Result<String> {
        let index = key.resolve(self.columns)?;
        match check(self.row.get_ref(index))? {
            ValueRef::Null => Ok(String::new()),
            ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Invalid(format!("column {index} is not utf-8: {e}"))),
            other => Err(Error::Invalid(format!(
                "column {index} is not text: {other:?}"
            ))),
        }
    }

    pub fn get_blob(&self, key: impl ColumnKey) -> Result<Vec<u8>> {
        let index = key.resolve(self.columns)?;
        match check(self.row.get_ref(index))? {
            ValueRef::Null => Ok(Vec::new()),
            ValueRef::Blob(bytes) => Ok(bytes.to_vec()),
            other => Err(Error::Invalid(format!(
                "column {index} is not a blob: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        Connection::create_new(&SqliteConfig::at(":memory:")).unwrap()
    }

    #[test]
    fn tables_can_be_created_in_memory() {
        let connection = memory();
        let mut statement = connection
            .prepare("CREATE TABLE a(one INT, two INT)")
            .unwrap();
        statement.execute().unwrap();
    }

    #[test]
    fn errors_are_properly_reported() {
        let connection = memory();
        let error = connection
            .prepare("CREATE TABLE a(one INT, two INT")
            .unwrap_err();
        match error {
            Error::Engine { line, file, .. } => {
                assert!(line > 0);
                assert!(file.ends_with("sqlite.rs"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn execute_scalar_works() {
        let connection = memory();
        let mut statement = connection.prepare("SELECT 1 + 1").unwrap();
        assert_eq!(statement.execute_scalar_int().unwrap(), 2);
    }

    #[test]
    fn parameters_detected() {
        let connection = memory();
        connection
            .execute_batch("CREATE TABLE a(one INT, two INT)")
            .unwrap();
        let statement = connection
            .prepare("INSERT INTO a (one, two) VALUES (:one, :two)")
            .unwrap();
        assert_eq!(statement.parameter_names(), vec!["one", "two"]);
    }

    #[test]
    fn parameter_names_are_case_insensitive() {
        let connection = memory();
        connection
            .execute_batch("CREATE TABLE a(one INT, two INT)")
            .unwrap();
        let mut statement = connection
            .prepare("INSERT INTO a (one, two) VALUES (:one, :two)")
            .unwrap();
        statement.set("OnE", 1).unwrap();
        statement.set(":two", 2).unwrap();
        statement.execute().unwrap();

        let mut count = connection.prepare("SELECT COUNT(*) FROM a").unwrap();
        assert_eq!(count.execute_scalar_int().unwrap(), 1);
    }

    #[test]
    fn null_text_reads_as_empty_string() {
        let connection = memory();
        connection
            .execute_batch("CREATE TABLE a(one TEXT); INSERT INTO a VALUES (NULL);")
            .unwrap();
        let mut statement = connection.prepare("SELECT one FROM a").unwrap();
        let mut rows = statement.query().unwrap();
        let row = rows.next().unwrap().unwrap();
        assert_eq!(row.get_text("ONE").unwrap(), "");
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let connection = memory();
        connection.execute_batch("CREATE TABLE a(one INT)").unwrap();
        {
            let _scope = connection.begin().unwrap();
            connection
                .execute_batch("INSERT INTO a VALUES (1)")
                .unwrap();
        }
        let mut count = connection.prepare("SELECT COUNT(*) FROM a").unwrap();
        assert_eq!(count.execute_scalar_int().unwrap(), 0);

        let scope = connection.begin().unwrap();
        connection
            .execute_batch("INSERT INTO a VALUES (1)")
            .unwrap();
        scope.commit().unwrap();
        let mut count = connection.prepare("SELECT COUNT(*) FROM a").unwrap();
        assert_eq!(count.execute_scalar_int().unwrap(), 1);
    }

    #[test]
    fn partscount_counts_non_empty_parts() {
        let connection = memory();
        let cases = [
            ("/one/two", 2i64),
            ("//", 0),
            ("/one/", 1),
            ("one//two", 2),
            ("", 0),
        ];
        for (value, expected) in cases {
            let mut statement = connection
                .prepare("SELECT PARTSCOUNT(:value, '/')")
                .unwrap();
            statement.set("value", value).unwrap();
            assert_eq!(statement.execute_scalar_int().unwrap(), expected, "{value}");
        }
    }

    #[test]
    fn partscount_rejects_empty_separator() {
        let connection = memory();
        let mut statement = connection.prepare("SELECT PARTSCOUNT('abc', '')").unwrap();
        assert!(statement.execute_scalar_int().is_err());
    }

    #[test]
    fn regexp_operator_matches() {
        let connection = memory();
        let mut statement = connection
            .prepare("SELECT 'aaaaeeeiii' REGEXP '^[aeiou]*$'")
            .unwrap();
        assert_eq!(statement.execute_scalar_int().unwrap(), 1);
    }

    #[test]
    fn pragmas_follow_configuration() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("setup.db");
        let config = SqliteConfig {
            path: path.to_string_lossy().into_owned(),
            busy_timeout_ms: Some(100),
            cache_size: Some(-20000),
            foreign_keys: Some(true),
            page_size: Some(65536),
            journal: Some(JournalMode::Wal),
            cell_size_check: Some(true),
            ..SqliteConfig::default()
        };
        let connection = Connection::open_or_create(&config).unwrap();
        assert_eq!(connection.pragma_i64("busy_timeout").unwrap(), 100);
        assert_eq!(connection.pragma_i64("foreign_keys").unwrap(), 1);
        assert_eq!(connection.pragma_i64("page_size").unwrap(), 65536);
        assert_eq!(
            connection.pragma_text("journal_mode").unwrap().to_lowercase(),
            "wal"
        );
    }

    #[test]
    fn create_new_rejects_existing_files() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("twice.db");
        let config = SqliteConfig::at(path.to_string_lossy().into_owned());
        drop(Connection::create_new(&config).unwrap());
        assert!(Connection::create_new(&config).is_err());
    }
}

//! The store handle.
//!
//! One physical SQLite connection behind a single mutex. Every public method
//! takes the guard for its own duration, so methods must not be called while
//! a [`DbSession`] is held on the same thread.

use crate::error::{BackendError, Result};
use crate::value::{DbRow, DbValue, FromDbValue};
use rusqlite::{CachedStatement, Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, info, warn};

/// Options applied when opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub create_if_missing: bool,
    pub read_only: bool,
    /// Use write-ahead logging. Ignored for read-only stores.
    pub journal_wal: bool,
    pub busy_timeout: Duration,
    pub statement_cache_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            journal_wal: true,
            busy_timeout: Duration::from_secs(5),
            statement_cache_capacity: 64,
        }
    }
}

/// `PRAGMA wal_checkpoint` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    #[default]
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn pragma(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Full => "PRAGMA wal_checkpoint(FULL)",
            CheckpointMode::Restart => "PRAGMA wal_checkpoint(RESTART)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// Result row of `PRAGMA wal_checkpoint`. Frame counts are -1 when the store is not in WAL mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Default)]
struct TxState {
    depth: usize,
    rollback_requested: bool,
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    interrupt: InterruptHandle,
    tx: Mutex<TxState>,
    location: Option<PathBuf>,
}

/// Handle to the library store. Clones share the same connection.
#[derive(Clone)]
pub struct DbConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"SQLite")
            .field("location", &self.inner.location)
            .field("open", &self.is_open())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DbConnection {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref();

        if options.create_if_missing && !options.read_only {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BackendError::Open(format!("{}: {}", parent.display(), e))
                })?;
            }
        }

        let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        if options.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if options.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        }

        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| BackendError::Open(format!("{}: {}", path.display(), e)))?;
        configure(&conn, options)
            .map_err(|e| BackendError::Open(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), read_only = options.read_only, "Opened store");
        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    /// Open a private in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| BackendError::Open(e.to_string()))?;
        let options = StoreOptions {
            journal_wal: false,
            ..StoreOptions::default()
        };
        configure(&conn, &options).map_err(|e| BackendError::Open(e.to_string()))?;
        debug!("Opened in-memory store");
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, location: Option<PathBuf>) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
                interrupt,
                tx: Mutex::new(TxState::default()),
                location,
            }),
        }
    }

    /// Close the connection. Closing an already closed store is a no-op.
    pub fn close(&self) -> Result<()> {
        let tx = lock(&self.inner.tx);
        if tx.depth > 0 {
            return Err(BackendError::TransactionsOpen(tx.depth));
        }

        let mut guard = lock(&self.inner.conn);
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                info!(location = ?self.inner.location, "Closed store");
                Ok(())
            }
            Err((conn, err)) => {
                *guard = Some(conn);
                Err(BackendError::from(err))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner.conn).is_some()
    }

    /// File backing this store, `None` for in-memory stores.
    pub fn location(&self) -> Option<&Path> {
        self.inner.location.as_deref()
    }

    /// Take the guard for a multi-statement unit of work.
    pub fn lock(&self) -> Result<DbSession<'_>> {
        let guard = lock(&self.inner.conn);
        if guard.is_none() {
            return Err(BackendError::Closed);
        }
        Ok(DbSession { guard })
    }

    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = lock(&self.inner.conn);
        let conn = guard.as_ref().ok_or(BackendError::Closed)?;
        op(conn)
    }

    /// Execute one or more non-parameterized statements.
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| execute_batch_on_conn(conn, sql))
    }

    /// Execute a parameterized statement, returning the number of changed rows.
    pub fn execute_with(&self, sql: &str, params: &[DbValue]) -> Result<u64> {
        self.with_conn(|conn| execute_on_conn(conn, sql, params))
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        self.with_conn(|conn| query_on_conn(conn, sql, params))
    }

    /// Query and return the first row, if any.
    pub fn query_optional(&self, sql: &str, params: &[DbValue]) -> Result<Option<DbRow>> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::execution("Expected one row, got none"))
    }

    /// Query and return a single scalar value.
    pub fn query_scalar<T: FromDbValue>(&self, sql: &str, params: &[DbValue]) -> Result<T> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    pub fn last_inserted_id(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(conn.last_insert_rowid()))
    }

    pub fn last_modified_row_count(&self) -> Result<u64> {
        self.with_conn(|conn| Ok(conn.changes() as u64))
    }

    /// Abort the statement currently running on another thread.
    ///
    /// The interrupted statement fails with [`BackendError::Interrupted`]. If
    /// nothing is running the call has no effect.
    pub fn interrupt(&self) {
        debug!(location = ?self.inner.location, "Interrupting store");
        self.inner.interrupt.interrupt();
    }

    /// Flush write-ahead log frames into the main database file.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointStats> {
        self.with_conn(|conn| {
            let (busy, log_frames, checkpointed_frames) =
                conn.query_row(mode.pragma(), [], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;
            debug!(?mode, busy, log_frames, checkpointed_frames, "Checkpoint complete");
            Ok(CheckpointStats {
                busy: busy != 0,
                log_frames,
                checkpointed_frames,
            })
        })
    }

    /// Current transaction nesting depth.
    pub fn transaction_depth(&self) -> usize {
        lock(&self.inner.tx).depth
    }

    /// Begin a (possibly nested) transaction.
    ///
    /// Only the outermost level issues `BEGIN`/`COMMIT`/`ROLLBACK`. A rollback
    /// at any level makes the outermost level roll back.
    pub fn begin(&self) -> Result<ScopedTransaction<'_>> {
        let mut tx = lock(&self.inner.tx);
        if tx.depth == 0 {
            self.execute("BEGIN IMMEDIATE")?;
            tx.rollback_requested = false;
        }
        tx.depth += 1;
        Ok(ScopedTransaction {
            db: self,
            finished: false,
        })
    }

    /// Run `op` inside a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transaction<T, E, F>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&DbConnection) -> std::result::Result<T, E>,
        E: From<BackendError>,
    {
        let tx = self.begin()?;
        match op(self) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut tx = lock(&self.inner.tx);
        if tx.depth == 0 {
            return Err(BackendError::Transaction("No open transaction".to_string()));
        }
        if !commit {
            tx.rollback_requested = true;
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }

        if std::mem::take(&mut tx.rollback_requested) {
            self.execute("ROLLBACK")?;
            if commit {
                return Err(BackendError::Transaction(
                    "Nested transaction requested rollback".to_string(),
                ));
            }
            return Ok(());
        }

        match self.execute("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => match self.execute("ROLLBACK") {
                Ok(()) => Err(BackendError::Transaction(format!("Commit failed: {}", err))),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "Commit failed: {}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }
}

/// A transaction level opened by [`DbConnection::begin`].
///
/// Dropping it without calling `commit` rolls it back.
pub struct ScopedTransaction<'a> {
    db: &'a DbConnection,
    finished: bool,
}

impl ScopedTransaction<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.db.end_transaction(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.db.end_transaction(false)
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.db.end_transaction(false) {
                warn!(error = %err, "Failed to roll back dropped transaction");
            }
        }
    }
}

/// Exclusive access to the connection for several statements in a row.
pub struct DbSession<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
}

impl DbSession<'_> {
    fn conn(&self) -> Result<&Connection> {
        self.guard.as_ref().ok_or(BackendError::Closed)
    }

    /// Prepare (or fetch from the statement cache) a parameterized statement.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let inner = self.conn()?.prepare_cached(sql)?;
        let columns = column_names(&inner);
        Ok(Statement { inner, columns })
    }

    pub fn execute(&self, sql: &str) -> Result<()> {
        execute_batch_on_conn(self.conn()?, sql)
    }

    pub fn execute_with(&self, sql: &str, params: &[DbValue]) -> Result<u64> {
        execute_on_conn(self.conn()?, sql, params)
    }

    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        query_on_conn(self.conn()?, sql, params)
    }

    pub fn last_inserted_id(&self) -> Result<i64> {
        Ok(self.conn()?.last_insert_rowid())
    }

    pub fn last_modified_row_count(&self) -> Result<u64> {
        Ok(self.conn()?.changes() as u64)
    }
}

/// A prepared statement. Parameter indexes are zero-based.
pub struct Statement<'conn> {
    inner: CachedStatement<'conn>,
    columns: Arc<[String]>,
}

impl Statement<'_> {
    pub fn bind(&mut self, index: usize, value: impl Into<DbValue>) -> Result<()> {
        let value = value.into();
        self.inner.raw_bind_parameter(index + 1, &value)?;
        Ok(())
    }

    pub fn bind_all(&mut self, params: &[DbValue]) -> Result<()> {
        bind_params(&mut self.inner, params)
    }

    pub fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Run the statement to completion with the current bindings.
    pub fn execute(&mut self) -> Result<u64> {
        Ok(self.inner.raw_execute()? as u64)
    }

    /// Start stepping through result rows.
    pub fn query(&mut self) -> DbRows<'_> {
        DbRows {
            rows: self.inner.raw_query(),
            columns: Arc::clone(&self.columns),
        }
    }
}

/// Lazily stepped result rows.
pub struct DbRows<'stmt> {
    rows: rusqlite::Rows<'stmt>,
    columns: Arc<[String]>,
}

impl DbRows<'_> {
    /// `Ok(Some(row))` for each row, then `Ok(None)` once the statement is done.
    pub fn step(&mut self) -> Result<Option<DbRow>> {
        match self.rows.next()? {
            Some(row) => read_row(row, &self.columns).map(Some),
            None => Ok(None),
        }
    }
}

fn configure(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    conn.busy_timeout(options.busy_timeout)?;
    conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);
    if options.read_only {
        return Ok(());
    }
    if options.journal_wal {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    }
    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA temp_store=MEMORY;",
    )
}

fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[DbValue]) -> Result<()> {
    let expected = stmt.parameter_count();
    if params.len() != expected {
        return Err(BackendError::execution(format!(
            "Statement expects {} parameter(s), got {}",
            expected,
            params.len()
        )));
    }
    for (index, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(index + 1, value)?;
    }
    Ok(())
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Arc<[String]> {
    stmt.column_names().into_iter().map(String::from).collect()
}

fn read_row(row: &rusqlite::Row<'_>, columns: &Arc<[String]>) -> Result<DbRow> {
    let mut values = Vec::with_capacity(columns.len());
    for index in 0..columns.len() {
        values.push(DbValue::from_value_ref(row.get_ref(index)?));
    }
    Ok(DbRow::new(Arc::clone(columns), values))
}

fn execute_on_conn(conn: &Connection, sql: &str, params: &[DbValue]) -> Result<u64> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    bind_params(&mut stmt, params)?;
    let changed = stmt.raw_execute()?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(changed as u64)
}

fn execute_batch_on_conn(conn: &Connection, sql: &str) -> Result<()> {
    let span = debug_span!(
        "db.exec_batch",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();
    conn.execute_batch(sql)?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on_conn(conn: &Connection, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    bind_params(&mut stmt, params)?;
    let columns = column_names(&stmt);

    let mut result = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        result.push(read_row(row, &columns)?);
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(result)
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_db() -> DbConnection {
        let db = DbConnection::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        db
    }

    fn count(db: &DbConnection) -> i64 {
        db.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap()
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("library.db");
        let db = DbConnection::open(&path, &StoreOptions::default()).unwrap();
        assert!(path.exists());
        assert!(db.is_open());
        assert_eq!(db.location(), Some(path.as_path()));
    }

    #[test]
    fn test_open_read_only_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let options = StoreOptions {
            read_only: true,
            ..StoreOptions::default()
        };
        let err = DbConnection::open(temp.path().join("missing.db"), &options).unwrap_err();
        assert!(matches!(err, BackendError::Open(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let db = memory_db();
        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.execute("SELECT 1"), Err(BackendError::Closed)));
    }

    #[test]
    fn test_close_fails_with_open_transaction() {
        let db = memory_db();
        let tx = db.begin().unwrap();
        assert!(matches!(db.close(), Err(BackendError::TransactionsOpen(1))));
        tx.commit().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_execute_with_and_row_counters() {
        let db = memory_db();
        let changed = db
            .execute_with("INSERT INTO t (name) VALUES (?1)", &[DbValue::from("a")])
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.last_inserted_id().unwrap(), 1);

        db.execute_with("INSERT INTO t (name) VALUES (?1)", &[DbValue::from("b")])
            .unwrap();
        db.execute("UPDATE t SET name = 'z'").unwrap();
        assert_eq!(db.last_modified_row_count().unwrap(), 2);
    }

    #[test]
    fn test_parameter_count_mismatch_is_execution_error() {
        let db = memory_db();
        let err = db
            .execute_with("INSERT INTO t (name) VALUES (?1)", &[])
            .unwrap_err();
        assert!(matches!(err, BackendError::Execution(_)));
    }

    #[test]
    fn test_nested_transactions_commit_at_outermost() {
        let db = memory_db();
        let outer = db.begin().unwrap();
        db.execute("INSERT INTO t (name) VALUES ('outer')").unwrap();
        {
            let inner = db.begin().unwrap();
            assert_eq!(db.transaction_depth(), 2);
            db.execute("INSERT INTO t (name) VALUES ('inner')").unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(db.transaction_depth(), 1);
        outer.commit().unwrap();
        assert_eq!(db.transaction_depth(), 0);
        assert_eq!(count(&db), 2);
    }

    #[test]
    fn test_inner_rollback_rolls_back_outermost() {
        let db = memory_db();
        let outer = db.begin().unwrap();
        db.execute("INSERT INTO t (name) VALUES ('outer')").unwrap();
        let inner = db.begin().unwrap();
        inner.rollback().unwrap();
        assert!(matches!(outer.commit(), Err(BackendError::Transaction(_))));
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let db = memory_db();
        {
            let _tx = db.begin().unwrap();
            db.execute("INSERT INTO t (name) VALUES ('lost')").unwrap();
        }
        assert_eq!(db.transaction_depth(), 0);
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_transaction_closure_rolls_back_on_error() {
        let db = memory_db();
        let result: Result<()> = db.transaction(|db| {
            db.execute("INSERT INTO t (name) VALUES ('x')")?;
            Err(BackendError::execution("boom"))
        });
        assert!(result.is_err());
        assert_eq!(count(&db), 0);

        let id: Result<i64> = db.transaction(|db| {
            db.execute("INSERT INTO t (name) VALUES ('y')")?;
            db.last_inserted_id()
        });
        assert_eq!(id.unwrap(), 1);
    }

    #[test]
    fn test_session_statement_steps_rows() {
        let db = memory_db();
        let session = db.lock().unwrap();
        {
            let mut insert = session.prepare("INSERT INTO t (name) VALUES (?)").unwrap();
            for name in ["a", "b", "c"] {
                insert.bind(0, name).unwrap();
                insert.execute().unwrap();
            }
        }

        let mut select = session
            .prepare("SELECT id, name FROM t WHERE id >= ? ORDER BY id")
            .unwrap();
        select.bind(0, 2_i64).unwrap();
        assert_eq!(select.column_names(), ["id".to_string(), "name".to_string()]);

        let mut rows = select.query();
        let mut names = Vec::new();
        while let Some(row) = rows.step().unwrap() {
            names.push(row.get_by_name::<String>("name").unwrap());
        }
        assert_eq!(names, vec!["b", "c"]);
        assert!(rows.step().unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_in_wal_mode() {
        let temp = TempDir::new().unwrap();
        let db = DbConnection::open(temp.path().join("wal.db"), &StoreOptions::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        db.execute("INSERT INTO t DEFAULT VALUES").unwrap();

        let stats = db.checkpoint(CheckpointMode::Truncate).unwrap();
        assert!(!stats.busy);
        assert!(stats.log_frames >= 0);
    }

    #[test]
    fn test_fnv_hash_is_stable() {
        assert_eq!(hash_sql("SELECT 1"), hash_sql("SELECT 1"));
        assert_ne!(hash_sql("SELECT 1"), hash_sql("SELECT 2"));
        assert_eq!(sql_op_name("  DELETE FROM t"), "DELETE");
    }
}

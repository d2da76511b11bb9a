//! SQL subject: SQLite through rusqlite
//!
//! A session lives either in SQLite's in-memory `memdb` namespace or in a
//! file. Before every call into SQLite the session sets the process-wide hard
//! heap limit to the gauge's headroom, so SQLite runs out of memory exactly
//! where the gauge says the heap is full.

mod heap;

pub use heap::SqliteHeap;

use crate::subject::{BackingStore, SubjectHandle};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags, Row};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::HeapGauge;
use thiserror::Error;
use tracing::{debug, warn};

/// Result type alias for SQL operations
pub type SqlResult<T> = std::result::Result<T, SqlError>;

/// Errors raised by a SQL session
#[derive(Debug, Error)]
pub enum SqlError {
    /// Error reported by SQLite
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The session was already closed
    #[error("session is closed")]
    Closed,
}

impl SqlError {
    /// SQLite primary result code, if SQLite produced one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SqlError::Sqlite(e) => e.sqlite_error_code(),
            SqlError::Closed => None,
        }
    }
}

// =============================================================================
// Location
// =============================================================================

/// Where a SQL session keeps its database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlLocation {
    /// Named database in SQLite's in-memory `memdb` namespace
    ///
    /// Shared by every connection in the process while at least one is open.
    /// Hold a [`MemoryNamespace`] to keep it across sessions.
    Memory {
        /// Namespace name
        name: String,
    },
    /// Database file on disk
    File {
        /// Path to the main database file
        path: PathBuf,
    },
}

impl SqlLocation {
    /// In-memory location called `name`
    pub fn memory(name: impl Into<String>) -> Self {
        SqlLocation::Memory { name: name.into() }
    }

    /// File location at `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SqlLocation::File { path: path.into() }
    }

    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match self {
            SqlLocation::Memory { name } => {
                Connection::open_with_flags(format!("file:/{}?vfs=memdb", name), flags)
            }
            SqlLocation::File { path } => Connection::open_with_flags(path, flags),
        }
    }

    fn sidecars(path: &Path) -> Vec<PathBuf> {
        ["-wal", "-shm", "-journal"]
            .iter()
            .map(|suffix| {
                let mut name = path.as_os_str().to_os_string();
                name.push(suffix);
                PathBuf::from(name)
            })
            .collect()
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl BackingStore for SqlLocation {
    fn describe(&self) -> String {
        match self {
            SqlLocation::Memory { name } => format!("memdb:{}", name),
            SqlLocation::File { path } => path.display().to_string(),
        }
    }

    fn delete(&self) -> io::Result<()> {
        match self {
            // memdb content disappears with its last connection
            SqlLocation::Memory { .. } => Ok(()),
            SqlLocation::File { path } => {
                remove_file_if_present(path)?;
                for sidecar in Self::sidecars(path) {
                    remove_file_if_present(&sidecar)?;
                }
                Ok(())
            }
        }
    }

    fn delete_recursive(&self) -> io::Result<()> {
        self.delete()
    }
}

// =============================================================================
// Memory namespace
// =============================================================================

/// A `memdb` namespace pinned by a keeper connection
///
/// Sessions can close and reconnect to the same contents for as long as this
/// value lives. Deleting it closes the keeper, which discards the namespace.
pub struct MemoryNamespace {
    location: SqlLocation,
    keeper: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for MemoryNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNamespace")
            .field("location", &self.location)
            .field("held", &self.is_held())
            .finish()
    }
}

impl MemoryNamespace {
    /// Create (or join) the namespace called `name` and pin it
    pub fn create(name: impl Into<String>, heap: &Arc<HeapGauge>) -> SqlResult<Self> {
        let location = SqlLocation::memory(name);
        apply_heap_limit(heap);
        let keeper = location.open_connection()?;
        debug!(target: "strata::oom::sql", location = %location.describe(), "Pinned memory namespace");
        Ok(MemoryNamespace {
            location,
            keeper: Mutex::new(Some(keeper)),
        })
    }

    /// Location sessions open to reach this namespace
    pub fn location(&self) -> &SqlLocation {
        &self.location
    }

    /// Whether the keeper connection is still open
    pub fn is_held(&self) -> bool {
        self.keeper.lock().is_some()
    }
}

impl BackingStore for MemoryNamespace {
    fn describe(&self) -> String {
        self.location.describe()
    }

    fn delete(&self) -> io::Result<()> {
        if let Some(conn) = self.keeper.lock().take() {
            close_quietly(conn);
            debug!(target: "strata::oom::sql", location = %self.location.describe(), "Released memory namespace");
        }
        Ok(())
    }

    fn delete_recursive(&self) -> io::Result<()> {
        self.delete()
    }
}

impl Drop for MemoryNamespace {
    fn drop(&mut self) {
        if let Some(conn) = self.keeper.get_mut().take() {
            close_quietly(conn);
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Per-session SQLite settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlOptions {
    /// Page cache ceiling in KiB; with it set, dirty pages never spill to disk
    /// mid-transaction, so a statement's working set must fit in memory
    pub operation_memory_kib: Option<u32>,
    /// Use a write-ahead log (file locations only)
    pub wal: bool,
}

impl SqlOptions {
    /// Default options: unbounded cache, rollback journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the page cache and disable spilling
    pub fn operation_memory_kib(mut self, kib: u32) -> Self {
        self.operation_memory_kib = Some(kib);
        self
    }

    /// Enable write-ahead logging
    pub fn wal(mut self, enabled: bool) -> Self {
        self.wal = enabled;
        self
    }
}

// =============================================================================
// Session
// =============================================================================

/// An open SQL connection whose memory is bounded by a heap gauge
pub struct SqlSession {
    conn: Option<Connection>,
    location: SqlLocation,
    heap: Arc<HeapGauge>,
}

impl std::fmt::Debug for SqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSession")
            .field("location", &self.location)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl SqlSession {
    /// Open a connection at `location`
    pub fn open(location: SqlLocation, options: &SqlOptions, heap: &Arc<HeapGauge>) -> SqlResult<Self> {
        apply_heap_limit(heap);
        let conn = location.open_connection()?;

        if options.wal && matches!(location, SqlLocation::File { .. }) {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!(target: "strata::oom::sql", mode = %mode, "WAL journal mode not applied");
            }
        }
        if let Some(kib) = options.operation_memory_kib {
            conn.pragma_update(None, "cache_size", -i64::from(kib))?;
            conn.pragma_update(None, "cache_spill", false)?;
        }

        debug!(target: "strata::oom::sql", location = %location.describe(), "Opened SQL session");
        Ok(SqlSession {
            conn: Some(conn),
            location,
            heap: Arc::clone(heap),
        })
    }

    /// Location this session was opened at
    pub fn location(&self) -> &SqlLocation {
        &self.location
    }

    fn conn(&self) -> SqlResult<&Connection> {
        let conn = self.conn.as_ref().ok_or(SqlError::Closed)?;
        apply_heap_limit(&self.heap);
        Ok(conn)
    }

    /// Execute one statement; returns the number of changed rows
    pub fn execute(&self, sql: &str) -> SqlResult<usize> {
        Ok(self.conn()?.execute(sql, [])?)
    }

    /// Execute a batch of statements
    pub fn execute_batch(&self, sql: &str) -> SqlResult<()> {
        Ok(self.conn()?.execute_batch(sql)?)
    }

    /// Run a query and map its first row
    pub fn query_row<T, F>(&self, sql: &str, f: F) -> SqlResult<T>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn()?.query_row(sql, [], f)?)
    }

    /// Run a query returning a single integer
    pub fn query_row_i64(&self, sql: &str) -> SqlResult<i64> {
        self.query_row(sql, |row| row.get(0))
    }

    /// Checkpoint the write-ahead log into the database file and truncate it
    ///
    /// Returns the number of frames checkpointed. A no-op for memdb and
    /// rollback-journal sessions.
    pub fn checkpoint(&self) -> SqlResult<i64> {
        let (busy, _log, checkpointed): (i64, i64, i64) = self
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        if busy != 0 {
            warn!(target: "strata::oom::sql", "WAL checkpoint could not complete");
        }
        Ok(checkpointed.max(0))
    }

    /// Close gracefully
    ///
    /// On failure the connection stays with the session so it can still be
    /// force-closed. Closing twice is a no-op.
    pub fn close(&mut self) -> SqlResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        apply_heap_limit(&self.heap);
        match conn.close() {
            Ok(()) => {
                debug!(target: "strata::oom::sql", location = %self.location.describe(), "Closed SQL session");
                Ok(())
            }
            Err((conn, e)) => {
                self.conn = Some(conn);
                Err(e.into())
            }
        }
    }

    /// Drop the connection, swallowing any failure
    pub fn force_close(&mut self) {
        if let Some(conn) = self.conn.take() {
            close_quietly(conn);
        }
    }
}

fn close_quietly(conn: Connection) {
    // rusqlite panics when a drop-time close fails outside of unwinding
    let dropped = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Err((conn, e)) = conn.close() {
            warn!(target: "strata::oom::sql", error = %e, "Close failed during teardown");
            drop(conn);
        }
    }));
    if dropped.is_err() {
        warn!(target: "strata::oom::sql", "Connection teardown panicked");
    }
}

/// Bound SQLite's allocator by the gauge's remaining headroom
///
/// A headroom of zero still maps to a limit of one byte; zero would remove
/// the limit.
pub fn apply_heap_limit(heap: &HeapGauge) {
    SqliteHeap::set_hard_limit(heap.headroom().max(1));
}

impl SubjectHandle for SqlSession {
    type Error = SqlError;

    fn close(&mut self) -> SqlResult<()> {
        SqlSession::close(self)
    }

    fn force_close(&mut self) {
        SqlSession::force_close(self)
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        self.force_close();
    }
}

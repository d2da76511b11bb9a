//! SQLite's allocator, seen from the heap gauge
//!
//! SQLite allocates through its own memory subsystem. The gauge cannot charge
//! those bytes directly, so it reads them through [`SqliteHeap`] (a probe) and
//! the SQL session enforces the ceiling by setting SQLite's hard heap limit to
//! whatever headroom the gauge has left. The hard limit is process-wide: only
//! the holder of `strata_core::exclusive()` should change it.

use rusqlite::ffi;
use strata_core::{HeapProbe, Reclaimer};
use tracing::trace;

/// Probe and reclaimer for SQLite's process-wide allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteHeap;

impl SqliteHeap {
    /// Bytes currently held by SQLite
    pub fn memory_used() -> u64 {
        // SAFETY: reads a counter maintained by SQLite; no preconditions.
        let used = unsafe { ffi::sqlite3_memory_used() };
        u64::try_from(used).unwrap_or(0)
    }

    /// Set the hard heap limit; 0 removes it. Returns the previous limit.
    ///
    /// SQLite only checks the hard limit once usage passes the soft limit, and
    /// a new hard limit never raises the soft one. Clearing the hard limit
    /// first clears the soft limit too, so both end up at `bytes`.
    pub fn set_hard_limit(bytes: u64) -> u64 {
        let limit = i64::try_from(bytes).unwrap_or(i64::MAX);
        // SAFETY: non-negative arguments only update SQLite's limits.
        let previous = unsafe {
            let previous = ffi::sqlite3_hard_heap_limit64(0);
            ffi::sqlite3_hard_heap_limit64(limit);
            previous
        };
        trace!(target: "strata::oom::sql", limit = bytes, "Set SQLite hard heap limit");
        u64::try_from(previous).unwrap_or(0)
    }

    /// Remove the hard heap limit
    pub fn clear_hard_limit() {
        Self::set_hard_limit(0);
    }

    /// Current hard heap limit (0 when unlimited)
    pub fn hard_limit() -> u64 {
        // SAFETY: a negative argument queries without changing the limit.
        let current = unsafe { ffi::sqlite3_hard_heap_limit64(-1) };
        u64::try_from(current).unwrap_or(0)
    }

    /// Ask SQLite to free as much cached memory as it can
    pub fn release_memory() -> u64 {
        // SAFETY: releases unused cache pages; no preconditions.
        let freed = unsafe { ffi::sqlite3_release_memory(i32::MAX) };
        u64::try_from(freed).unwrap_or(0)
    }
}

impl HeapProbe for SqliteHeap {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn bytes_in_use(&self) -> u64 {
        Self::memory_used()
    }
}

impl Reclaimer for SqliteHeap {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn reclaim(&self) -> u64 {
        Self::release_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{exclusive, MIB};

    #[test]
    fn test_hard_limit_roundtrip() {
        let _session = exclusive();
        SqliteHeap::set_hard_limit(64 * MIB);
        assert_eq!(SqliteHeap::hard_limit(), 64 * MIB);
        SqliteHeap::clear_hard_limit();
        assert_eq!(SqliteHeap::hard_limit(), 0);
    }

    #[test]
    fn test_memory_used_tracks_open_connections() {
        let _session = exclusive();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (randomblob(100000));")
            .unwrap();
        assert!(SqliteHeap.bytes_in_use() > 0);
        drop(conn);
        let _ = SqliteHeap.reclaim();
    }
}

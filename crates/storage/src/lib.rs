//! Storage subjects for the exhaustion harness
//!
//! This crate wraps two real embedded engines behind the narrow contract the
//! harness drives them through:
//! - KvStore: redb over an in-memory filesystem, with write-behind staging
//!   and a background writer that reports failures through a callback
//! - SqlSession: SQLite (rusqlite, bundled) in the `memdb` namespace or a file,
//!   with its allocator bounded by the scenario's heap gauge
//! - SubjectHandle / BackingStore: close, force-close and delete, whatever
//!   state the engine is in

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod kv;
pub mod memfs;
pub mod sql;
pub mod subject;

pub use kv::{FaultHandler, KvError, KvMap, KvResult, KvStore, KvStoreBuilder};
pub use memfs::{MemFile, MemFs, MemFsBackend, MemFsLocation};
pub use sql::{
    apply_heap_limit, MemoryNamespace, SqlError, SqlLocation, SqlOptions, SqlResult, SqlSession,
    SqliteHeap,
};
pub use subject::{BackingStore, DirStore, SubjectHandle};

/// Re-exported so callers can match on SQLite result codes
pub use rusqlite::ErrorCode as SqliteErrorCode;

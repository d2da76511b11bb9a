//! Raw key-value subject: redb over the in-memory filesystem
//!
//! Writes are staged in memory (charged to the heap gauge) and committed to
//! redb either by the caller, when staged bytes pass `autocommit_bytes`, or by
//! a background writer thread every `autocommit_delay`. A commit failure
//! poisons the store: every later operation fails with [`KvError::Poisoned`]
//! until the store is closed and reopened. A failure on the background thread
//! is handed to the registered fault handler, at most once per store.
//!
//! # Example
//!
//! ```ignore
//! use strata_storage::{KvStore, MemFsLocation};
//!
//! let store = KvStore::builder(MemFsLocation::new("bulk"))
//!     .background_fault_handler(|e| eprintln!("writer failed: {e}"))
//!     .open(&heap)?;
//! let map = store.open_map("test")?;
//! map.put(1, b"value")?;
//! ```

use crate::memfs::{MemFsBackend, MemFsLocation};
use crate::subject::SubjectHandle;
use parking_lot::{Condvar, Mutex};
use redb::{Database, TableDefinition};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use strata_core::{Exhaustion, HeapBlock, HeapGauge, MIB};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type alias for key-value operations
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Callback invoked when the background writer fails
pub type FaultHandler = Box<dyn Fn(KvError) + Send + Sync>;

/// Default staged-bytes threshold for a foreground commit
pub const DEFAULT_AUTOCOMMIT_BYTES: usize = 32 * MIB as usize;

/// Default background commit period
pub const DEFAULT_AUTOCOMMIT_DELAY: Duration = Duration::from_millis(50);

/// Errors raised by the key-value store
#[derive(Debug, Error)]
pub enum KvError {
    /// Error from the underlying redb database
    #[error("store error: {0}")]
    Store(#[from] redb::Error),

    /// Staging a value exceeded the heap ceiling
    #[error("out of memory while staging a write: {0}")]
    OutOfMemory(#[from] Exhaustion),

    /// An earlier commit failed; the store must be closed and reopened
    #[error("store is unusable after an earlier failure: {0}")]
    Poisoned(String),

    /// The store was closed
    #[error("store is closed")]
    Closed,
}

impl KvError {
    /// Whether this error carries an exhaustion signal (staging or I/O)
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            KvError::OutOfMemory(_) => true,
            KvError::Store(redb::Error::Io(e)) => e.kind() == std::io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }

    /// Whether redb reported corrupted data
    pub fn is_corruption(&self) -> bool {
        matches!(self, KvError::Store(redb::Error::Corrupted(_)))
    }
}

fn store<E: Into<redb::Error>>(e: E) -> KvError {
    KvError::Store(e.into())
}

fn table<'a>(name: &'a str) -> TableDefinition<'a, u64, &'static [u8]> {
    TableDefinition::new(name)
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`KvStore`]
pub struct KvStoreBuilder {
    location: MemFsLocation,
    fault_handler: Option<FaultHandler>,
    autocommit_bytes: usize,
    autocommit_delay: Duration,
    cache_bytes: Option<usize>,
}

impl KvStoreBuilder {
    fn new(location: MemFsLocation) -> Self {
        KvStoreBuilder {
            location,
            fault_handler: None,
            autocommit_bytes: DEFAULT_AUTOCOMMIT_BYTES,
            autocommit_delay: DEFAULT_AUTOCOMMIT_DELAY,
            cache_bytes: None,
        }
    }

    /// Register the callback for background writer failures
    pub fn background_fault_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(KvError) + Send + Sync + 'static,
    {
        self.fault_handler = Some(Box::new(handler));
        self
    }

    /// Staged bytes at which `put` commits on the caller's thread
    pub fn autocommit_bytes(mut self, bytes: usize) -> Self {
        self.autocommit_bytes = bytes;
        self
    }

    /// Background commit period
    pub fn autocommit_delay(mut self, delay: Duration) -> Self {
        self.autocommit_delay = delay;
        self
    }

    /// redb page cache size
    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = Some(bytes);
        self
    }

    /// Open (or reopen) the store, charging its file to `heap`
    ///
    /// Reopening a store that was not closed cleanly runs redb's repair.
    pub fn open(self, heap: &Arc<HeapGauge>) -> KvResult<KvStore> {
        let file = self.location.open(heap);
        let mut builder = redb::Builder::new();
        if let Some(bytes) = self.cache_bytes {
            builder.set_cache_size(bytes);
        }
        let db = builder
            .create_with_backend(MemFsBackend::new(file))
            .map_err(store)?;

        let shared = Arc::new(Shared {
            db: Mutex::new(Some(db)),
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            state: Mutex::new(StoreState::Open),
            heap: Arc::clone(heap),
            fault_handler: self.fault_handler,
            fault_fired: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            autocommit_bytes: self.autocommit_bytes,
            autocommit_delay: self.autocommit_delay,
        });

        let writer_shared = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name("strata-kv-writer".to_string())
            .spawn(move || writer_loop(&writer_shared))
            .map_err(|e| store(redb::StorageError::Io(e)))?;

        debug!(target: "strata::oom::kv", location = %self.location.name(), "Opened key-value store");
        Ok(KvStore {
            shared,
            writer: Some(writer),
            location: self.location,
        })
    }
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Default)]
struct Pending {
    entries: BTreeMap<(String, u64), HeapBlock>,
    bytes: usize,
}

impl Pending {
    fn insert(&mut self, map: &str, key: u64, value: HeapBlock) {
        self.bytes += value.len();
        if let Some(old) = self.entries.insert((map.to_string(), key), value) {
            self.bytes -= old.len();
        }
    }
}

#[derive(Debug, Clone)]
enum StoreState {
    Open,
    Poisoned(String),
    Closed,
}

struct Shared {
    db: Mutex<Option<Database>>,
    pending: Mutex<Pending>,
    wake: Condvar,
    state: Mutex<StoreState>,
    heap: Arc<HeapGauge>,
    fault_handler: Option<FaultHandler>,
    fault_fired: AtomicBool,
    /// Entries written by successful commits since open
    committed: AtomicU64,
    shutdown: AtomicBool,
    autocommit_bytes: usize,
    autocommit_delay: Duration,
}

impl Shared {
    fn ensure_open(&self) -> KvResult<()> {
        match &*self.state.lock() {
            StoreState::Open => Ok(()),
            StoreState::Poisoned(reason) => Err(KvError::Poisoned(reason.clone())),
            StoreState::Closed => Err(KvError::Closed),
        }
    }

    fn poison(&self, cause: &KvError) {
        let mut state = self.state.lock();
        if matches!(*state, StoreState::Open) {
            *state = StoreState::Poisoned(cause.to_string());
        }
    }

    /// Run `f` against the open database; any failure poisons the store
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> KvResult<T>) -> KvResult<T> {
        self.ensure_open()?;
        let db = self.db.lock();
        let Some(db) = db.as_ref() else {
            return Err(KvError::Closed);
        };
        let result = f(db);
        if let Err(e) = &result {
            self.poison(e);
        }
        result
    }

    /// Commit every staged write in one transaction
    fn commit(&self) -> KvResult<usize> {
        self.with_db(|db| {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.entries.is_empty() {
                return Ok(0);
            }
            let txn = db.begin_write().map_err(store)?;
            for ((map, key), value) in &batch.entries {
                let mut t = txn.open_table(table(map)).map_err(store)?;
                t.insert(key, &value[..]).map_err(store)?;
            }
            txn.commit().map_err(store)?;
            self.committed
                .fetch_add(batch.entries.len() as u64, Ordering::AcqRel);
            debug!(
                target: "strata::oom::kv",
                entries = batch.entries.len(),
                bytes = batch.bytes,
                "Committed staged writes"
            );
            Ok(batch.entries.len())
        })
    }

    fn report_fault(&self, fault: KvError) {
        if self.fault_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(target: "strata::oom::kv", error = %fault, "Background writer failed");
        if let Some(handler) = &self.fault_handler {
            handler(fault);
        }
    }
}

fn writer_loop(shared: &Shared) {
    loop {
        {
            let mut pending = shared.pending.lock();
            if !shared.shutdown.load(Ordering::Acquire) {
                shared.wake.wait_for(&mut pending, shared.autocommit_delay);
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match shared.commit() {
            Ok(_) => {}
            // Already failed on the caller's side, or closed under us
            Err(KvError::Poisoned(_)) | Err(KvError::Closed) => break,
            Err(e) => {
                shared.report_fault(e);
                break;
            }
        }
    }
}

// =============================================================================
// KvStore
// =============================================================================

/// Handle to an open key-value store
pub struct KvStore {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
    location: MemFsLocation,
}

impl KvStore {
    /// Start configuring a store at `location`
    pub fn builder(location: MemFsLocation) -> KvStoreBuilder {
        KvStoreBuilder::new(location)
    }

    /// Location this store was opened from
    pub fn location(&self) -> &MemFsLocation {
        &self.location
    }

    /// Open (creating if needed) the map called `name`
    pub fn open_map(&self, name: &str) -> KvResult<KvMap<'_>> {
        self.shared.with_db(|db| {
            let txn = db.begin_write().map_err(store)?;
            txn.open_table(table(name)).map_err(store)?;
            txn.commit().map_err(store)
        })?;
        Ok(KvMap {
            store: self,
            name: name.to_string(),
        })
    }

    /// Commit staged writes now; returns the number of entries written
    pub fn commit(&self) -> KvResult<usize> {
        self.shared.commit()
    }

    /// Entries made durable by successful commits since this handle opened
    ///
    /// Commits are serialized and take every staged entry, so with keys
    /// written in increasing order the committed keys are always a prefix.
    pub fn committed_entries(&self) -> u64 {
        self.shared.committed.load(Ordering::Acquire)
    }

    /// Bytes staged and not yet committed
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending.lock().bytes
    }

    fn put(&self, map: &str, key: u64, value: &[u8]) -> KvResult<()> {
        self.shared.ensure_open()?;
        let block = self.shared.heap.allocate_copy(value)?;
        let flush = {
            let mut pending = self.shared.pending.lock();
            pending.insert(map, key, block);
            pending.bytes >= self.shared.autocommit_bytes
        };
        if flush {
            self.shared.commit()?;
        }
        Ok(())
    }

    fn get(&self, map: &str, key: u64) -> KvResult<Option<Vec<u8>>> {
        self.shared.ensure_open()?;
        {
            let pending = self.shared.pending.lock();
            if let Some(value) = pending.entries.get(&(map.to_string(), key)) {
                return Ok(Some(value.to_vec()));
            }
        }
        self.shared.with_db(|db| {
            let txn = db.begin_read().map_err(store)?;
            let t = match txn.open_table(table(map)) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(store(e)),
            };
            let value = t.get(&key).map_err(store)?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
    }

    fn stop_writer(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _pending = self.shared.pending.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }

    /// Commit staged writes and close
    ///
    /// Fails without tearing down if the store is poisoned or the final commit
    /// fails; call [`KvStore::close_immediately`] afterwards.
    pub fn close(&mut self) -> KvResult<()> {
        if matches!(*self.shared.state.lock(), StoreState::Closed) {
            return Ok(());
        }
        self.shared.commit()?;
        self.stop_writer();
        *self.shared.db.lock() = None;
        *self.shared.state.lock() = StoreState::Closed;
        debug!(target: "strata::oom::kv", location = %self.location.name(), "Closed key-value store");
        Ok(())
    }

    /// Tear down without committing. Never fails.
    pub fn close_immediately(&mut self) {
        self.stop_writer();
        drop(self.shared.db.lock().take());
        self.shared.pending.lock().entries.clear();
        self.shared.pending.lock().bytes = 0;
        *self.shared.state.lock() = StoreState::Closed;
    }
}

impl SubjectHandle for KvStore {
    type Error = KvError;

    fn close(&mut self) -> KvResult<()> {
        KvStore::close(self)
    }

    fn force_close(&mut self) {
        self.close_immediately();
    }

    fn is_open(&self) -> bool {
        !matches!(*self.shared.state.lock(), StoreState::Closed)
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.close_immediately();
    }
}

/// A named map inside a [`KvStore`]
pub struct KvMap<'s> {
    store: &'s KvStore,
    name: String,
}

impl KvMap<'_> {
    /// Map name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage `value` under `key`
    pub fn put(&self, key: u64, value: &[u8]) -> KvResult<()> {
        self.store.put(&self.name, key, value)
    }

    /// Read `key`, staged or committed
    pub fn get(&self, key: u64) -> KvResult<Option<Vec<u8>>> {
        self.store.get(&self.name, key)
    }
}

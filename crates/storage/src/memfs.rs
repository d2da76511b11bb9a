//! In-memory filesystem namespace
//!
//! Files live in a process-wide registry keyed by name, so a store can be
//! force-closed and reopened from the same bytes. Every byte of file capacity
//! is charged to the [`HeapGauge`] the file was created with: growing a file
//! past the gauge ceiling fails with `io::ErrorKind::OutOfMemory`, which is how
//! the key-value subject experiences exhaustion.

use crate::subject::BackingStore;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use redb::StorageBackend;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use strata_core::{Exhaustion, HeapGauge};
use tracing::debug;

/// Global registry of in-memory files (name -> file)
static MEMFS: Lazy<Mutex<HashMap<String, Arc<MemFile>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

struct FileData {
    bytes: Vec<u8>,
    /// Capacity charged to the gauge; always >= bytes.len()
    charged: u64,
}

/// A single in-memory file
pub struct MemFile {
    name: String,
    data: RwLock<FileData>,
    gauge: Arc<HeapGauge>,
}

impl MemFile {
    fn new(name: String, gauge: Arc<HeapGauge>) -> Self {
        MemFile {
            name,
            data: RwLock::new(FileData {
                bytes: Vec::new(),
                charged: 0,
            }),
            gauge,
        }
    }

    /// File name within the namespace
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current length in bytes
    pub fn len(&self) -> u64 {
        self.data.read().bytes.len() as u64
    }

    /// Whether the file is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resize(&self, data: &mut FileData, new_len: u64) -> io::Result<()> {
        let new_len_usize = usize::try_from(new_len).map_err(|_| {
            io::Error::from(Exhaustion::Allocator { requested: new_len })
        })?;

        if new_len > data.charged {
            let extra = new_len - data.charged;
            self.gauge.try_charge(extra)?;
            let additional = new_len_usize.saturating_sub(data.bytes.len());
            if data.bytes.try_reserve_exact(additional).is_err() {
                self.gauge.discharge(extra);
                return Err(Exhaustion::Allocator { requested: extra }.into());
            }
            data.charged = new_len;
            data.bytes.resize(new_len_usize, 0);
        } else {
            data.bytes.truncate(new_len_usize);
            data.bytes.shrink_to(new_len_usize);
            let released = data.charged - new_len;
            data.charged = new_len;
            self.gauge.discharge(released);
        }
        Ok(())
    }

    fn set_len(&self, new_len: u64) -> io::Result<()> {
        let mut data = self.data.write();
        self.resize(&mut data, new_len)
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start.checked_add(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "read range overflows")
        })?;
        if end > data.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {}..{} past end of '{}' ({} bytes)",
                    start,
                    end,
                    self.name,
                    data.bytes.len()
                ),
            ));
        }
        Ok(data.bytes[start..end].to_vec())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.write();
        let end = offset + bytes.len() as u64;
        if end > data.bytes.len() as u64 {
            self.resize(&mut data, end)?;
        }
        let start = offset as usize;
        data.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for MemFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemFile")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let charged = self.data.get_mut().charged;
        self.gauge.discharge(charged);
    }
}

/// Operations on the process-wide in-memory namespace
pub struct MemFs;

impl MemFs {
    /// Open `name`, creating it (charged to `gauge`) if it does not exist
    ///
    /// An existing file stays charged to the gauge it was created with.
    pub fn open(name: &str, gauge: &Arc<HeapGauge>) -> Arc<MemFile> {
        let mut files = MEMFS.lock();
        let file = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemFile::new(name.to_string(), Arc::clone(gauge))));
        Arc::clone(file)
    }

    /// Whether `name` exists
    pub fn exists(name: &str) -> bool {
        MEMFS.lock().contains_key(name)
    }

    /// Length of `name`, if it exists
    pub fn file_len(name: &str) -> Option<u64> {
        MEMFS.lock().get(name).map(|f| f.len())
    }

    /// Remove `name` from the namespace
    ///
    /// Open handles keep their bytes alive until they are dropped.
    pub fn delete(name: &str) -> bool {
        MEMFS.lock().remove(name).is_some()
    }

    /// Remove `prefix` and every file below `prefix/`
    pub fn delete_recursive(prefix: &str) -> usize {
        let nested = format!("{}/", prefix);
        let mut files = MEMFS.lock();
        let before = files.len();
        files.retain(|name, _| name != prefix && !name.starts_with(&nested));
        before - files.len()
    }
}

/// redb storage backend over a [`MemFile`]
#[derive(Debug)]
pub struct MemFsBackend {
    file: Arc<MemFile>,
}

impl MemFsBackend {
    /// Wrap an open file
    pub fn new(file: Arc<MemFile>) -> Self {
        MemFsBackend { file }
    }
}

impl StorageBackend for MemFsBackend {
    fn len(&self) -> Result<u64, io::Error> {
        Ok(self.file.len())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, io::Error> {
        self.file.read_at(offset, len)
    }

    fn set_len(&self, len: u64) -> Result<(), io::Error> {
        self.file.set_len(len)
    }

    fn sync_data(&self, _eventual: bool) -> Result<(), io::Error> {
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
        self.file.write_at(offset, data)
    }
}

/// Named location in the in-memory namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemFsLocation {
    name: String,
}

impl MemFsLocation {
    /// Location for `name`
    pub fn new(name: impl Into<String>) -> Self {
        MemFsLocation { name: name.into() }
    }

    /// Name within the namespace
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open (or create) the file at this location
    pub fn open(&self, gauge: &Arc<HeapGauge>) -> Arc<MemFile> {
        MemFs::open(&self.name, gauge)
    }
}

impl BackingStore for MemFsLocation {
    fn describe(&self) -> String {
        format!("memfs:{}", self.name)
    }

    fn delete(&self) -> io::Result<()> {
        if MemFs::delete(&self.name) {
            debug!(target: "strata::oom::memfs", name = %self.name, "Deleted in-memory file");
        }
        Ok(())
    }

    fn delete_recursive(&self) -> io::Result<()> {
        let removed = MemFs::delete_recursive(&self.name);
        debug!(target: "strata::oom::memfs", name = %self.name, removed, "Deleted in-memory namespace");
        Ok(())
    }
}

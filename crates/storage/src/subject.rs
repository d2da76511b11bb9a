//! The narrow contract the harness holds subjects to
//!
//! A subject handle is an exclusively owned session against a storage engine.
//! The harness only ever needs to close it gracefully (which may fail) or tear
//! it down unconditionally. Backing stores are the named locations a handle
//! reads and writes; they must be deletable no matter what state the subject
//! left them in.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An open session against a storage engine
pub trait SubjectHandle {
    /// Error raised by a graceful close
    type Error: std::error::Error + Send + Sync + 'static;

    /// Close gracefully, flushing whatever the engine flushes on close
    ///
    /// May fail with the same family of errors as any other operation. A
    /// failed close leaves the handle open so it can still be force-closed.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Unconditional, best-effort teardown. Never fails and never panics out.
    fn force_close(&mut self);

    /// Whether the handle still holds an open session
    fn is_open(&self) -> bool;
}

/// A named persistent location that can be reset between scenarios
pub trait BackingStore: fmt::Debug + Send {
    /// Human-readable location for logs
    fn describe(&self) -> String;

    /// Delete the store itself. A missing store is not an error.
    fn delete(&self) -> io::Result<()>;

    /// Delete the store and everything nested below it. A missing store is
    /// not an error.
    fn delete_recursive(&self) -> io::Result<()>;
}

/// A directory on disk used as a backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirStore {
    path: PathBuf,
}

impl DirStore {
    /// Directory at `path` (not created until [`DirStore::create`])
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DirStore { path: path.into() }
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory (and parents)
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.path)
    }

    /// Path of a file inside the directory
    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl BackingStore for DirStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn delete(&self) -> io::Result<()> {
        ignore_missing(std::fs::remove_dir(&self.path))
    }

    fn delete_recursive(&self) -> io::Result<()> {
        ignore_missing(std::fs::remove_dir_all(&self.path))?;
        debug!(target: "strata::oom::store", path = %self.path.display(), "Deleted directory store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_store_delete_recursive() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path().join("scenario"));
        store.create().unwrap();
        std::fs::write(store.join("db.sqlite"), b"data").unwrap();

        store.delete_recursive().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_dir_store_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path().join("never-created"));
        assert!(store.delete().is_ok());
        assert!(store.delete_recursive().is_ok());
    }

    #[test]
    fn test_dir_store_delete_refuses_non_empty() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path().join("full"));
        store.create().unwrap();
        std::fs::write(store.join("f"), b"x").unwrap();
        assert!(store.delete().is_err());
        assert!(store.delete_recursive().is_ok());
    }
}

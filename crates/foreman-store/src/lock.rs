//! Advisory file locking for cross-process state access.
//!
//! Every collection file has a sidecar `<name>.lock`. Writers (and readers
//! that participate in a read-modify-write) hold an exclusive OS lock on the
//! sidecar for the full span of the operation. An in-process mutex in the
//! repository layer serialises threads within one coordinator; this lock
//! serialises coordinators and external tooling.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// An exclusive advisory lock on a sidecar file.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}

/// Factory for exclusive locks on one sidecar path.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the exclusive lock is held.
    pub fn acquire(&self) -> io::Result<FileLockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        Ok(FileLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another process holds it.
    pub fn try_acquire(&self) -> io::Result<Option<FileLockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard {
                file,
                path: self.path.clone(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

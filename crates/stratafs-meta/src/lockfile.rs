//! Inter-process file locking
//!
//! Advisory locks on named lockfiles coordinate multiple host processes
//! mutating the same node or index file. Locks are acquired blocking and
//! released when the handle is dropped. The lockfile itself is left in
//! place on release; it is a stable coordination point, not data.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use stratafs_common::{Error, Result, META_FILE_MODE};

/// Suffix of the per-node substrate lockfile.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// An open file holding an advisory `flock`.
///
/// The lock is released when the value is dropped. Locks are not reentrant
/// within a process; callers must not re-acquire a lock they already hold.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Block until an exclusive lock on `path` is held.
    ///
    /// The lockfile is created with mode 0600 if it does not exist.
    pub fn open_exclusive(path: impl AsRef<Path>) -> Result<Self> {
        let file = open_lockfile(path.as_ref())?;
        file.lock_exclusive().map_err(|source| Error::Lock {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Block until a shared lock on `path` is held.
    pub fn open_shared(path: impl AsRef<Path>) -> Result<Self> {
        let file = open_lockfile(path.as_ref())?;
        file.lock_shared().map_err(|source| Error::Lock {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Path of the lockfile this handle holds.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the lockfile.
    ///
    /// Only the scoped per-node lock API uses this; the substrate lockfiles
    /// stay in place across lock cycles.
    pub fn unlock_and_remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // flock is released on close anyway; unlock early so the handle
        // does not pin the lock for the rest of its scope.
        let _ = self.file.unlock();
    }
}

fn open_lockfile(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .mode(META_FILE_MODE)
        .open(path)
        .map_err(|source| Error::Lock {
            path: path.to_path_buf(),
            source,
        })
}

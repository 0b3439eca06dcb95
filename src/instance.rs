//! Single-instance guard across processes, backed by an advisory file lock.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Held for the lifetime of the process section it guards. Dropping it
/// releases the lock on every exit path, unwinding included.
#[derive(Debug)]
pub struct InstanceLock {
    name: String,
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Lock `name` in the system temp directory.
    pub fn acquire(name: &str) -> Result<Self> {
        Self::acquire_in(&std::env::temp_dir(), name)
    }

    pub fn acquire_in(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!(".{}.lock", name));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(Error::AlreadyRunning(name.to_string())),
            Err(TryLockError::Error(e)) => return Err(Error::Io(e)),
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = %path.display(), "instance lock acquired");

        Ok(Self {
            name: name.to_string(),
            path,
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // the file stays; removing it would race with a process about to lock it
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        debug!(lock = %self.path.display(), "instance lock released");
    }
}

//! Exclusive lock files.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A lock held by creating `path` exclusively. Dropping it removes the file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Take the lock, failing with `AlreadyExists` if someone holds it.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Take the lock, polling every `interval` while it is held elsewhere.
    pub fn wait(path: impl AsRef<Path>, interval: Duration) -> io::Result<Self> {
        let path = path.as_ref();
        loop {
            match Self::acquire(path) {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::info!(path = %path.display(), "waiting for lock");
                    std::thread::sleep(interval);
                }
                other => return other,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

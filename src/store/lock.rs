//! Exclusive data-directory lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::Error;

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = "chatrelay.lock";

/// Acquire an exclusive advisory lock on `dir`.
///
/// Fails with [`Error::Locked`] right away if another process holds it.
pub fn acquire_lock(dir: &Path) -> Result<LockHandle, Error> {
    std::fs::create_dir_all(dir)?;
    let lock_path = dir.join(LOCK_FILE);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Err(Error::Locked(dir.to_path_buf()));
        }
        return Err(Error::Io(e));
    }

    file.set_len(0)?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    file.sync_all()?;

    tracing::debug!("Acquired lock: {}", lock_path.display());

    Ok(LockHandle { file, lock_path })
}

/// Lock handle - releases lock when dropped.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    lock_path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        } else {
            tracing::debug!("Released lock: {}", self.lock_path.display());
        }
    }
}

//! Advisory cache lock.
//!
//! One engine instance owns the cache at a time. The lock file is never
//! unlinked: removing a still-locked file would let a second process create
//! a fresh file at the same path and acquire a separate exclusive lock,
//! defeating mutual exclusion.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{bail, Context, Result};
use fs2::FileExt;

/// Held for the lifetime of the run; dropping releases the flock.
pub struct CacheLock {
    _file: Option<File>,
}

impl CacheLock {
    /// Acquire the exclusive cache lock, failing immediately if another
    /// engine holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to create lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "cache {} is locked by another chariot instance (use --no-lockfile to override)",
                path.display()
            );
        }
        Ok(Self { _file: Some(file) })
    }

    /// The `--no-lockfile` escape hatch: no lock is taken at all.
    pub fn disabled() -> Self {
        Self { _file: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_reacquire_in_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chariot.lock");
        let lock = CacheLock::acquire(&path).unwrap();
        drop(lock);
        // Released on drop; a fresh acquisition must succeed.
        let _again = CacheLock::acquire(&path).unwrap();
    }

    #[test]
    fn disabled_lock_is_inert() {
        let _lock = CacheLock::disabled();
    }
}

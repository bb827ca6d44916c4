// src/lock.rs

//! Exclusive installer instance lock
//!
//! The installer facade holds this lock for its entire lifetime, so only one
//! process manipulates a manifest directory at a time. The lock lives at
//! `<manifest_dir>/.installer.lock`.
//!
//! This is independent of the commit lock in the installer context, which
//! serializes the commit phase of tasks inside one process.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the manifest directory
pub const LOCK_FILE_NAME: &str = ".installer.lock";

/// Process-wide exclusive lock on a manifest directory
pub struct InstallerLock {
    /// Kept open to hold the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl InstallerLock {
    /// Lock path for a manifest directory
    pub fn path_for(manifest_dir: &Path) -> PathBuf {
        manifest_dir.join(LOCK_FILE_NAME)
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns `Ok(None)` if another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::info!("Acquired installer lock at {:?}", path);
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("Installer lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(Error::IoError(format!(
                "Failed to try-acquire installer lock: {}",
                e
            ))),
        }
    }

    /// Acquire the lock or fail if another installer is running
    pub fn acquire_for(manifest_dir: &Path) -> Result<Self> {
        let path = Self::path_for(manifest_dir);
        Self::try_acquire(&path)?.ok_or_else(|| {
            Error::SystemError(format!(
                "another installer instance holds {}",
                path.display()
            ))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallerLock {
    fn drop(&mut self) {
        log::info!("Released installer lock at {:?}", self.path);
    }
}

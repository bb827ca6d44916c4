// src/scope.rs

//! Undo-on-drop guards for the installation transaction
//!
//! Every filesystem change made before the commit point is owned by one of
//! these guards. Dropping a guard reverts its change; calling `take()` makes
//! the change permanent. Errors while reverting are logged and otherwise
//! ignored, since they happen during unwinding of a failed task.

use crate::error::{Error, Result};
use crate::filesystem;
use crate::sudo::SudoClient;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn append_to_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Creates a directory and removes it again unless taken
#[derive(Default)]
pub struct ScopedDirectoryCreator {
    path: Option<PathBuf>,
    sudo: Option<Arc<SudoClient>>,
}

impl ScopedDirectoryCreator {
    /// Remove through the helper, for trees that end up owned by another uid
    pub fn with_sudo(sudo: Option<Arc<SudoClient>>) -> Self {
        Self { path: None, sudo }
    }

    /// Create `path`; with `remove_existing` a stale entry is deleted first
    pub fn create(&mut self, path: &Path, remove_existing: bool) -> Result<()> {
        if remove_existing && fs::symlink_metadata(path).is_ok() {
            filesystem::remove_recursive(path, self.sudo.as_deref())?;
        }
        fs::create_dir(path).map_err(|e| {
            Error::IoError(format!("could not create directory {}: {}", path.display(), e))
        })?;
        log::debug!("Created directory {}", path.display());
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the directory
    pub fn take(&mut self) -> Option<PathBuf> {
        self.path.take()
    }

    /// Remove the directory now
    pub fn destroy(&mut self) -> Result<()> {
        match self.path.take() {
            Some(path) => filesystem::remove_recursive(&path, self.sudo.as_deref()),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedDirectoryCreator {
    fn drop(&mut self) {
        if let Some(path) = self.path.clone()
            && let Err(e) = self.destroy()
        {
            log::warn!("Failed to remove directory {}: {}", path.display(), e);
        }
    }
}

/// Creates a file and removes it again unless taken
#[derive(Default)]
pub struct ScopedFileCreator {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl ScopedFileCreator {
    /// Create `path` exclusively and return the open file
    pub fn create(&mut self, path: &Path) -> Result<&mut File> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::IoError(format!("could not create file {}: {}", path.display(), e)))?;
        self.path = Some(path.to_path_buf());
        Ok(self.file.insert(file))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file, closing it
    pub fn take(&mut self) -> Option<PathBuf> {
        self.file = None;
        self.path.take()
    }
}

impl Drop for ScopedFileCreator {
    fn drop(&mut self) {
        self.file = None;
        if let Some(path) = self.path.take()
            && let Err(e) = fs::remove_file(&path)
        {
            log::warn!("Failed to remove file {}: {}", path.display(), e);
        }
    }
}

/// Attaches an image to a loop device and detaches it unless taken
#[derive(Default)]
pub struct ScopedLoopbackCreator {
    device: Option<String>,
    sudo: Option<Arc<SudoClient>>,
}

impl ScopedLoopbackCreator {
    pub fn create(&mut self, sudo: Arc<SudoClient>, image: &Path, read_only: bool) -> Result<&str> {
        let device = sudo.attach_loopback(image, read_only)?;
        log::debug!("Attached {} to {}", image.display(), device);
        self.sudo = Some(sudo);
        Ok(self.device.insert(device))
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn take(&mut self) -> Option<String> {
        self.device.take()
    }

    /// Detach now
    pub fn destroy(&mut self) -> Result<()> {
        match (self.device.take(), &self.sudo) {
            (Some(device), Some(sudo)) => sudo.detach_loopback(&device),
            _ => Ok(()),
        }
    }
}

impl Drop for ScopedLoopbackCreator {
    fn drop(&mut self) {
        if let Some(device) = self.device.clone()
            && let Err(e) = self.destroy()
        {
            log::warn!("Failed to detach loop device {}: {}", device, e);
        }
    }
}

/// Mounts a device and unmounts it again unless taken
#[derive(Default)]
pub struct ScopedMounter {
    mount_point: Option<PathBuf>,
    sudo: Option<Arc<SudoClient>>,
}

impl ScopedMounter {
    pub fn mount(
        &mut self,
        sudo: Arc<SudoClient>,
        device: &str,
        mount_point: &Path,
        read_only: bool,
        fstype: &str,
    ) -> Result<()> {
        sudo.mount(device, mount_point, read_only, fstype)?;
        log::debug!("Mounted {} on {}", device, mount_point.display());
        self.sudo = Some(sudo);
        self.mount_point = Some(mount_point.to_path_buf());
        Ok(())
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn take(&mut self) -> Option<PathBuf> {
        self.mount_point.take()
    }

    /// Unmount now
    pub fn destroy(&mut self) -> Result<()> {
        match (self.mount_point.take(), &self.sudo) {
            (Some(mount_point), Some(sudo)) => sudo.unmount(&mount_point, false),
            _ => Ok(()),
        }
    }
}

impl Drop for ScopedMounter {
    fn drop(&mut self) {
        if let Some(mount_point) = self.mount_point.clone()
            && let Err(e) = self.destroy()
        {
            log::warn!("Failed to unmount {}: {}", mount_point.display(), e);
        }
    }
}

/// Which renames a [`ScopedRenamer`] performs on a base name `A`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameMode(u8);

impl RenameMode {
    /// `A` becomes `A-`
    pub const NAME_TO_NAME_MINUS: RenameMode = RenameMode(0b01);
    /// `A+` becomes `A`
    pub const NAME_PLUS_TO_NAME: RenameMode = RenameMode(0b10);
    /// Both, in that order: the update case
    pub const REPLACE: RenameMode = RenameMode(0b11);

    pub fn contains(self, other: RenameMode) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Renames a base name as part of a two-step replace, undone on drop
///
/// POSIX cannot rename a directory onto a non-empty one, so a replace is
/// `A -> A-` followed by `A+ -> A`. If the second step fails the first one
/// is reverted immediately.
#[derive(Default)]
pub struct ScopedRenamer {
    base: Option<PathBuf>,
    minus_done: bool,
    plus_done: bool,
}

impl ScopedRenamer {
    pub fn rename(&mut self, base: &Path, mode: RenameMode) -> Result<()> {
        let minus = append_to_name(base, "-");
        let plus = append_to_name(base, "+");
        self.base = Some(base.to_path_buf());

        if mode.contains(RenameMode::NAME_TO_NAME_MINUS) {
            fs::rename(base, &minus).map_err(|e| {
                Error::IoError(format!(
                    "could not rename {} to {}: {}",
                    base.display(),
                    minus.display(),
                    e
                ))
            })?;
            self.minus_done = true;
        }

        if mode.contains(RenameMode::NAME_PLUS_TO_NAME) {
            if let Err(e) = fs::rename(&plus, base) {
                let err = Error::IoError(format!(
                    "could not rename {} to {}: {}",
                    plus.display(),
                    base.display(),
                    e
                ));
                self.undo();
                return Err(err);
            }
            self.plus_done = true;
        }
        log::debug!("Renamed {} ({:?})", base.display(), mode);
        Ok(())
    }

    /// Whether any rename is currently in effect
    pub fn is_renamed(&self) -> bool {
        self.minus_done || self.plus_done
    }

    /// The `A-` path of the base name
    pub fn minus_path(&self) -> Option<PathBuf> {
        self.base.as_deref().map(|base| append_to_name(base, "-"))
    }

    /// Keep the renames
    pub fn take(&mut self) -> bool {
        let renamed = self.is_renamed();
        self.minus_done = false;
        self.plus_done = false;
        renamed
    }

    fn undo(&mut self) {
        let Some(base) = self.base.clone() else {
            return;
        };
        if self.plus_done {
            let plus = append_to_name(&base, "+");
            match fs::rename(&base, &plus) {
                Ok(()) => self.plus_done = false,
                Err(e) => log::error!(
                    "Failed to rename {} back to {}: {}",
                    base.display(),
                    plus.display(),
                    e
                ),
            }
        }
        if self.minus_done {
            let minus = append_to_name(&base, "-");
            match fs::rename(&minus, &base) {
                Ok(()) => self.minus_done = false,
                Err(e) => log::error!(
                    "Failed to rename {} back to {}: {}",
                    minus.display(),
                    base.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for ScopedRenamer {
    fn drop(&mut self) {
        self.undo();
    }
}

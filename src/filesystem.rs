// src/filesystem.rs

//! Filesystem helpers shared by the tasks, the helper process and the guards

use crate::error::{Error, Result};
use crate::sudo::SudoClient;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

/// Read the mount table of this process
pub fn mounted_directories() -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string("/proc/self/mounts")
        .map_err(|e| Error::IoError(format!("Failed to read mount table: {}", e)))?;
    Ok(parse_mount_table(&content))
}

/// Parse `/proc/mounts` formatted text
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Undo the octal escaping (`\040` for space, ...) of the mount table
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether something is mounted exactly at `path`
pub fn is_mounted(path: &Path) -> bool {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    match mounted_directories() {
        Ok(mounts) => mounts.iter().any(|m| m.mount_point == path),
        Err(e) => {
            warn!("Could not check mount state of {}: {}", path.display(), e);
            false
        }
    }
}

/// Size and free space of the filesystem holding a path, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub available: u64,
}

/// Query the filesystem holding `path`
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| {
        Error::IoError(format!("statvfs on {} failed: {}", path.display(), e))
    })?;
    let fragment = stat.fragment_size() as u64;
    Ok(DiskUsage {
        total: fragment * stat.blocks() as u64,
        available: fragment * stat.blocks_available() as u64,
    })
}

/// Flush filesystem buffers
pub fn sync() {
    nix::unistd::sync();
}

/// Remove a file or directory tree, including read-only entries
///
/// A missing path is not an error.
pub fn force_remove_all(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !meta.is_dir() {
        return fs::remove_file(path);
    }

    // Directories without write or search permission cannot be emptied
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }

    fs::remove_dir_all(path)
}

/// Remove a directory tree, through the helper when it is owned by another uid
pub fn remove_recursive(path: &Path, sudo: Option<&SudoClient>) -> Result<()> {
    debug!("Removing {}", path.display());
    match sudo {
        Some(sudo) => sudo.remove_recursive(path),
        None => force_remove_all(path)
            .map_err(|e| Error::IoError(format!("Failed to remove {}: {}", path.display(), e))),
    }
}

/// Total size of all regular files below `path`
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

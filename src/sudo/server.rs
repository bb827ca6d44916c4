// src/sudo/server.rs

//! The privileged side of the sudo channel
//!
//! `SudoServer` implements the seven privileged operations. It runs either in
//! the forked helper process (see [`SudoServer::serve`]) or, in unprivileged
//! fallback mode, directly inside the controller.

use super::protocol::{self, ProtocolError, SudoReply, SudoRequest, RECV_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::filesystem;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_CTL_REMOVE: libc::c_ulong = 0x4C81;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// `sizeof(struct loop_info64)`
const LOOP_INFO64_SIZE: usize = 232;

const LOOP_CLAIM_ATTEMPTS: usize = 100;
const LOOP_DETACH_ATTEMPTS: usize = 100;
const LOOP_DETACH_PAUSE: Duration = Duration::from_micros(50);

/// Executes privileged requests
pub struct SudoServer {
    loop_control: Option<File>,
}

impl SudoServer {
    /// Create a server. `/dev/loop-control` is opened now, while the process
    /// may still have the rights to do so.
    pub fn new() -> Self {
        let loop_control = match OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
        {
            Ok(file) => Some(file),
            Err(e) => {
                debug!("Cannot open /dev/loop-control: {}", e);
                None
            }
        };
        Self { loop_control }
    }

    /// Execute a single request
    pub fn execute(&mut self, request: SudoRequest) -> Result<SudoReply> {
        debug!("SudoServer executing {:?}", request);
        match request {
            SudoRequest::AttachLoopback { image, read_only } => self
                .attach_loopback(&image, read_only)
                .map(SudoReply::Device),
            SudoRequest::DetachLoopback { device } => {
                self.detach_loopback(&device).map(|_| SudoReply::Done)
            }
            SudoRequest::Mount {
                device,
                mount_point,
                read_only,
                fstype,
            } => mount(&device, &mount_point, read_only, &fstype).map(|_| SudoReply::Done),
            SudoRequest::Unmount { mount_point, force } => {
                unmount(&mount_point, force).map(|_| SudoReply::Done)
            }
            SudoRequest::Mkfs {
                device,
                fstype,
                options,
            } => mkfs(&device, &fstype, &options).map(|_| SudoReply::Done),
            SudoRequest::RemoveRecursive { path } => {
                remove_recursive(&path).map(|_| SudoReply::Done)
            }
            SudoRequest::SetOwnerAndPermissionsRecursive {
                path,
                uid,
                gid,
                mode,
            } => set_owner_and_permissions_recursive(&path, uid, gid, mode)
                .map(|_| SudoReply::Done),
            SudoRequest::StopServer => Ok(SudoReply::Done),
        }
    }

    /// Serve requests from `socket` until a stop request arrives or the peer
    /// goes away
    pub fn serve(mut self, socket: UnixDatagram) -> Result<()> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let size = match socket.recv(&mut buffer) {
                Ok(size) => size,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::SystemError(format!(
                        "SudoServer could not receive: {}",
                        e
                    )));
                }
            };

            let (reply, message, stop) = match protocol::decode_request(&buffer[..size]) {
                Ok(SudoRequest::StopServer) => (SudoReply::Done, String::new(), true),
                Ok(request) => match self.execute(request) {
                    Ok(reply) => (reply, String::new(), false),
                    Err(e) => (SudoReply::Empty, e.message().to_string(), false),
                },
                Err(e @ ProtocolError::UnknownFunction(_)) => {
                    (SudoReply::Empty, e.to_string(), false)
                }
                Err(e) => (
                    SudoReply::Empty,
                    format!("failed to receive command from the SudoClient process: {}", e),
                    false,
                ),
            };

            if !message.is_empty() {
                warn!("SudoServer: {}", message);
            }

            let frame = protocol::encode_reply(&reply, &message)
                .map_err(|e| Error::SystemError(format!("SudoServer could not reply: {}", e)))?;
            if let Err(e) = socket.send(&frame) {
                error!("SudoServer could not send reply: {}", e);
            }

            if stop {
                info!("SudoServer stopping");
                return Ok(());
            }
        }
    }

    /// Bind `image` to a free loop device and return the device path
    pub fn attach_loopback(&mut self, image: &Path, read_only: bool) -> Result<String> {
        let control = self.loop_control.as_ref().ok_or_else(|| {
            Error::IoError("could not open /dev/loop-control".to_string())
        })?;

        let image_file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(image)
            .map_err(|e| {
                Error::IoError(format!("could not open image {}: {}", image.display(), e))
            })?;

        for _ in 0..LOOP_CLAIM_ATTEMPTS {
            // SAFETY: plain ioctl on an owned fd
            let number = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
            if number < 0 {
                return Err(Error::IoError(format!(
                    "could not get a free loop device: {}",
                    io::Error::last_os_error()
                )));
            }

            let device = format!("/dev/loop{}", number);
            let loop_file = match OpenOptions::new()
                .read(true)
                .write(!read_only)
                .open(&device)
            {
                Ok(file) => file,
                Err(e) if e.raw_os_error() == Some(libc::EACCES) => continue,
                Err(e) => {
                    return Err(Error::IoError(format!("could not open {}: {}", device, e)));
                }
            };

            let mut info = [0u8; LOOP_INFO64_SIZE];
            // SAFETY: info is large enough for struct loop_info64
            let rc = unsafe {
                libc::ioctl(
                    loop_file.as_raw_fd(),
                    LOOP_GET_STATUS64 as _,
                    info.as_mut_ptr(),
                )
            };
            if rc == 0 {
                // Someone else grabbed it in the meantime
                continue;
            }
            let status_error = io::Error::last_os_error();
            if status_error.raw_os_error() != Some(libc::ENXIO) {
                return Err(Error::IoError(format!(
                    "could not query {}: {}",
                    device, status_error
                )));
            }

            // SAFETY: both fds are open for the duration of the call
            let rc = unsafe {
                libc::ioctl(
                    loop_file.as_raw_fd(),
                    LOOP_SET_FD as _,
                    image_file.as_raw_fd(),
                )
            };
            if rc == 0 {
                debug!("Attached {} to {}", image.display(), device);
                return Ok(device);
            }
            let set_error = io::Error::last_os_error();
            if set_error.raw_os_error() != Some(libc::EBUSY) {
                return Err(Error::IoError(format!(
                    "could not attach {} to {}: {}",
                    image.display(),
                    device,
                    set_error
                )));
            }
        }

        Err(Error::IoError(format!(
            "could not find a free loop device for {} after {} attempts",
            image.display(),
            LOOP_CLAIM_ATTEMPTS
        )))
    }

    /// Unbind and remove a loop device
    pub fn detach_loopback(&mut self, device: &str) -> Result<()> {
        let number: libc::c_long = device
            .strip_prefix("/dev/loop")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::IoError(format!("{} is not a loop device", device)))?;

        let loop_file = File::open(device)
            .map_err(|e| Error::IoError(format!("could not open {}: {}", device, e)))?;

        let mut cleared = false;
        let mut last_error = None;
        for _ in 0..LOOP_DETACH_ATTEMPTS {
            // SAFETY: plain ioctl on an owned fd
            let rc = unsafe { libc::ioctl(loop_file.as_raw_fd(), LOOP_CLR_FD as _, 0) };
            if rc == 0 {
                cleared = true;
                break;
            }
            last_error = Some(io::Error::last_os_error());
            thread::sleep(LOOP_DETACH_PAUSE);
        }
        drop(loop_file);

        if !cleared {
            return Err(Error::IoError(format!(
                "could not detach {}: {}",
                device,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            )));
        }

        if let Some(control) = &self.loop_control {
            // SAFETY: plain ioctl on an owned fd
            let rc = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_REMOVE as _, number) };
            if rc < 0 {
                debug!(
                    "Could not remove {}: {}",
                    device,
                    io::Error::last_os_error()
                );
            }
        }

        Ok(())
    }
}

impl Default for SudoServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount `device` on `mount_point`
pub fn mount(device: &str, mount_point: &Path, read_only: bool, fstype: &str) -> Result<()> {
    use nix::mount::MsFlags;

    if !Path::new(device).exists() {
        return Err(Error::IoError(format!("device {} does not exist", device)));
    }
    if !mount_point.is_dir() {
        return Err(Error::IoError(format!(
            "mount point {} does not exist",
            mount_point.display()
        )));
    }

    let mut flags = MsFlags::empty();
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    let fstype = (!fstype.is_empty()).then_some(fstype);

    nix::mount::mount::<str, Path, str, str>(Some(device), mount_point, fstype, flags, None)
        .map_err(|e| {
            Error::IoError(format!(
                "could not mount {} at {}: {}",
                device,
                mount_point.display(),
                e
            ))
        })
}

/// Unmount `mount_point`. A forced unmount also detaches lazily and treats a
/// missing mount point as success.
pub fn unmount(mount_point: &Path, force: bool) -> Result<()> {
    use nix::mount::MntFlags;

    if !mount_point.exists() {
        if force {
            return Ok(());
        }
        return Err(Error::IoError(format!(
            "mount point {} does not exist",
            mount_point.display()
        )));
    }

    let flags = if force {
        MntFlags::MNT_FORCE | MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };

    nix::mount::umount2(mount_point, flags).map_err(|e| {
        Error::IoError(format!("could not unmount {}: {}", mount_point.display(), e))
    })
}

/// Options used for ext2/3/4 when the caller passes none
pub fn default_ext_options(uid: u32, gid: u32) -> Vec<String> {
    [
        "-F",
        "-i",
        "4096",
        "-I",
        "128",
        "-b",
        "1024",
        "-m",
        "0",
        "-E",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([
        format!("root_owner={}:{}", uid, gid),
        "-O".to_string(),
        "sparse_super,^resize_inode".to_string(),
    ])
    .collect()
}

fn is_ext_family(fstype: &str) -> bool {
    matches!(fstype, "ext2" | "ext3" | "ext4")
}

/// Create a filesystem on `device`
pub fn mkfs(device: &str, fstype: &str, options: &[String]) -> Result<()> {
    if fstype.is_empty() || fstype.contains('/') {
        return Err(Error::IoError(format!("invalid filesystem type '{}'", fstype)));
    }

    let ext = is_ext_family(fstype);
    let options = if options.is_empty() && ext {
        default_ext_options(nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
    } else {
        options.to_vec()
    };

    run_tool(&format!("/sbin/mkfs.{}", fstype), &options, device)?;
    if ext {
        let tune = ["-c", "0", "-i", "0"].map(String::from);
        run_tool("/sbin/tune2fs", &tune, device)?;
    }
    Ok(())
}

fn run_tool(program: &str, args: &[String], device: &str) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .arg(device)
        .output()
        .map_err(|e| Error::IoError(format!("could not run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::IoError(format!(
            "{} failed with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Remove a directory tree
pub fn remove_recursive(path: &Path) -> Result<()> {
    if !path.is_absolute() || path.parent().is_none() {
        return Err(Error::IoError(format!(
            "refusing to remove {}",
            path.display()
        )));
    }
    filesystem::force_remove_all(path)
        .map_err(|e| Error::IoError(format!("could not remove {}: {}", path.display(), e)))
}

/// Mode applied to a directory: the x bit is added wherever r or w is set
pub fn directory_mode(mode: u32) -> u32 {
    let mut dir_mode = mode;
    if mode & 0o6 != 0 {
        dir_mode |= 0o1;
    }
    if mode & 0o60 != 0 {
        dir_mode |= 0o10;
    }
    if mode & 0o600 != 0 {
        dir_mode |= 0o100;
    }
    dir_mode
}

/// Change owner and mode of a whole tree, depth first
pub fn set_owner_and_permissions_recursive(path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()> {
    let uid = nix::unistd::Uid::from_raw(uid);
    let gid = nix::unistd::Gid::from_raw(gid);

    for entry in WalkDir::new(path).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| {
            Error::IoError(format!("could not walk {}: {}", path.display(), e))
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let entry_mode = if file_type.is_dir() {
            directory_mode(mode)
        } else {
            mode
        };

        fs::set_permissions(entry.path(), fs::Permissions::from_mode(entry_mode)).map_err(|e| {
            Error::IoError(format!(
                "could not chmod {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        nix::unistd::chown(entry.path(), Some(uid), Some(gid)).map_err(|e| {
            Error::IoError(format!(
                "could not chown {}: {}",
                entry.path().display(),
                e
            ))
        })?;
    }
    Ok(())
}

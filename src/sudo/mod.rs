// src/sudo/mod.rs

//! Privilege separation
//!
//! The installer must run as root to attach loop devices, mount images and
//! hand files to application uids, yet it parses untrusted packages. At
//! startup, [`fork_server`] forks a small helper that keeps a minimal set of
//! capabilities and serves exactly seven operations over a datagram socket
//! pair. The controller then drops root and talks to the helper through a
//! [`SudoClient`].
//!
//! Without root, an in-process fallback with the same interface is used if
//! the configuration allows it. That mode exists for development setups and
//! tests; operations needing privileges simply fail there.

mod capability;
mod client;
mod protocol;
mod server;

pub use capability::Capability;
pub use client::SudoClient;
pub use protocol::{ProtocolError, SudoReply, SudoRequest};
pub use server::{directory_mode, SudoServer};

use crate::config::{DropPrivileges, PrivilegeConfig};
use crate::error::{Error, Result};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::unistd::{fork, setresgid, setresuid, setsid, ForkResult, Gid, Uid};
use std::os::unix::net::UnixDatagram;
use tracing::{error, info, warn};

/// Ids of the user the controller runs as after dropping root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealIds {
    pub uid: Uid,
    pub gid: Gid,
    /// Started through `sudo`
    pub via_sudo: bool,
}

/// Determine the real user, honoring `SUDO_UID`/`SUDO_GID`
pub fn real_ids() -> RealIds {
    let sudo_uid = std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok());
    let sudo_gid = std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok());

    match (sudo_uid, sudo_gid) {
        (Some(uid), Some(gid)) => RealIds {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
            via_sudo: true,
        },
        _ => RealIds {
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
            via_sudo: false,
        },
    }
}

/// Whether the process can run the privileged helper
pub fn can_sudo() -> bool {
    nix::unistd::getuid().is_root() || nix::unistd::geteuid().is_root()
}

/// Start the privileged helper and return a client for it
///
/// Must be called before any other threads are spawned.
pub fn fork_server(config: &PrivilegeConfig) -> Result<SudoClient> {
    let capabilities = Capability::parse_list(&config.capabilities)?;

    if !can_sudo() {
        if config.allow_unprivileged_fallback || cfg!(test) {
            warn!("Installer is not running as root: privileged operations run in-process");
            warn!("This is not a supported deployment; uid separation, loop devices and mounts will fail");
            return Ok(SudoClient::fallback());
        }
        return Err(Error::SystemError(
            "the installer needs root privileges (set privileges.allow_unprivileged_fallback for development)"
                .to_string(),
        ));
    }

    let ids = real_ids();
    if ids.via_sudo {
        // Keep euid 0 for the helper, but make the user the real id
        setresgid(ids.gid, Gid::from_raw(0), Gid::from_raw(0))
            .map_err(|e| Error::SystemError(format!("setresgid failed: {}", e)))?;
        setresuid(ids.uid, Uid::from_raw(0), Uid::from_raw(0))
            .map_err(|e| Error::SystemError(format!("setresuid failed: {}", e)))?;
    }

    let server = SudoServer::new();
    let (parent_socket, child_socket) = UnixDatagram::pair()
        .map_err(|e| Error::SystemError(format!("could not create socket pair: {}", e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(parent_socket);
            let code = match run_helper(server, child_socket, &capabilities) {
                Ok(()) => 0,
                Err(e) => {
                    error!("SudoServer failed: {}", e);
                    1
                }
            };
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(child_socket);
            drop(server);

            if let Err(e) = drop_privileges(ids, config.drop_privileges) {
                let _ = kill(child, Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(child, None);
                return Err(e);
            }

            info!(
                "Started SudoServer (pid {}), controller runs as uid {}",
                child, ids.uid
            );
            Ok(SudoClient::connect(parent_socket, Some(child)))
        }
        Err(e) => Err(Error::SystemError(format!("Fork failed: {}", e))),
    }
}

/// Body of the helper process
fn run_helper(server: SudoServer, socket: UnixDatagram, capabilities: &[Capability]) -> Result<()> {
    // SAFETY: closing stdin in a freshly forked single-threaded child
    unsafe {
        libc::close(0);
    }
    if let Err(e) = setsid() {
        warn!("SudoServer: setsid failed: {}", e);
    }

    // The helper must not outlive the controller
    // SAFETY: restoring the default disposition is async-signal-safe
    if let Err(e) = unsafe { signal(Signal::SIGHUP, SigHandler::SigDfl) } {
        warn!("SudoServer: could not reset SIGHUP: {}", e);
    }
    if let Err(e) = nix::sys::prctl::set_pdeathsig(Signal::SIGHUP) {
        warn!("SudoServer: could not arm parent death signal: {}", e);
    }

    if let Err(e) = capability::restrict_to(capabilities) {
        error!("SudoServer: could not drop capabilities: {}", e);
    }

    server.serve(socket)
}

/// Give up root in the controller process
fn drop_privileges(ids: RealIds, mode: DropPrivileges) -> Result<()> {
    let (uid, gid) = (ids.uid, ids.gid);
    let result = match mode {
        DropPrivileges::Permanent => {
            setresgid(gid, gid, gid).and_then(|_| setresuid(uid, uid, uid))
        }
        DropPrivileges::Regainable => setresgid(gid, gid, Gid::from_raw(0))
            .and_then(|_| setresuid(uid, uid, Uid::from_raw(0))),
    };

    result.map_err(|e| {
        Error::SystemError(format!(
            "could not drop privileges to {}:{}: {}",
            uid, gid, e
        ))
    })
}

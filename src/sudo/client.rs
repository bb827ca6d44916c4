// src/sudo/client.rs

//! The unprivileged side of the sudo channel

use super::protocol::{self, SudoReply, SudoRequest, RECV_BUFFER_SIZE};
use super::server::SudoServer;
use crate::error::{Error, Result};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

enum Transport {
    /// Requests go to the forked helper
    Socket {
        socket: UnixDatagram,
        helper: Option<Pid>,
        stopped: bool,
    },
    /// Requests are executed in this process
    InProcess(SudoServer),
}

/// Client for the privileged helper
///
/// All calls block until the reply arrives. Calls from several threads are
/// serialized, so there is at most one request in flight.
pub struct SudoClient {
    transport: Mutex<Transport>,
    last_error: Mutex<String>,
}

impl SudoClient {
    /// Client talking to a helper over `socket`
    pub fn connect(socket: UnixDatagram, helper: Option<Pid>) -> Self {
        Self {
            transport: Mutex::new(Transport::Socket {
                socket,
                helper,
                stopped: false,
            }),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Client executing all operations directly in this process
    ///
    /// Only useful when the process already has the rights it needs, or in
    /// tests that never touch foreign uids, loop devices or mounts.
    pub fn fallback() -> Self {
        Self {
            transport: Mutex::new(Transport::InProcess(SudoServer::new())),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Whether this client runs operations in-process
    pub fn is_fallback(&self) -> bool {
        self.transport
            .lock()
            .map(|t| matches!(*t, Transport::InProcess(_)))
            .unwrap_or(false)
    }

    /// Error message of the last failed call on this client
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn set_last_error(&self, message: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = message.to_string();
        }
    }

    fn call(&self, request: SudoRequest) -> Result<SudoReply> {
        let result = self.round_trip(request);
        match &result {
            Ok(_) => self.set_last_error(""),
            Err(e) => self.set_last_error(e.message()),
        }
        result
    }

    fn round_trip(&self, request: SudoRequest) -> Result<SudoReply> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| Error::SystemError("sudo client lock poisoned".to_string()))?;

        match &mut *transport {
            Transport::InProcess(server) => server.execute(request),
            Transport::Socket {
                socket, stopped, ..
            } => {
                if *stopped {
                    return Err(Error::SystemError(
                        "the SudoServer process has been stopped".to_string(),
                    ));
                }

                let frame = protocol::encode_request(&request).map_err(|e| {
                    Error::SystemError(format!(
                        "failed to send command to the SudoServer process: {}",
                        e
                    ))
                })?;
                send_all(socket, &frame)?;

                let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                let size = loop {
                    match socket.recv(&mut buffer) {
                        Ok(size) => break size,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            return Err(Error::SystemError(format!(
                                "failed to receive reply from the SudoServer process: {}",
                                e
                            )));
                        }
                    }
                };

                let (reply, error) = protocol::decode_reply(&buffer[..size]).map_err(|e| {
                    Error::SystemError(format!(
                        "failed to receive reply from the SudoServer process: {}",
                        e
                    ))
                })?;

                if !error.is_empty() {
                    return Err(Error::IoError(error));
                }
                Ok(reply)
            }
        }
    }

    fn call_done(&self, request: SudoRequest) -> Result<()> {
        match self.call(request)? {
            SudoReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Bind an image file to a loop device, returning the device path
    pub fn attach_loopback(&self, image: &Path, read_only: bool) -> Result<String> {
        match self.call(SudoRequest::AttachLoopback {
            image: image.to_path_buf(),
            read_only,
        })? {
            SudoReply::Device(device) => Ok(device),
            other => Err(unexpected(other)),
        }
    }

    /// Release a loop device
    pub fn detach_loopback(&self, device: &str) -> Result<()> {
        self.call_done(SudoRequest::DetachLoopback {
            device: device.to_string(),
        })
    }

    pub fn mount(&self, device: &str, mount_point: &Path, read_only: bool, fstype: &str) -> Result<()> {
        self.call_done(SudoRequest::Mount {
            device: device.to_string(),
            mount_point: mount_point.to_path_buf(),
            read_only,
            fstype: fstype.to_string(),
        })
    }

    pub fn unmount(&self, mount_point: &Path, force: bool) -> Result<()> {
        self.call_done(SudoRequest::Unmount {
            mount_point: mount_point.to_path_buf(),
            force,
        })
    }

    /// Create a filesystem. Empty `options` selects the defaults for ext2/3/4.
    pub fn mkfs(&self, device: &str, fstype: &str, options: &[String]) -> Result<()> {
        self.call_done(SudoRequest::Mkfs {
            device: device.to_string(),
            fstype: fstype.to_string(),
            options: options.to_vec(),
        })
    }

    pub fn remove_recursive(&self, path: &Path) -> Result<()> {
        self.call_done(SudoRequest::RemoveRecursive {
            path: path.to_path_buf(),
        })
    }

    /// Recursively chown to `uid:gid` and chmod to `mode` (directories get
    /// matching x bits)
    pub fn set_owner_and_permissions_recursive(
        &self,
        path: &Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()> {
        self.call_done(SudoRequest::SetOwnerAndPermissionsRecursive {
            path: path.to_path_buf(),
            uid,
            gid,
            mode,
        })
    }

    /// Ask the helper to exit and reap it
    pub fn stop_server(&self) {
        let Ok(mut transport) = self.transport.lock() else {
            return;
        };
        let Transport::Socket {
            socket,
            helper,
            stopped,
        } = &mut *transport
        else {
            return;
        };
        if *stopped {
            return;
        }
        *stopped = true;

        match protocol::encode_request(&SudoRequest::StopServer) {
            Ok(frame) => {
                if send_all(socket, &frame).is_ok() {
                    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                    let _ = socket.recv(&mut buffer);
                }
            }
            Err(e) => warn!("Could not encode stop request: {}", e),
        }

        if let Some(pid) = helper.take() {
            match waitpid(pid, None) {
                Ok(status) => debug!("SudoServer exited: {:?}", status),
                Err(e) => warn!("Could not reap SudoServer {}: {}", pid, e),
            }
        }
    }
}

impl Drop for SudoClient {
    fn drop(&mut self) {
        self.stop_server();
    }
}

fn send_all(socket: &UnixDatagram, frame: &[u8]) -> Result<()> {
    loop {
        match socket.send(frame) {
            Ok(sent) if sent == frame.len() => return Ok(()),
            Ok(sent) => {
                return Err(Error::SystemError(format!(
                    "failed to send command to the SudoServer process: short write ({} of {})",
                    sent,
                    frame.len()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::SystemError(format!(
                    "failed to send command to the SudoServer process: {}",
                    e
                )));
            }
        }
    }
}

fn unexpected(reply: SudoReply) -> Error {
    Error::SystemError(format!("unexpected reply from the SudoServer: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_fallback_executes_in_process() {
        let client = SudoClient::fallback();
        assert!(client.is_fallback());

        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("doomed");
        fs::create_dir(&target).unwrap();
        client.remove_recursive(&target).unwrap();
        assert!(!target.exists());
        assert!(client.last_error().is_empty());
    }

    #[test]
    fn test_last_error_is_recorded() {
        let client = SudoClient::fallback();
        let err = client.detach_loopback("/dev/sda").unwrap_err();
        assert_eq!(client.last_error(), err.message());
        assert!(client.last_error().contains("not a loop device"));
    }

    #[test]
    fn test_socket_client_against_helper_thread() {
        let (client_socket, server_socket) = UnixDatagram::pair().unwrap();
        let handle = thread::spawn(move || SudoServer::new().serve(server_socket));
        let client = SudoClient::connect(client_socket, None);
        assert!(!client.is_fallback());

        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("tree");
        fs::create_dir_all(target.join("a/b")).unwrap();
        client.remove_recursive(&target).unwrap();
        assert!(!target.exists());

        let err = client.unmount(&temp_dir.path().join("missing"), false).unwrap_err();
        assert!(err.message().contains("does not exist"));
        assert!(client.last_error().contains("does not exist"));

        client.stop_server();
        handle.join().unwrap().unwrap();

        // Calls after stopping fail instead of hanging
        assert!(client.remove_recursive(&target).is_err());
    }
}

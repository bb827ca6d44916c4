// src/registry.rs

//! Application registry interface
//!
//! The installer never owns the list of installed applications. It talks to
//! a registry running on its own thread, moving descriptors through a
//! channel and blocking on the reply.
//!
//! [`MemoryRegistry`] is the implementation used by the CLI and the tests.

use crate::config::UserIdSeparation;
use crate::error::{Error, Result};
use crate::location::InstallationLocation;
use crate::manifest::{ApplicationManifest, MANIFEST_FILE_NAME};
use crate::report::{InstallationReport, REPORT_FILE_NAME};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use tracing::{debug, warn};

/// Everything the registry knows about one application
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationDescriptor {
    pub manifest: ApplicationManifest,
    /// Report of the installed package; `None` for built-in applications
    pub report: Option<InstallationReport>,
    /// Separated uid the application runs as
    pub uid: Option<u32>,
    pub built_in: bool,
}

impl ApplicationDescriptor {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Location the application is installed in
    pub fn location_id(&self) -> Option<&str> {
        self.report
            .as_ref()
            .map(|r| r.installation_location_id())
            .filter(|id| !id.is_empty())
    }
}

/// Lifecycle state of a registered application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Installed,
    BeingInstalled,
    BeingUpdated,
    BeingRemoved,
}

/// The registry operations the installer depends on
pub trait ApplicationRegistry: Send {
    /// An installation of `descriptor` is about to be committed
    ///
    /// Returns false if the application is busy or may not be replaced.
    fn starting_application_installation(&mut self, descriptor: ApplicationDescriptor) -> bool;
    fn starting_application_removal(&mut self, id: &str) -> bool;
    /// The pending installation, update or removal of `id` is done
    fn finished_application_install(&mut self, id: &str) -> bool;
    /// The pending installation, update or removal of `id` was rolled back
    fn canceled_application_install(&mut self, id: &str) -> bool;
    /// Record the uid picked for the pending installation of `id`
    fn assign_user_id(&mut self, id: &str, uid: u32) -> bool;
    /// Forget a broken application without touching the filesystem
    fn forget_application(&mut self, id: &str) -> bool;
    fn application(&self, id: &str) -> Option<ApplicationDescriptor>;
    fn applications(&self) -> Vec<ApplicationDescriptor>;
    fn install_state(&self, id: &str) -> Option<InstallState>;
}

struct Entry {
    descriptor: ApplicationDescriptor,
    state: InstallState,
    /// The installed version while an update is pending
    previous: Option<ApplicationDescriptor>,
}

/// Registry kept in memory
#[derive(Default)]
pub struct MemoryRegistry {
    apps: BTreeMap<String, Entry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application as installed
    pub fn insert(&mut self, descriptor: ApplicationDescriptor) {
        self.apps.insert(
            descriptor.id().to_string(),
            Entry {
                descriptor,
                state: InstallState::Installed,
                previous: None,
            },
        );
    }

    /// Register every application found in `manifest_dir`
    ///
    /// Directories with a `+` or `-` suffix are leftovers of interrupted
    /// transactions and are skipped, as are entries whose manifest or
    /// report cannot be read. The uid of an application is the owner of
    /// its installation directory, if that falls into the separated range.
    pub fn load_installed(
        &mut self,
        manifest_dir: &Path,
        locations: &[InstallationLocation],
        separation: Option<UserIdSeparation>,
    ) -> Result<usize> {
        let entries = match fs::read_dir(manifest_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::IoError(format!(
                    "could not read {}: {}",
                    manifest_dir.display(),
                    e
                )));
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with('+') || name.ends_with('-') || !entry.path().is_dir() {
                continue;
            }
            match load_descriptor(&entry.path(), locations, separation) {
                Ok(descriptor) if descriptor.id() == name => {
                    self.insert(descriptor);
                    loaded += 1;
                }
                Ok(descriptor) => warn!(
                    "Ignoring {}: manifest id {} does not match",
                    entry.path().display(),
                    descriptor.id()
                ),
                Err(e) => warn!("Ignoring {}: {}", entry.path().display(), e),
            }
        }
        debug!("Loaded {} installed applications", loaded);
        Ok(loaded)
    }
}

fn load_descriptor(
    dir: &Path,
    locations: &[InstallationLocation],
    separation: Option<UserIdSeparation>,
) -> Result<ApplicationDescriptor> {
    let manifest = ApplicationManifest::from_file(&dir.join(MANIFEST_FILE_NAME))?;
    let content = fs::read(dir.join(REPORT_FILE_NAME))?;
    let mut report = InstallationReport::new(&manifest.id);
    report.deserialize(&content)?;

    let uid = separation.and_then(|sep| {
        let location = locations
            .iter()
            .find(|l| l.id() == report.installation_location_id())?;
        let uid = fs::metadata(location.installation_path().join(&manifest.id))
            .ok()?
            .uid();
        (sep.min_user_id..=sep.max_user_id)
            .contains(&uid)
            .then_some(uid)
    });

    Ok(ApplicationDescriptor {
        manifest,
        report: Some(report),
        uid,
        built_in: false,
    })
}

impl ApplicationRegistry for MemoryRegistry {
    fn starting_application_installation(&mut self, descriptor: ApplicationDescriptor) -> bool {
        let id = descriptor.id().to_string();
        match self.apps.get_mut(&id) {
            Some(entry) if entry.state != InstallState::Installed || entry.descriptor.built_in => {
                false
            }
            Some(entry) => {
                entry.previous = Some(std::mem::replace(&mut entry.descriptor, descriptor));
                entry.state = InstallState::BeingUpdated;
                true
            }
            None => {
                self.apps.insert(
                    id,
                    Entry {
                        descriptor,
                        state: InstallState::BeingInstalled,
                        previous: None,
                    },
                );
                true
            }
        }
    }

    fn starting_application_removal(&mut self, id: &str) -> bool {
        match self.apps.get_mut(id) {
            Some(entry) if entry.state == InstallState::Installed && !entry.descriptor.built_in => {
                entry.state = InstallState::BeingRemoved;
                true
            }
            _ => false,
        }
    }

    fn finished_application_install(&mut self, id: &str) -> bool {
        let Some(entry) = self.apps.get_mut(id) else {
            return false;
        };
        let state = entry.state;
        match state {
            InstallState::BeingInstalled | InstallState::BeingUpdated => {
                entry.state = InstallState::Installed;
                entry.previous = None;
                true
            }
            InstallState::BeingRemoved => {
                self.apps.remove(id);
                true
            }
            InstallState::Installed => false,
        }
    }

    fn canceled_application_install(&mut self, id: &str) -> bool {
        let Some(entry) = self.apps.get_mut(id) else {
            return false;
        };
        let state = entry.state;
        match state {
            InstallState::BeingInstalled => {
                self.apps.remove(id);
                true
            }
            InstallState::BeingUpdated => {
                if let Some(previous) = entry.previous.take() {
                    entry.descriptor = previous;
                }
                entry.state = InstallState::Installed;
                true
            }
            InstallState::BeingRemoved => {
                entry.state = InstallState::Installed;
                true
            }
            InstallState::Installed => false,
        }
    }

    fn assign_user_id(&mut self, id: &str, uid: u32) -> bool {
        match self.apps.get_mut(id) {
            Some(entry)
                if matches!(
                    entry.state,
                    InstallState::BeingInstalled | InstallState::BeingUpdated
                ) =>
            {
                entry.descriptor.uid = Some(uid);
                true
            }
            _ => false,
        }
    }

    fn forget_application(&mut self, id: &str) -> bool {
        self.apps.remove(id).is_some()
    }

    fn application(&self, id: &str) -> Option<ApplicationDescriptor> {
        self.apps.get(id).map(|e| e.descriptor.clone())
    }

    fn applications(&self) -> Vec<ApplicationDescriptor> {
        self.apps.values().map(|e| e.descriptor.clone()).collect()
    }

    fn install_state(&self, id: &str) -> Option<InstallState> {
        self.apps.get(id).map(|e| e.state)
    }
}

/// A request served on the registry thread
pub enum RegistryRequest {
    StartingInstallation(ApplicationDescriptor, Sender<bool>),
    StartingRemoval(String, Sender<bool>),
    FinishedInstall(String, Sender<bool>),
    CanceledInstall(String, Sender<bool>),
    AssignUserId(String, u32, Sender<bool>),
    Forget(String, Sender<bool>),
    Application(String, Sender<Option<ApplicationDescriptor>>),
    Applications(Sender<Vec<ApplicationDescriptor>>),
    InstallState(String, Sender<Option<InstallState>>),
}

/// Cloneable handle to a registry thread
#[derive(Clone)]
pub struct RegistryHandle {
    tx: Sender<RegistryRequest>,
}

impl RegistryHandle {
    fn round_trip<T>(&self, request: impl FnOnce(Sender<T>) -> RegistryRequest) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(request(reply_tx))
            .map_err(|_| Error::SystemError("application registry is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::SystemError("application registry did not reply".to_string()))
    }

    pub fn starting_application_installation(&self, descriptor: ApplicationDescriptor) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::StartingInstallation(descriptor, tx))
    }

    pub fn starting_application_removal(&self, id: &str) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::StartingRemoval(id.to_string(), tx))
    }

    pub fn finished_application_install(&self, id: &str) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::FinishedInstall(id.to_string(), tx))
    }

    pub fn canceled_application_install(&self, id: &str) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::CanceledInstall(id.to_string(), tx))
    }

    pub fn assign_user_id(&self, id: &str, uid: u32) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::AssignUserId(id.to_string(), uid, tx))
    }

    pub fn forget_application(&self, id: &str) -> Result<bool> {
        self.round_trip(|tx| RegistryRequest::Forget(id.to_string(), tx))
    }

    pub fn application(&self, id: &str) -> Result<Option<ApplicationDescriptor>> {
        self.round_trip(|tx| RegistryRequest::Application(id.to_string(), tx))
    }

    pub fn applications(&self) -> Result<Vec<ApplicationDescriptor>> {
        self.round_trip(RegistryRequest::Applications)
    }

    pub fn install_state(&self, id: &str) -> Result<Option<InstallState>> {
        self.round_trip(|tx| RegistryRequest::InstallState(id.to_string(), tx))
    }
}

fn serve<R: ApplicationRegistry>(mut registry: R, rx: Receiver<RegistryRequest>) {
    // A dropped reply receiver means the caller gave up; nothing to do
    while let Ok(request) = rx.recv() {
        match request {
            RegistryRequest::StartingInstallation(descriptor, tx) => {
                let _ = tx.send(registry.starting_application_installation(descriptor));
            }
            RegistryRequest::StartingRemoval(id, tx) => {
                let _ = tx.send(registry.starting_application_removal(&id));
            }
            RegistryRequest::FinishedInstall(id, tx) => {
                let _ = tx.send(registry.finished_application_install(&id));
            }
            RegistryRequest::CanceledInstall(id, tx) => {
                let _ = tx.send(registry.canceled_application_install(&id));
            }
            RegistryRequest::AssignUserId(id, uid, tx) => {
                let _ = tx.send(registry.assign_user_id(&id, uid));
            }
            RegistryRequest::Forget(id, tx) => {
                let _ = tx.send(registry.forget_application(&id));
            }
            RegistryRequest::Application(id, tx) => {
                let _ = tx.send(registry.application(&id));
            }
            RegistryRequest::Applications(tx) => {
                let _ = tx.send(registry.applications());
            }
            RegistryRequest::InstallState(id, tx) => {
                let _ = tx.send(registry.install_state(&id));
            }
        }
    }
    debug!("Application registry thread exiting");
}

/// Run `registry` on its own thread
///
/// The thread ends when the last handle is dropped.
pub fn spawn_registry<R: ApplicationRegistry + 'static>(registry: R) -> Result<RegistryHandle> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("app-registry".to_string())
        .spawn(move || serve(registry, rx))
        .map_err(|e| Error::SystemError(format!("could not start registry thread: {}", e)))?;
    Ok(RegistryHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(id: &str, version: &str) -> ApplicationDescriptor {
        ApplicationDescriptor {
            manifest: ApplicationManifest {
                id: id.to_string(),
                icon: "icon.png".to_string(),
                version: version.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_install_then_finish() {
        let mut registry = MemoryRegistry::new();
        assert!(registry.starting_application_installation(descriptor("com.example.a", "1")));
        assert_eq!(
            registry.install_state("com.example.a"),
            Some(InstallState::BeingInstalled)
        );
        // Busy while the installation is pending
        assert!(!registry.starting_application_installation(descriptor("com.example.a", "2")));
        assert!(registry.finished_application_install("com.example.a"));
        assert_eq!(
            registry.install_state("com.example.a"),
            Some(InstallState::Installed)
        );
    }

    #[test]
    fn test_canceled_update_restores_previous() {
        let mut registry = MemoryRegistry::new();
        registry.insert(descriptor("com.example.a", "1"));

        assert!(registry.starting_application_installation(descriptor("com.example.a", "2")));
        assert_eq!(
            registry.install_state("com.example.a"),
            Some(InstallState::BeingUpdated)
        );
        assert_eq!(registry.application("com.example.a").unwrap().manifest.version, "2");

        assert!(registry.canceled_application_install("com.example.a"));
        assert_eq!(registry.application("com.example.a").unwrap().manifest.version, "1");
        assert_eq!(
            registry.install_state("com.example.a"),
            Some(InstallState::Installed)
        );
    }

    #[test]
    fn test_canceled_fresh_install_forgets() {
        let mut registry = MemoryRegistry::new();
        assert!(registry.starting_application_installation(descriptor("com.example.a", "1")));
        assert!(registry.canceled_application_install("com.example.a"));
        assert!(registry.application("com.example.a").is_none());
    }

    #[test]
    fn test_user_id_only_for_pending_installations() {
        let mut registry = MemoryRegistry::new();
        assert!(!registry.assign_user_id("com.example.a", 20000));

        registry.insert(descriptor("com.example.a", "1"));
        assert!(!registry.assign_user_id("com.example.a", 20000));

        assert!(registry.starting_application_installation(descriptor("com.example.a", "2")));
        assert!(registry.assign_user_id("com.example.a", 20001));
        assert_eq!(registry.application("com.example.a").unwrap().uid, Some(20001));

        // The installed version keeps its own uid when the update is rolled back
        assert!(registry.canceled_application_install("com.example.a"));
        assert_eq!(registry.application("com.example.a").unwrap().uid, None);
    }

    #[test]
    fn test_removal() {
        let mut registry = MemoryRegistry::new();
        assert!(!registry.starting_application_removal("com.example.a"));

        registry.insert(descriptor("com.example.a", "1"));
        assert!(registry.starting_application_removal("com.example.a"));
        assert!(registry.finished_application_install("com.example.a"));
        assert!(registry.applications().is_empty());
    }

    #[test]
    fn test_built_in_cannot_be_replaced() {
        let mut registry = MemoryRegistry::new();
        registry.insert(ApplicationDescriptor {
            built_in: true,
            ..descriptor("com.example.builtin", "1")
        });
        assert!(!registry.starting_application_installation(descriptor("com.example.builtin", "2")));
        assert!(!registry.starting_application_removal("com.example.builtin"));
    }

    #[test]
    fn test_handle_round_trips() {
        let handle = spawn_registry(MemoryRegistry::new()).unwrap();
        let other = handle.clone();

        assert!(handle
            .starting_application_installation(descriptor("com.example.a", "1"))
            .unwrap());
        assert!(other.finished_application_install("com.example.a").unwrap());
        assert_eq!(handle.applications().unwrap().len(), 1);
        assert_eq!(
            other.install_state("com.example.a").unwrap(),
            Some(InstallState::Installed)
        );
        assert!(handle.forget_application("com.example.a").unwrap());
        assert!(other.application("com.example.a").unwrap().is_none());
    }

    #[test]
    fn test_load_installed_skips_broken() {
        let temp_dir = TempDir::new().unwrap();
        let manifests = temp_dir.path();

        let good = manifests.join("com.example.good");
        fs::create_dir(&good).unwrap();
        let manifest = ApplicationManifest {
            id: "com.example.good".to_string(),
            icon: "icon.png".to_string(),
            ..Default::default()
        };
        fs::write(good.join(MANIFEST_FILE_NAME), manifest.to_yaml().unwrap()).unwrap();
        let mut report = InstallationReport::new("com.example.good");
        report.set_digest(vec![1; 32]);
        report.add_file("info.yaml");
        report.set_installation_location_id("internal-0");
        fs::write(good.join(REPORT_FILE_NAME), report.serialize().unwrap()).unwrap();

        fs::create_dir(manifests.join("com.example.broken")).unwrap();
        fs::create_dir(manifests.join("com.example.good+")).unwrap();

        let mut registry = MemoryRegistry::new();
        assert_eq!(registry.load_installed(manifests, &[], None).unwrap(), 1);
        let loaded = registry.application("com.example.good").unwrap();
        assert_eq!(loaded.location_id(), Some("internal-0"));
        assert_eq!(loaded.uid, None);
    }
}

// src/task/install.rs

//! Package installation
//!
//! The package is extracted unprivileged into a private temporary directory
//! until its manifest and icon are known. From then on the content is
//! extracted straight into a staging area next to its final place
//! (`<id>+`), which is renamed into place only after the signatures were
//! checked and the user acknowledged the installation.
//!
//! An update keeps the old version as `<id>-` until both the manifest and
//! the application directory were switched, so a failure in between can be
//! rolled back.

use super::{AcknowledgeGate, InstallerContext, InstallerEvent, Task, TaskBase, TaskState};
use crate::error::{Error, Result};
use crate::extractor::{ExtractionControl, PackageExtractor, PackageSource};
use crate::filesystem;
use crate::location::InstallationLocation;
use crate::manifest::{ApplicationManifest, MANIFEST_FILE_NAME};
use crate::registry::ApplicationDescriptor;
use crate::report::{InstallationReport, REPORT_FILE_NAME};
use crate::scope::{
    RenameMode, ScopedDirectoryCreator, ScopedFileCreator, ScopedLoopbackCreator, ScopedMounter,
    ScopedRenamer,
};
use crate::signature::{hardware_bound_digest, verify_signature};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Largest icon accepted in a package
pub const MAX_ICON_SIZE: u64 = 256 * 1024;

/// Smallest filesystem image created on removable media
pub const MIN_IMAGE_SIZE: u64 = 70 * 1024;

/// Filesystem used for images on removable media
const IMAGE_FSTYPE: &str = "ext2";

/// Installs one package into one location
pub struct InstallationTask {
    base: TaskBase,
    location: InstallationLocation,
    source: PackageSource,
    gate: AcknowledgeGate,
    cancel_flag: Arc<AtomicBool>,
}

impl InstallationTask {
    pub fn new(
        context: Arc<InstallerContext>,
        location: InstallationLocation,
        source: PackageSource,
    ) -> Self {
        Self {
            base: TaskBase::new(context),
            location,
            source,
            gate: AcknowledgeGate::new(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn location(&self) -> &InstallationLocation {
        &self.location
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }
}

impl Task for InstallationTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self) -> Result<()> {
        self.base.set_state(TaskState::Executing);
        info!(
            "Installing {} into {}",
            self.source,
            self.location.id()
        );

        let mut run = InstallationRun::new(self)?;
        run.extract()?;
        run.check_signatures()?;
        run.wait_for_acknowledge()?;
        run.install()?;
        run.clean_up();
        Ok(())
    }

    fn cancel(&self) -> bool {
        if self.gate.cancel() {
            self.cancel_flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn force_cancel(&self) {
        self.gate.force_cancel();
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    fn acknowledge(&self) -> bool {
        self.gate.acknowledge()
    }
}

/// Temporary directory that is removed even if it contains read-only entries
struct PrivateTempDir(TempDir);

impl PrivateTempDir {
    fn new() -> Result<Self> {
        tempfile::Builder::new()
            .prefix("am-install-")
            .tempdir()
            .map(PrivateTempDir)
            .map_err(|e| Error::IoError(format!("could not create a temporary directory: {}", e)))
    }

    fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for PrivateTempDir {
    fn drop(&mut self) {
        if let Err(e) = filesystem::force_remove_all(self.0.path()) {
            warn!("Failed to remove {}: {}", self.0.path().display(), e);
        }
    }
}

fn with_suffix(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}{}", name, suffix))
}

/// State of one execution of an [`InstallationTask`]
///
/// Fields are dropped in declaration order, which is the rollback order:
/// unmount, detach, then remove the staged files.
struct InstallationRun<'a> {
    task: &'a InstallationTask,
    context: Arc<InstallerContext>,

    image_mounter: ScopedMounter,
    image_loopback: ScopedLoopbackCreator,
    image_mount_point: ScopedDirectoryCreator,
    image_file: ScopedFileCreator,
    document_dir: ScopedDirectoryCreator,
    install_plus: ScopedDirectoryCreator,
    manifest_plus: ScopedDirectoryCreator,
    temp_dir: PrivateTempDir,

    entries_seen: usize,
    manifest: Option<ApplicationManifest>,
    icon_seen: bool,
    content_dir: Option<PathBuf>,
    uid: Option<u32>,
    registry_approved: bool,
    committed: bool,
    is_update: bool,
    report: InstallationReport,
}

impl<'a> InstallationRun<'a> {
    fn new(task: &'a InstallationTask) -> Result<Self> {
        let context = Arc::clone(task.base.context());
        let location = &task.location;

        if !location.is_valid() {
            return Err(Error::PackageError(format!(
                "invalid installation location {}",
                location.id()
            )));
        }
        if location.is_removable() && !location.is_mounted() {
            return Err(Error::MediumNotAvailable(format!(
                "installation location {} is not mounted",
                location.id()
            )));
        }

        let separated = context.separated_sudo();
        Ok(Self {
            task,
            image_mounter: ScopedMounter::default(),
            image_loopback: ScopedLoopbackCreator::default(),
            image_mount_point: ScopedDirectoryCreator::default(),
            image_file: ScopedFileCreator::default(),
            document_dir: ScopedDirectoryCreator::with_sudo(separated.clone()),
            install_plus: ScopedDirectoryCreator::with_sudo(separated),
            manifest_plus: ScopedDirectoryCreator::default(),
            temp_dir: PrivateTempDir::new()?,
            context,
            entries_seen: 0,
            manifest: None,
            icon_seen: false,
            content_dir: None,
            uid: None,
            registry_approved: false,
            committed: false,
            is_update: false,
            report: InstallationReport::default(),
        })
    }

    fn location(&self) -> &InstallationLocation {
        &self.task.location
    }

    fn app_id(&self) -> Result<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.id.as_str())
            .ok_or_else(|| Error::PackageError("the package manifest was not seen".to_string()))
    }

    fn extract(&mut self) -> Result<()> {
        let task_id = self.task.base.id().to_string();
        let events = Arc::clone(&self.context);
        let mut extractor =
            PackageExtractor::new(self.task.source.clone(), self.temp_dir.path())
                .with_cancel_flag(Arc::clone(&self.task.cancel_flag))
                .on_progress(Box::new(move |progress| {
                    events.emit(InstallerEvent::Progress {
                        task_id: task_id.clone(),
                        progress,
                    });
                }));

        extractor.extract(|name, control| self.on_entry(name, control))?;

        if self.manifest.is_none() || !self.icon_seen {
            return Err(Error::PackageError(
                "the package did not contain a valid info.yaml and icon file".to_string(),
            ));
        }
        self.report = extractor.installation_report().clone();
        Ok(())
    }

    fn on_entry(&mut self, name: &str, control: &mut ExtractionControl) -> Result<()> {
        self.entries_seen += 1;
        match self.entries_seen {
            1 => self.check_manifest(name, control),
            2 => {
                self.check_icon(name, control)?;
                self.prepare_installation(control)
            }
            _ => Ok(()),
        }
    }

    fn check_manifest(&mut self, name: &str, control: &ExtractionControl) -> Result<()> {
        if name != MANIFEST_FILE_NAME {
            return Err(Error::PackageError(format!(
                "{} must be the first file in the package, got {}",
                MANIFEST_FILE_NAME, name
            )));
        }

        let manifest = ApplicationManifest::from_file(&control.destination().join(name))?;
        let package_id = control.report().package_id();
        if manifest.id != package_id {
            return Err(Error::PackageError(format!(
                "the package id {} does not match the application id {} in {}",
                package_id, manifest.id, MANIFEST_FILE_NAME
            )));
        }
        if manifest.icon.is_empty() {
            return Err(Error::PackageError(format!(
                "the 'icon' field in {} is empty or missing",
                MANIFEST_FILE_NAME
            )));
        }

        if let Some(existing) = self.context.registry().application(&manifest.id)? {
            if existing.built_in {
                return Err(Error::PackageError(format!(
                    "cannot replace the built-in application {}",
                    manifest.id
                )));
            }
            if let Some(location_id) = existing.location_id()
                && location_id != self.location().id()
            {
                return Err(Error::PackageError(format!(
                    "cannot install {} into {}, it is already installed in {}",
                    manifest.id,
                    self.location().id(),
                    location_id
                )));
            }
        }

        self.task.base.set_application_id(&manifest.id);
        self.manifest = Some(manifest);
        Ok(())
    }

    fn check_icon(&mut self, name: &str, control: &ExtractionControl) -> Result<()> {
        let icon = self.manifest.as_ref().map(|m| m.icon.as_str()).unwrap_or_default();
        if name != icon {
            return Err(Error::PackageError(format!(
                "the icon {} must be the second file in the package, got {}",
                icon, name
            )));
        }
        let size = fs::metadata(control.destination().join(name))
            .map(|m| m.len())
            .map_err(|e| Error::IoError(format!("could not stat the icon {}: {}", name, e)))?;
        if size > MAX_ICON_SIZE {
            return Err(Error::PackageError(format!(
                "the icon is {} bytes, the limit is {}",
                size, MAX_ICON_SIZE
            )));
        }
        self.icon_seen = true;
        Ok(())
    }

    /// Set up the staging area once manifest and icon are known
    fn prepare_installation(&mut self, control: &mut ExtractionControl) -> Result<()> {
        let manifest = self
            .manifest
            .clone()
            .ok_or_else(|| Error::PackageError("the package manifest was not seen".to_string()))?;
        let id_owned = manifest.id.clone();
        let id = id_owned.as_str();
        let config = self.context.config();

        self.task.base.emit(InstallerEvent::RequestingAcknowledge {
            task_id: self.task.base.id().to_string(),
            manifest: manifest.clone(),
            extra: control.report().extra_meta_data().clone(),
            extra_signed: control.report().extra_signed_meta_data().clone(),
        });

        let separated = self.context.separated_sudo();
        let install_dir = self.location().installation_path().to_path_buf();
        let image_name = format!("{}.appimg", id);
        let stale = [
            with_suffix(&config.manifest_dir, id, "-"),
            with_suffix(&install_dir, id, "+"),
            with_suffix(&install_dir, id, "-"),
            with_suffix(&install_dir, &image_name, "+"),
            with_suffix(&install_dir, &image_name, "-"),
        ];
        for path in stale.iter().filter(|p| fs::symlink_metadata(p).is_ok()) {
            debug!("Removing stale {}", path.display());
            filesystem::remove_recursive(path, separated.as_deref())?;
        }

        let manifest_plus = with_suffix(&config.manifest_dir, id, "+");
        self.manifest_plus.create(&manifest_plus, true)?;

        let content_dir = if self.location().is_removable() {
            let disk_space = control.report().disk_space_used();
            self.prepare_image(id, &install_dir, disk_space)?
        } else {
            let path = with_suffix(&install_dir, id, "+");
            self.install_plus.create(&path, true)?;
            path
        };

        for file in [MANIFEST_FILE_NAME, manifest.icon.as_str()] {
            fs::copy(control.destination().join(file), content_dir.join(file)).map_err(|e| {
                Error::IoError(format!(
                    "could not copy {} to {}: {}",
                    file,
                    content_dir.display(),
                    e
                ))
            })?;
        }
        control.set_destination(content_dir.clone());
        self.content_dir = Some(content_dir);

        // An update keeps running as the uid of the installed version
        let previous_uid = self
            .context
            .registry()
            .application(id)?
            .and_then(|app| app.uid);

        let mut report = control.report().clone();
        report.set_installation_location_id(&self.location().id());
        let descriptor = ApplicationDescriptor {
            manifest,
            report: Some(report),
            uid: previous_uid,
            built_in: false,
        };
        if !self
            .context
            .registry()
            .starting_application_installation(descriptor)?
        {
            return Err(Error::PackageError(format!(
                "the application registry declined the installation of {}",
                id
            )));
        }
        self.registry_approved = true;
        self.uid = self.allocate_user_id(id, previous_uid)?;

        control.stop_notifications();
        Ok(())
    }

    /// Pick the uid of an approved installation and record it in the registry
    fn allocate_user_id(&self, id: &str, previous_uid: Option<u32>) -> Result<Option<u32>> {
        if self.context.config().user_id_separation.is_none() {
            return Ok(None);
        }
        if previous_uid.is_some() {
            return Ok(previous_uid);
        }

        // Concurrent installations must not pick the same free uid
        let _allocation = self.context.commit_lock();
        let Some(uid) = self.context.find_unused_user_id()? else {
            return Ok(None);
        };
        if !self.context.registry().assign_user_id(id, uid)? {
            return Err(Error::PackageError(format!(
                "the application registry did not accept uid {} for {}",
                uid, id
            )));
        }
        debug!("Assigned uid {} to {}", uid, id);
        Ok(Some(uid))
    }

    /// Create, format and mount a filesystem image on the removable medium
    fn prepare_image(&mut self, id: &str, install_dir: &Path, disk_space: u64) -> Result<PathBuf> {
        let sudo = Arc::clone(self.context.sudo());
        let size = disk_space.max(MIN_IMAGE_SIZE);

        let usage = self.location().disk_usage()?;
        if usage.available < size {
            return Err(Error::StorageSpace(format!(
                "not enough space on {}: {} bytes needed, {} available",
                self.location().id(),
                size,
                usage.available
            )));
        }

        let image = with_suffix(install_dir, &format!("{}.appimg", id), "+");
        self.image_file
            .create(&image)?
            .set_len(size)
            .map_err(|e| Error::IoError(format!("could not size {}: {}", image.display(), e)))?;

        let device = self
            .image_loopback
            .create(Arc::clone(&sudo), &image, false)?
            .to_string();
        sudo.mkfs(&device, IMAGE_FSTYPE, &[])?;

        let mount_point = with_suffix(&self.context.config().image_mount_dir, id, "+");
        fs::create_dir_all(&self.context.config().image_mount_dir)?;
        self.image_mount_point.create(&mount_point, true)?;
        self.image_mounter
            .mount(sudo, &device, &mount_point, false, IMAGE_FSTYPE)?;
        Ok(mount_point)
    }

    /// Enforce the signature policy on the extracted package
    fn check_signatures(&self) -> Result<()> {
        let config = self.context.config();
        if !config.security_checks {
            warn!("Security checks are disabled, not verifying signatures");
            return Ok(());
        }

        let chain = self.context.chain_of_trust();
        let digest = self.report.digest();
        let store_signature = self.report.store_signature();
        let developer_signature = self.report.developer_signature();

        if !store_signature.is_empty() {
            if let Err(e) = verify_signature(digest, store_signature, chain) {
                if config.hardware_id.is_empty() {
                    return Err(Error::PackageError(format!(
                        "could not verify the package's store signature: {}",
                        e
                    )));
                }
                let bound = hardware_bound_digest(&config.hardware_id, digest)?;
                verify_signature(&bound, store_signature, chain).map_err(|e| {
                    Error::PackageError(format!(
                        "could not verify the package's store signature: {}",
                        e
                    ))
                })?;
            }
            debug!("Store signature verified");
        } else if !developer_signature.is_empty() {
            if !config.development_mode {
                return Err(Error::PackageError(
                    "cannot install development packages on consumer devices".to_string(),
                ));
            }
            verify_signature(digest, developer_signature, chain).map_err(|e| {
                Error::PackageError(format!(
                    "could not verify the package's developer signature: {}",
                    e
                ))
            })?;
            debug!("Developer signature verified");
        } else if !config.allow_unsigned_packages {
            return Err(Error::PackageError(
                "cannot install unsigned packages".to_string(),
            ));
        }
        Ok(())
    }

    fn wait_for_acknowledge(&self) -> Result<()> {
        self.task.base.emit(InstallerEvent::BlockingUntilAcknowledge {
            task_id: self.task.base.id().to_string(),
        });
        self.task.base.set_state(TaskState::AwaitingAcknowledge);
        self.task.gate.wait_for_ack_or_cancel()
    }

    /// Stage the remaining files and switch everything into place
    fn install(&mut self) -> Result<()> {
        self.task.base.set_state(TaskState::Installing);
        let context = Arc::clone(&self.context);
        let _commit = context.commit_lock();

        let config = context.config();
        let id = self.app_id()?.to_string();
        let location = self.location().clone();
        let install_dir = location.installation_path();
        let app_name = if location.is_removable() {
            format!("{}.appimg", id)
        } else {
            id.clone()
        };
        let app_path = install_dir.join(&app_name);
        let manifest_path = config.manifest_dir.join(&id);
        let manifest_plus = with_suffix(&config.manifest_dir, &id, "+");

        self.is_update = fs::symlink_metadata(&app_path).is_ok();
        info!(
            "{} {} in {}",
            if self.is_update { "Updating" } else { "Installing" },
            id,
            location.id()
        );

        self.report.set_installation_location_id(&location.id());
        fs::write(manifest_plus.join(REPORT_FILE_NAME), self.report.serialize()?)
            .map_err(|e| Error::IoError(format!("could not write the installation report: {}", e)))?;

        let document_dir = location.document_path().join(&id);
        if !self.is_update && !document_dir.exists() {
            self.document_dir.create(&document_dir, false)?;
        }

        let content_dir = self
            .content_dir
            .clone()
            .ok_or_else(|| Error::PackageError("the package content was not staged".to_string()))?;

        if let (Some(separation), Some(uid)) = (config.user_id_separation, self.uid) {
            let sudo = context.sudo();
            if document_dir.exists() {
                sudo.set_owner_and_permissions_recursive(
                    &document_dir,
                    uid,
                    separation.common_group_id,
                    0o2700,
                )?;
            }
            sudo.set_owner_and_permissions_recursive(
                &content_dir,
                uid,
                separation.common_group_id,
                0o440,
            )?;
        }

        let icon = self
            .manifest
            .as_ref()
            .map(|m| m.icon.clone())
            .unwrap_or_default();
        for file in [MANIFEST_FILE_NAME, icon.as_str()] {
            fs::copy(self.temp_dir.path().join(file), manifest_plus.join(file)).map_err(|e| {
                Error::IoError(format!(
                    "could not copy {} to {}: {}",
                    file,
                    manifest_plus.display(),
                    e
                ))
            })?;
        }

        if location.is_removable() {
            self.image_mounter.destroy()?;
            self.image_loopback.destroy()?;
            self.image_mount_point.destroy()?;
        }

        let mode = if self.is_update {
            RenameMode::REPLACE
        } else {
            RenameMode::NAME_PLUS_TO_NAME
        };
        let mut manifest_renamer = ScopedRenamer::default();
        manifest_renamer.rename(&manifest_path, mode)?;
        let mut app_renamer = ScopedRenamer::default();
        app_renamer.rename(&app_path, mode)?;

        // Point of no return
        manifest_renamer.take();
        app_renamer.take();
        self.manifest_plus.take();
        self.install_plus.take();
        self.image_file.take();
        self.document_dir.take();
        self.committed = true;
        Ok(())
    }

    /// Remove the previous version; errors are only logged from here on
    fn clean_up(&mut self) {
        self.task.base.set_state(TaskState::CleaningUp);
        let context = Arc::clone(&self.context);
        let Ok(id) = self.app_id().map(str::to_string) else {
            return;
        };

        if self.is_update {
            let separated = context.separated_sudo();
            let app_name = if self.location().is_removable() {
                format!("{}.appimg", id)
            } else {
                id.clone()
            };
            let backups = [
                with_suffix(&context.config().manifest_dir, &id, "-"),
                with_suffix(self.location().installation_path(), &app_name, "-"),
            ];
            for backup in &backups {
                if let Err(e) = filesystem::remove_recursive(backup, separated.as_deref()) {
                    warn!("Failed to remove {}: {}", backup.display(), e);
                }
            }
        }

        filesystem::sync();

        match context.registry().finished_application_install(&id) {
            Ok(true) => {}
            Ok(false) => warn!("The application registry rejected the installation of {}", id),
            Err(e) => warn!("Could not notify the application registry: {}", e),
        }
        info!("Installed {} into {}", id, self.location().id());
    }
}

impl Drop for InstallationRun<'_> {
    fn drop(&mut self) {
        if self.committed || !self.registry_approved {
            return;
        }
        if let Some(id) = self.manifest.as_ref().map(|m| m.id.clone()) {
            match self.context.registry().canceled_application_install(&id) {
                Ok(_) => debug!("Rolled back the registration of {}", id),
                Err(e) => warn!("Could not notify the application registry: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstallerConfig, LocationConfig};
    use crate::registry::{spawn_registry, MemoryRegistry};
    use crate::sudo::SudoClient;
    use crate::task::run_task;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tar::{Builder, EntryType, Header};

    struct Fixture {
        _temp_dir: TempDir,
        root: PathBuf,
        context: Arc<InstallerContext>,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let config = InstallerConfig {
            manifest_dir: root.join("manifests"),
            image_mount_dir: root.join("image-mounts"),
            allow_unsigned_packages: true,
            locations: vec![LocationConfig {
                id: "internal-0".to_string(),
                installation_path: root.join("apps").display().to_string(),
                document_path: root.join("docs").display().to_string(),
                mount_point: None,
                is_default: true,
            }],
            ..Default::default()
        };
        fs::create_dir_all(&config.manifest_dir).unwrap();
        let registry = spawn_registry(MemoryRegistry::new()).unwrap();
        let context =
            InstallerContext::new(config, registry, Arc::new(SudoClient::fallback())).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            root,
            context: Arc::new(context),
        }
    }

    /// A package whose entries come in the given order
    fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
        use crate::packager::PackageCreator;

        let src = path.with_extension("src");
        fs::create_dir_all(&src).unwrap();
        let mut report = InstallationReport::new("com.example.test");
        for (name, data) in entries {
            fs::write(src.join(name), data).unwrap();
            report.add_file(name);
        }
        PackageCreator::new(&src, path, report).create().unwrap();
    }

    const MANIFEST: &[u8] = b"formatType: am-application\nformatVersion: 1\n---\nid: com.example.test\nicon: icon.png\ncode: main.qml\nruntime: qml\nname:\n  en: Test\n";

    fn task(fixture: &Fixture, package: &Path) -> InstallationTask {
        let location = fixture.context.location("internal-0").unwrap().clone();
        InstallationTask::new(
            Arc::clone(&fixture.context),
            location,
            PackageSource::File(package.to_path_buf()),
        )
    }

    #[test]
    fn test_install_acknowledged() {
        let fixture = fixture();
        let package = fixture.root.join("test.appkg");
        write_package(
            &package,
            &[
                ("info.yaml", MANIFEST),
                ("icon.png", b"png"),
                ("main.qml", b"Item {}"),
            ],
        );

        let task = task(&fixture, &package);
        assert!(task.acknowledge());
        run_task(&task).unwrap();

        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.application_id().as_deref(), Some("com.example.test"));
        let app = fixture.root.join("apps/com.example.test");
        assert_eq!(fs::read(app.join("main.qml")).unwrap(), b"Item {}");
        let manifests = fixture.root.join("manifests/com.example.test");
        assert!(manifests.join(MANIFEST_FILE_NAME).exists());
        assert!(manifests.join("icon.png").exists());
        let report = InstallationReport::from_yaml(&fs::read(manifests.join(REPORT_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(report.installation_location_id(), "internal-0");
        assert!(fixture.root.join("docs/com.example.test").is_dir());
        assert!(!fixture.root.join("apps/com.example.test+").exists());
    }

    #[test]
    fn test_wrong_order_creates_nothing() {
        let fixture = fixture();
        let package = fixture.root.join("test.appkg");
        write_package(
            &package,
            &[("icon.png", b"png"), ("info.yaml", MANIFEST)],
        );

        let task = task(&fixture, &package);
        task.acknowledge();
        let err = run_task(&task).unwrap_err();
        assert!(matches!(err, Error::PackageError(_)));
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(fs::read_dir(fixture.root.join("manifests")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(fixture.root.join("apps")).unwrap().count(), 0);
    }

    #[test]
    fn test_cancel_while_waiting() {
        let fixture = fixture();
        let package = fixture.root.join("test.appkg");
        write_package(
            &package,
            &[("info.yaml", MANIFEST), ("icon.png", b"png")],
        );

        let task = Arc::new(task(&fixture, &package));
        let events = fixture.context.subscribe();
        let worker = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || run_task(task.as_ref()))
        };
        loop {
            let event = events.recv().unwrap();
            if matches!(event, InstallerEvent::BlockingUntilAcknowledge { .. }) {
                break;
            }
        }
        assert!(task.cancel());
        assert!(!task.cancel());
        let err = worker.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!task.acknowledge());
        assert!(!fixture.root.join("manifests/com.example.test+").exists());
        assert!(!fixture.root.join("apps/com.example.test+").exists());
        assert!(fixture
            .context
            .registry()
            .application("com.example.test")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unsigned_rejected_when_not_allowed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let config = InstallerConfig {
            manifest_dir: root.join("manifests"),
            locations: vec![LocationConfig {
                id: "internal-0".to_string(),
                installation_path: root.join("apps").display().to_string(),
                document_path: root.join("docs").display().to_string(),
                mount_point: None,
                is_default: true,
            }],
            ..Default::default()
        };
        fs::create_dir_all(&config.manifest_dir).unwrap();
        let registry = spawn_registry(MemoryRegistry::new()).unwrap();
        let context = Arc::new(
            InstallerContext::new(config, registry, Arc::new(SudoClient::fallback())).unwrap(),
        );
        let fixture = Fixture {
            _temp_dir: temp_dir,
            root,
            context,
        };
        let package = fixture.root.join("test.appkg");
        write_package(
            &package,
            &[("info.yaml", MANIFEST), ("icon.png", b"png")],
        );

        let task = task(&fixture, &package);
        task.acknowledge();
        let err = run_task(&task).unwrap_err();
        assert_eq!(err.message(), "cannot install unsigned packages");
        assert_eq!(fs::read_dir(fixture.root.join("manifests")).unwrap().count(), 0);
    }

    #[test]
    fn test_declined_installation_allocates_no_user_id() {
        use crate::config::UserIdSeparation;
        use crate::manifest::ApplicationManifest;
        use crate::registry::ApplicationRegistry;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let config = InstallerConfig {
            manifest_dir: root.join("manifests"),
            allow_unsigned_packages: true,
            user_id_separation: Some(UserIdSeparation {
                min_user_id: 20000,
                max_user_id: 20000,
                common_group_id: 20000,
            }),
            locations: vec![LocationConfig {
                id: "internal-0".to_string(),
                installation_path: root.join("apps").display().to_string(),
                document_path: root.join("docs").display().to_string(),
                mount_point: None,
                is_default: true,
            }],
            ..Default::default()
        };
        fs::create_dir_all(&config.manifest_dir).unwrap();

        // The only uid is taken, and the application itself is busy
        let mut registry = MemoryRegistry::new();
        registry.insert(ApplicationDescriptor {
            manifest: ApplicationManifest {
                id: "com.example.other".to_string(),
                ..Default::default()
            },
            uid: Some(20000),
            ..Default::default()
        });
        registry.insert(ApplicationDescriptor {
            manifest: ApplicationManifest {
                id: "com.example.test".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(registry.starting_application_removal("com.example.test"));

        let context = Arc::new(
            InstallerContext::new(
                config,
                spawn_registry(registry).unwrap(),
                Arc::new(SudoClient::fallback()),
            )
            .unwrap(),
        );
        let fixture = Fixture {
            _temp_dir: temp_dir,
            root,
            context,
        };
        let package = fixture.root.join("test.appkg");
        write_package(&package, &[("info.yaml", MANIFEST), ("icon.png", b"png")]);

        let task = task(&fixture, &package);
        task.acknowledge();
        let err = run_task(&task).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Package);
        assert!(err.message().contains("declined"));
        assert_eq!(
            fixture.context.registry().install_state("com.example.test").unwrap(),
            Some(crate::registry::InstallState::BeingRemoved)
        );
    }

    #[test]
    fn test_oversized_icon_rejected() {
        let fixture = fixture();
        let package = fixture.root.join("test.appkg");
        let icon = vec![0u8; MAX_ICON_SIZE as usize + 1];
        write_package(&package, &[("info.yaml", MANIFEST), ("icon.png", &icon)]);

        let task = task(&fixture, &package);
        task.acknowledge();
        let err = run_task(&task).unwrap_err();
        assert!(err.message().contains("icon"));
    }

    #[test]
    fn test_symlink_entry_rolls_back() {
        let fixture = fixture();
        let package = fixture.root.join("bad.appkg");

        // Valid start, then an entry type the extractor refuses
        let good = fixture.root.join("good.appkg");
        write_package(&good, &[("info.yaml", MANIFEST), ("icon.png", b"png")]);
        let file = fs::File::create(&package).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(fs::File::open(&good).unwrap()));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name.starts_with("--PACKAGE-FOOTER--") {
                let mut header = Header::new_ustar();
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, "link", "/etc/passwd")
                    .unwrap();
            }
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &name, &mut entry).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let task = task(&fixture, &package);
        task.acknowledge();
        assert!(run_task(&task).is_err());
        assert!(!fixture.root.join("apps/com.example.test+").exists());
        assert!(!fixture.root.join("manifests/com.example.test+").exists());
        assert!(fixture
            .context
            .registry()
            .application("com.example.test")
            .unwrap()
            .is_none());
    }
}

// src/task/deinstall.rs

//! Application removal
//!
//! Removal renames the document directory, the application content and the
//! manifest directory to `<name>-` first. Only when all renames succeeded
//! is the registry told, and the `-` entries are deleted afterwards.

use super::{InstallerContext, Task, TaskBase, TaskState};
use crate::error::{Error, Result};
use crate::filesystem;
use crate::scope::{RenameMode, ScopedRenamer};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Removes one installed application
pub struct DeinstallationTask {
    base: TaskBase,
    application_id: String,
    keep_documents: bool,
    force: bool,
    canceled: AtomicBool,
}

impl DeinstallationTask {
    pub fn new(
        context: Arc<InstallerContext>,
        application_id: &str,
        keep_documents: bool,
        force: bool,
    ) -> Self {
        let base = TaskBase::new(context);
        base.set_application_id(application_id);
        Self {
            base,
            application_id: application_id.to_string(),
            keep_documents,
            force,
            canceled: AtomicBool::new(false),
        }
    }

    fn minus_path(path: &std::path::Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push("-");
        PathBuf::from(name)
    }
}

impl Task for DeinstallationTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self) -> Result<()> {
        self.base.set_state(TaskState::Executing);
        if self.canceled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("task was canceled".to_string()));
        }

        let context = self.base.context();
        let registry = context.registry();
        let id = self.application_id.as_str();

        let app = registry.application(id)?.ok_or_else(|| {
            Error::PackageError(format!("cannot remove {}: it is not installed", id))
        })?;
        if app.built_in {
            return Err(Error::PackageError(format!(
                "cannot remove the built-in application {}",
                id
            )));
        }
        let location_id = app.location_id().unwrap_or_default().to_string();
        let location = context.location(&location_id).cloned().ok_or_else(|| {
            Error::PackageError(format!(
                "cannot remove {}: unknown installation location '{}'",
                id, location_id
            ))
        })?;

        let medium_present = !location.is_removable() || location.is_mounted();
        if !medium_present && !self.force {
            return Err(Error::MediumNotAvailable(format!(
                "cannot remove {}: installation location {} is not mounted",
                id, location_id
            )));
        }

        if !registry.starting_application_removal(id)? {
            return Err(Error::PackageError(format!(
                "the application registry declined the removal of {}",
                id
            )));
        }

        self.base.set_state(TaskState::Installing);
        let result = {
            let _commit = context.commit_lock();

            let mut targets = Vec::new();
            if !self.keep_documents {
                targets.push(location.document_path().join(id));
            }
            if medium_present {
                let name = if location.is_removable() {
                    format!("{}.appimg", id)
                } else {
                    id.to_string()
                };
                targets.push(location.installation_path().join(name));
            }
            targets.push(context.config().manifest_dir.join(id));

            let separated = context.separated_sudo();
            let mut renamers = Vec::new();
            let mut renamed = Ok(());
            for target in targets.iter().filter(|t| t.exists()) {
                // A `-` left over from an interrupted removal blocks the rename
                let stale = Self::minus_path(target);
                if fs::symlink_metadata(&stale).is_ok() {
                    debug!("Removing stale {}", stale.display());
                    if let Err(e) = filesystem::remove_recursive(&stale, separated.as_deref()) {
                        renamed = Err(e);
                        break;
                    }
                }
                let mut renamer = ScopedRenamer::default();
                if let Err(e) = renamer.rename(target, RenameMode::NAME_TO_NAME_MINUS) {
                    renamed = Err(e);
                    break;
                }
                renamers.push(renamer);
            }
            if renamed.is_ok() {
                for renamer in &mut renamers {
                    renamer.take();
                }
            }
            renamed.map(|()| targets)
        };

        let targets = match result {
            Ok(targets) => targets,
            Err(e) => {
                if let Err(notify) = registry.canceled_application_install(id) {
                    warn!("Could not notify the application registry: {}", notify);
                }
                return Err(e);
            }
        };

        self.base.set_state(TaskState::CleaningUp);
        let separated = context.separated_sudo();
        for target in &targets {
            let backup = Self::minus_path(target);
            if let Err(e) = filesystem::remove_recursive(&backup, separated.as_deref()) {
                warn!("Failed to remove {}: {}", backup.display(), e);
            }
        }
        filesystem::sync();

        match registry.finished_application_install(id) {
            Ok(true) => {}
            Ok(false) => warn!("The application registry rejected the removal of {}", id),
            Err(e) => warn!("Could not notify the application registry: {}", e),
        }
        info!("Removed {} from {}", id, location_id);
        Ok(())
    }

    fn cancel(&self) -> bool {
        // Removal is not interactive; it can only be stopped before it runs
        if self.base.state() == TaskState::Queued {
            self.canceled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn force_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstallerConfig, LocationConfig};
    use crate::manifest::ApplicationManifest;
    use crate::registry::{spawn_registry, ApplicationDescriptor, MemoryRegistry};
    use crate::report::InstallationReport;
    use crate::sudo::SudoClient;
    use crate::task::run_task;
    use std::fs;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir, built_in: bool) -> Arc<InstallerContext> {
        let root = temp_dir.path();
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
        for dir in ["manifests/com.example.app", "apps/com.example.app", "docs/com.example.app"] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join("file"), b"x").unwrap();
        }

        let mut report = InstallationReport::new("com.example.app");
        report.set_installation_location_id("internal-0");
        let mut registry = MemoryRegistry::new();
        registry.insert(ApplicationDescriptor {
            manifest: ApplicationManifest {
                id: "com.example.app".to_string(),
                ..Default::default()
            },
            report: Some(report),
            uid: None,
            built_in,
        });
        let registry = spawn_registry(registry).unwrap();
        Arc::new(InstallerContext::new(config, registry, Arc::new(SudoClient::fallback())).unwrap())
    }

    #[test]
    fn test_remove_application() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, false);

        let task = DeinstallationTask::new(Arc::clone(&context), "com.example.app", false, false);
        run_task(&task).unwrap();

        let root = temp_dir.path();
        for dir in ["manifests", "apps", "docs"] {
            assert!(!root.join(dir).join("com.example.app").exists());
            assert!(!root.join(dir).join("com.example.app-").exists());
        }
        assert!(context.registry().application("com.example.app").unwrap().is_none());
    }

    #[test]
    fn test_remove_replaces_stale_backup() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, false);
        let root = temp_dir.path();
        for dir in ["manifests/com.example.app-", "apps/com.example.app-/nested"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("apps/com.example.app-/nested/old"), b"old").unwrap();

        let task = DeinstallationTask::new(Arc::clone(&context), "com.example.app", false, false);
        run_task(&task).unwrap();

        assert_eq!(task.state(), TaskState::Finished);
        for dir in ["manifests", "apps", "docs"] {
            assert!(!root.join(dir).join("com.example.app").exists());
            assert!(!root.join(dir).join("com.example.app-").exists());
        }
        assert!(context.registry().application("com.example.app").unwrap().is_none());
    }

    #[test]
    fn test_keep_documents() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, false);

        let task = DeinstallationTask::new(Arc::clone(&context), "com.example.app", true, false);
        run_task(&task).unwrap();
        assert!(temp_dir.path().join("docs/com.example.app/file").exists());
        assert!(!temp_dir.path().join("apps/com.example.app").exists());
    }

    #[test]
    fn test_built_in_not_removed() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, true);

        let task = DeinstallationTask::new(Arc::clone(&context), "com.example.app", false, false);
        assert!(matches!(run_task(&task), Err(Error::PackageError(_))));
        assert!(temp_dir.path().join("apps/com.example.app").exists());
    }

    #[test]
    fn test_unknown_application() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, false);
        let task = DeinstallationTask::new(context, "com.example.other", false, false);
        assert!(run_task(&task).is_err());
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let temp_dir = TempDir::new().unwrap();
        let context = setup(&temp_dir, false);
        let task = DeinstallationTask::new(context, "com.example.app", false, false);
        assert!(task.cancel());
        assert!(run_task(&task).unwrap_err().is_cancelled());
        assert!(!task.cancel());
        assert!(temp_dir.path().join("apps/com.example.app").exists());
    }
}

// src/installer.rs

//! Package installer facade
//!
//! [`PackageInstaller`] is the entry point for embedders. It owns the task
//! queue: tasks run one at a time on a worker thread, in the order they were
//! started. Progress and results are delivered as [`InstallerEvent`]s to
//! every subscriber.

use crate::error::{Error, Result};
use crate::extractor::PackageSource;
use crate::filesystem;
use crate::location::InstallationLocation;
use crate::lock::{InstallerLock, LOCK_FILE_NAME};
use crate::manifest::MANIFEST_FILE_NAME;
use crate::report::REPORT_FILE_NAME;
use crate::task::{
    fail_task, run_task, DeinstallationTask, InstallationTask, InstallerContext, InstallerEvent,
    Task, TaskState,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, warn};

/// Outcome of a task that left the queue
#[derive(Debug, Clone)]
struct CompletedTask {
    state: TaskState,
    application_id: Option<String>,
}

#[derive(Default)]
struct QueueState {
    active: Option<Arc<dyn Task>>,
    queued: VecDeque<Arc<dyn Task>>,
    completed: HashMap<String, CompletedTask>,
}

impl QueueState {
    fn find(&self, task_id: &str) -> Option<&Arc<dyn Task>> {
        self.active
            .iter()
            .chain(self.queued.iter())
            .find(|task| task.id() == task_id)
    }
}

fn lock_queue(queue: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Start the next queued task if none is running
fn trigger_next(queue: &Arc<Mutex<QueueState>>, state: &mut QueueState) {
    while state.active.is_none() {
        let Some(task) = state.queued.pop_front() else {
            return;
        };

        let worker_queue = Arc::clone(queue);
        let worker_task = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name("installer-task".to_string())
            .spawn(move || {
                // The outcome is published as events by run_task
                let _ = run_task(worker_task.as_ref());
                let mut state = lock_queue(&worker_queue);
                state.completed.insert(
                    worker_task.id().to_string(),
                    CompletedTask {
                        state: worker_task.state(),
                        application_id: worker_task.application_id(),
                    },
                );
                state.active = None;
                trigger_next(&worker_queue, &mut state);
            });

        match spawned {
            Ok(_) => state.active = Some(task),
            Err(e) => {
                let error = Error::SystemError(format!("could not start task thread: {}", e));
                fail_task(task.as_ref(), &error);
                state.completed.insert(
                    task.id().to_string(),
                    CompletedTask {
                        state: TaskState::Failed,
                        application_id: task.application_id(),
                    },
                );
            }
        }
    }
}

/// The installer facade
pub struct PackageInstaller {
    context: Arc<InstallerContext>,
    queue: Arc<Mutex<QueueState>>,
    _lock: InstallerLock,
}

impl PackageInstaller {
    /// Take the instance lock on the manifest directory and set up the queue
    pub fn new(context: Arc<InstallerContext>) -> Result<Self> {
        let lock = InstallerLock::acquire_for(&context.config().manifest_dir)?;
        Ok(Self {
            context,
            queue: Arc::new(Mutex::new(QueueState::default())),
            _lock: lock,
        })
    }

    pub fn context(&self) -> &Arc<InstallerContext> {
        &self.context
    }

    /// Receive all future events
    pub fn subscribe(&self) -> Receiver<InstallerEvent> {
        self.context.subscribe()
    }

    fn enqueue(&self, task: Arc<dyn Task>) -> String {
        let task_id = task.id().to_string();
        let mut state = lock_queue(&self.queue);
        debug!("Queueing task {}", task_id);
        state.queued.push_back(task);
        trigger_next(&self.queue, &mut state);
        task_id
    }

    /// Queue the installation of the package at `source` into `location_id`
    ///
    /// `source` is a file path or a `file://`, `http://` or `https://` URL.
    /// Returns the task id.
    pub fn start_package_installation(&self, location_id: &str, source: &str) -> Result<String> {
        let location = self
            .context
            .location(location_id)
            .cloned()
            .ok_or_else(|| {
                Error::PackageError(format!("invalid installation location '{}'", location_id))
            })?;
        let source = PackageSource::parse(source)?;
        info!("Starting installation of {} into {}", source, location_id);

        let task = InstallationTask::new(Arc::clone(&self.context), location, source);
        Ok(self.enqueue(Arc::new(task)))
    }

    /// Queue the removal of an installed application
    pub fn remove_package(&self, id: &str, keep_documents: bool, force: bool) -> Result<String> {
        if self.context.registry().application(id)?.is_none() {
            return Err(Error::PackageError(format!(
                "cannot remove {}: it is not installed",
                id
            )));
        }
        info!("Starting removal of {}", id);
        let task = DeinstallationTask::new(Arc::clone(&self.context), id, keep_documents, force);
        Ok(self.enqueue(Arc::new(task)))
    }

    /// Let a task waiting for the user continue
    pub fn acknowledge_package_installation(&self, task_id: &str) -> bool {
        let state = lock_queue(&self.queue);
        match state.find(task_id) {
            Some(task) => task.acknowledge(),
            None => {
                warn!("Cannot acknowledge unknown task {}", task_id);
                false
            }
        }
    }

    /// Cancel a task
    ///
    /// A queued task is removed right away. The running task decides itself
    /// whether it can still be stopped.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = lock_queue(&self.queue);

        if let Some(active) = &state.active
            && active.id() == task_id
        {
            return active.cancel();
        }

        let Some(position) = state.queued.iter().position(|t| t.id() == task_id) else {
            return false;
        };
        let Some(task) = state.queued.remove(position) else {
            return false;
        };
        task.force_cancel();
        fail_task(
            task.as_ref(),
            &Error::Cancelled("task was canceled while queued".to_string()),
        );
        state.completed.insert(
            task_id.to_string(),
            CompletedTask {
                state: TaskState::Failed,
                application_id: task.application_id(),
            },
        );
        true
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        let state = lock_queue(&self.queue);
        state
            .find(task_id)
            .map(|task| task.state())
            .or_else(|| state.completed.get(task_id).map(|c| c.state))
    }

    pub fn task_application_id(&self, task_id: &str) -> Option<String> {
        let state = lock_queue(&self.queue);
        match state.find(task_id) {
            Some(task) => task.application_id(),
            None => state
                .completed
                .get(task_id)
                .and_then(|c| c.application_id.clone()),
        }
    }

    /// Ids of the running and the queued tasks
    pub fn active_task_ids(&self) -> Vec<String> {
        let state = lock_queue(&self.queue);
        state
            .active
            .iter()
            .chain(state.queued.iter())
            .map(|task| task.id().to_string())
            .collect()
    }

    pub fn installation_location_ids(&self) -> Vec<String> {
        self.context.locations().iter().map(|l| l.id()).collect()
    }

    pub fn installation_location(&self, id: &str) -> Option<&InstallationLocation> {
        self.context.location(id)
    }

    pub fn default_installation_location(&self) -> Option<&InstallationLocation> {
        self.context.locations().iter().find(|l| l.is_default())
    }

    /// Location an installed application lives in
    pub fn installation_location_from_application(
        &self,
        app_id: &str,
    ) -> Result<Option<InstallationLocation>> {
        let app = self.context.registry().application(app_id)?;
        Ok(app
            .as_ref()
            .and_then(|app| app.location_id())
            .and_then(|id| self.context.location(id))
            .cloned())
    }

    /// Bytes used by an installed application's content
    pub fn installed_application_size(&self, app_id: &str) -> Result<u64> {
        let location = self
            .installation_location_from_application(app_id)?
            .ok_or_else(|| Error::PackageError(format!("{} is not installed", app_id)))?;

        if location.is_removable() {
            let image = location
                .installation_path()
                .join(format!("{}.appimg", app_id));
            let meta = fs::metadata(&image)
                .map_err(|e| Error::IoError(format!("could not stat {}: {}", image.display(), e)))?;
            Ok(meta.len())
        } else {
            Ok(filesystem::directory_size(
                &location.installation_path().join(app_id),
            ))
        }
    }

    pub fn find_unused_user_id(&self) -> Result<Option<u32>> {
        self.context.find_unused_user_id()
    }

    /// Repair the installation state after a crash or power loss
    ///
    /// Stale image mounts are released, registry entries whose files are
    /// incomplete are dropped, and every directory entry that does not belong
    /// to a valid application is deleted. Must not run while tasks are active.
    pub fn cleanup_broken_installations(&self) -> Result<()> {
        if !self.active_task_ids().is_empty() {
            return Err(Error::SystemError(
                "cannot clean up while installer tasks are active".to_string(),
            ));
        }
        let context = &self.context;
        let config = context.config();
        let sudo = context.sudo();
        let separated = context.separated_sudo();
        let _commit = context.commit_lock();
        info!("Cleaning up broken installations");

        if let Ok(entries) = fs::read_dir(&config.image_mount_dir) {
            let mounts = filesystem::mounted_directories().unwrap_or_default();
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(mount) = mounts.iter().find(|m| m.mount_point == path) {
                    if let Err(e) = sudo.unmount(&path, true) {
                        warn!("Could not unmount {}: {}", path.display(), e);
                        continue;
                    }
                    if mount.device.starts_with("/dev/loop")
                        && let Err(e) = sudo.detach_loopback(&mount.device)
                    {
                        warn!("Could not detach {}: {}", mount.device, e);
                    }
                }
                if let Err(e) = filesystem::remove_recursive(&path, None) {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }

        let registry = context.registry();
        let mut keep: HashMap<PathBuf, HashSet<String>> = HashMap::new();
        keep.entry(config.manifest_dir.clone())
            .or_default()
            .insert(LOCK_FILE_NAME.to_string());
        for location in context.locations() {
            keep.entry(location.installation_path().to_path_buf()).or_default();
            keep.entry(location.document_path().to_path_buf()).or_default();
        }

        for app in registry.applications()? {
            let id = app.id().to_string();
            if app.built_in {
                for location in context.locations() {
                    keep.entry(location.document_path().to_path_buf())
                        .or_default()
                        .insert(id.clone());
                }
                continue;
            }

            let location = app.location_id().and_then(|l| context.location(l));
            let Some(location) = location else {
                warn!("Dropping {}: unknown installation location", id);
                registry.forget_application(&id)?;
                continue;
            };

            let manifest_path = config.manifest_dir.join(&id);
            let content_name = if location.is_removable() {
                format!("{}.appimg", id)
            } else {
                id.clone()
            };
            let content_known = location.is_removable() && !location.is_mounted();
            let valid = manifest_path.join(MANIFEST_FILE_NAME).is_file()
                && manifest_path.join(REPORT_FILE_NAME).is_file()
                && location.document_path().join(&id).is_dir()
                && (content_known || location.installation_path().join(&content_name).exists());

            if !valid {
                warn!("Dropping broken installation of {}", id);
                registry.forget_application(&id)?;
                continue;
            }

            keep.entry(config.manifest_dir.clone()).or_default().insert(id.clone());
            keep.entry(location.document_path().to_path_buf())
                .or_default()
                .insert(id.clone());
            keep.entry(location.installation_path().to_path_buf())
                .or_default()
                .insert(content_name);
        }

        // Unmounted removable media cannot be inspected
        let unavailable: HashSet<PathBuf> = context
            .locations()
            .iter()
            .filter(|l| l.is_removable() && !l.is_mounted())
            .flat_map(|l| [l.installation_path().to_path_buf(), l.document_path().to_path_buf()])
            .collect();

        for (dir, names) in &keep {
            if unavailable.contains(dir) {
                continue;
            }
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if names.contains(&name) {
                    continue;
                }
                let path = entry.path();
                info!("Removing stale {}", path.display());
                if let Err(e) = filesystem::remove_recursive(&path, separated.as_deref()) {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }
}

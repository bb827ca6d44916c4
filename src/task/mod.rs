// src/task/mod.rs

//! Installer tasks
//!
//! A task is one queued unit of work: installing a package or removing an
//! application. Tasks run on a worker thread and share an
//! [`InstallerContext`] holding everything a task needs from the outside:
//! configuration, locations, the registry handle, the sudo client and the
//! commit lock.
//!
//! # Task lifecycle
//!
//! ```text
//! Queued -> Executing -> AwaitingAcknowledge -> Installing -> CleaningUp -> Finished
//!                  \               \                \
//!                   +---------------+----------------+--> Failed
//! ```

mod deinstall;
mod install;

pub use deinstall::DeinstallationTask;
pub use install::{InstallationTask, MAX_ICON_SIZE, MIN_IMAGE_SIZE};

use crate::config::InstallerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::location::{InstallationLocation, find_location, parse_locations};
use crate::manifest::ApplicationManifest;
use crate::registry::RegistryHandle;
use crate::signature::ChainOfTrust;
use crate::sudo::SudoClient;
use serde_yaml::Mapping;
use std::collections::HashSet;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

/// State of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Executing,
    AwaitingAcknowledge,
    Installing,
    CleaningUp,
    Finished,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::AwaitingAcknowledge => "awaiting-acknowledge",
            TaskState::Installing => "installing",
            TaskState::CleaningUp => "cleaning-up",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification about a task
#[derive(Debug, Clone, PartialEq)]
pub enum InstallerEvent {
    Started {
        task_id: String,
    },
    StateChanged {
        task_id: String,
        state: TaskState,
    },
    Progress {
        task_id: String,
        progress: f64,
    },
    /// Metadata of the package is known; the user should be asked
    RequestingAcknowledge {
        task_id: String,
        manifest: ApplicationManifest,
        extra: Mapping,
        extra_signed: Mapping,
    },
    /// The task waits for `acknowledge_package_installation`
    BlockingUntilAcknowledge {
        task_id: String,
    },
    Finished {
        task_id: String,
    },
    Failed {
        task_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl InstallerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            InstallerEvent::Started { task_id }
            | InstallerEvent::StateChanged { task_id, .. }
            | InstallerEvent::Progress { task_id, .. }
            | InstallerEvent::RequestingAcknowledge { task_id, .. }
            | InstallerEvent::BlockingUntilAcknowledge { task_id }
            | InstallerEvent::Finished { task_id }
            | InstallerEvent::Failed { task_id, .. } => task_id,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct GateState {
    canceled: bool,
    acknowledged: bool,
}

/// Blocks a task until the user acknowledges or cancels it
///
/// Acknowledging and canceling are mutually exclusive: whichever happens
/// first wins, so a task can no longer be canceled once acknowledged.
#[derive(Debug, Default)]
pub struct AcknowledgeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl AcknowledgeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel unless already acknowledged or canceled
    ///
    /// Only the call that actually cancels returns true.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if state.acknowledged || state.canceled {
            return false;
        }
        state.canceled = true;
        self.cond.notify_all();
        true
    }

    /// Cancel regardless of acknowledgment, for tasks that never started
    pub fn force_cancel(&self) {
        let mut state = lock(&self.state);
        state.canceled = true;
        state.acknowledged = false;
        self.cond.notify_all();
    }

    /// Acknowledge unless already canceled
    pub fn acknowledge(&self) -> bool {
        let mut state = lock(&self.state);
        if state.canceled {
            return false;
        }
        state.acknowledged = true;
        self.cond.notify_all();
        true
    }

    pub fn is_canceled(&self) -> bool {
        lock(&self.state).canceled
    }

    pub fn is_acknowledged(&self) -> bool {
        lock(&self.state).acknowledged
    }

    /// Wait until acknowledged (`Ok`) or canceled (`Cancelled`)
    pub fn wait_for_ack_or_cancel(&self) -> Result<()> {
        let mut state = lock(&self.state);
        loop {
            if state.canceled {
                return Err(Error::Cancelled("task was canceled".to_string()));
            }
            if state.acknowledged {
                return Ok(());
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Fan-out of installer events to all subscribers
#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<Sender<InstallerEvent>>>,
}

impl EventBus {
    fn subscribe(&self) -> Receiver<InstallerEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: InstallerEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Everything tasks share
pub struct InstallerContext {
    config: InstallerConfig,
    locations: Vec<InstallationLocation>,
    chain_of_trust: ChainOfTrust,
    registry: RegistryHandle,
    sudo: Arc<SudoClient>,
    commit_lock: Mutex<()>,
    events: EventBus,
}

impl InstallerContext {
    /// Build the context, validating the configured locations
    pub fn new(config: InstallerConfig, registry: RegistryHandle, sudo: Arc<SudoClient>) -> Result<Self> {
        let locations = parse_locations(&config)?;
        let chain_of_trust = ChainOfTrust::from_config_entries(&config.trusted_keys)?;
        info!(
            "Installer context with {} locations, {} trusted keys",
            locations.len(),
            chain_of_trust.trusted_keys.len()
        );
        Ok(Self {
            config,
            locations,
            chain_of_trust,
            registry,
            sudo,
            commit_lock: Mutex::new(()),
            events: EventBus::default(),
        })
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn locations(&self) -> &[InstallationLocation] {
        &self.locations
    }

    pub fn location(&self, id: &str) -> Option<&InstallationLocation> {
        find_location(&self.locations, id)
    }

    pub fn chain_of_trust(&self) -> &ChainOfTrust {
        &self.chain_of_trust
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn sudo(&self) -> &Arc<SudoClient> {
        &self.sudo
    }

    /// The sudo client for removals, if content may belong to other uids
    pub fn separated_sudo(&self) -> Option<Arc<SudoClient>> {
        self.config
            .user_id_separation
            .is_some()
            .then(|| Arc::clone(&self.sudo))
    }

    /// Serialize the commit phase of all tasks
    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.commit_lock)
    }

    pub fn subscribe(&self) -> Receiver<InstallerEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: InstallerEvent) {
        self.events.emit(event);
    }

    /// First uid of the separation range not used by a registered application
    ///
    /// `None` when uid separation is disabled.
    pub fn find_unused_user_id(&self) -> Result<Option<u32>> {
        let Some(separation) = self.config.user_id_separation else {
            return Ok(None);
        };
        let used: HashSet<u32> = self
            .registry
            .applications()?
            .iter()
            .filter_map(|app| app.uid)
            .collect();

        (separation.min_user_id..=separation.max_user_id)
            .find(|uid| !used.contains(uid))
            .map(Some)
            .ok_or_else(|| {
                Error::SystemError(format!(
                    "could not find a free user id in the range {}-{}",
                    separation.min_user_id, separation.max_user_id
                ))
            })
    }
}

/// Bookkeeping every task carries
pub struct TaskBase {
    id: String,
    state: Mutex<TaskState>,
    application_id: Mutex<Option<String>>,
    context: Arc<InstallerContext>,
}

impl TaskBase {
    pub fn new(context: Arc<InstallerContext>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(TaskState::Queued),
            application_id: Mutex::new(None),
            context,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &Arc<InstallerContext> {
        &self.context
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: TaskState) {
        let mut current = lock(&self.state);
        if *current == state {
            return;
        }
        debug!("Task {}: {} -> {}", self.id, *current, state);
        *current = state;
        drop(current);
        self.context.emit(InstallerEvent::StateChanged {
            task_id: self.id.clone(),
            state,
        });
    }

    pub fn application_id(&self) -> Option<String> {
        lock(&self.application_id).clone()
    }

    pub fn set_application_id(&self, id: &str) {
        *lock(&self.application_id) = Some(id.to_string());
    }

    pub fn emit(&self, event: InstallerEvent) {
        self.context.emit(event);
    }
}

/// A unit of work run by the installer queue
pub trait Task: Send + Sync {
    fn base(&self) -> &TaskBase;

    /// Run the task to its end; the returned error becomes the failure reason
    fn execute(&self) -> Result<()>;

    /// Ask the task to stop; false once it can no longer be stopped
    fn cancel(&self) -> bool;

    /// Stop a task that has not started running
    fn force_cancel(&self);

    fn acknowledge(&self) -> bool {
        false
    }

    fn id(&self) -> &str {
        self.base().id()
    }

    fn state(&self) -> TaskState {
        self.base().state()
    }

    fn application_id(&self) -> Option<String> {
        self.base().application_id()
    }
}

/// Run `task` and publish its outcome
pub(crate) fn run_task(task: &dyn Task) -> Result<()> {
    let base = task.base();
    base.emit(InstallerEvent::Started {
        task_id: base.id().to_string(),
    });

    let result = task.execute();
    match &result {
        Ok(()) => {
            info!("Task {} finished", base.id());
            base.set_state(TaskState::Finished);
            base.emit(InstallerEvent::Finished {
                task_id: base.id().to_string(),
            });
        }
        Err(e) => {
            error!("Task {} failed: {}", base.id(), e);
            fail_task(task, e);
        }
    }
    result
}

/// Mark `task` failed with `error` and publish it
pub(crate) fn fail_task(task: &dyn Task, error: &Error) {
    let base = task.base();
    base.set_state(TaskState::Failed);
    base.emit(InstallerEvent::Failed {
        task_id: base.id().to_string(),
        kind: error.kind(),
        message: error.message().to_string(),
    });
}

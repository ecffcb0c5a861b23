//! Completion router
//!
//! Turns session events into calls to the completion targets registered by
//! the controller. A task's target hears about it exactly once: with the
//! stored file on success, or with the error on failure.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use ferry_session::{DownloadTask, SessionIdentifier, TaskId, TransferError};

use crate::completion::{AllTasksCompletionTarget, Completion, CompletionMode, CompletionTarget};
use crate::host::HostApplication;
use crate::main_queue::MainQueue;

pub struct CompletionRouter {
    mode: CompletionMode,
    shared: RwLock<Option<CompletionTarget>>,
    per_task: Mutex<HashMap<TaskId, CompletionTarget>>,
    resolved: Mutex<HashSet<TaskId>>,
    all_tasks: Arc<RwLock<Option<AllTasksCompletionTarget>>>,
    host: Arc<dyn HostApplication>,
    main_queue: MainQueue,
}

impl CompletionRouter {
    pub fn new(mode: CompletionMode, host: Arc<dyn HostApplication>) -> Self {
        Self {
            mode,
            shared: RwLock::new(None),
            per_task: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashSet::new()),
            all_tasks: Arc::new(RwLock::new(None)),
            host,
            main_queue: MainQueue::new(),
        }
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Associate a target with a task. In shared mode this replaces the
    /// single target of the service, including for tasks already running.
    pub fn register(&self, task_id: TaskId, target: CompletionTarget) {
        match self.mode {
            CompletionMode::PerTask => {
                self.per_task.lock().insert(task_id, target);
            }
            CompletionMode::Shared => {
                *self.shared.write() = Some(target);
            }
        }
    }

    /// Target for tasks that have none of their own, such as tasks
    /// reattached after a restart.
    pub fn set_shared_target(&self, target: Option<CompletionTarget>) {
        *self.shared.write() = target;
    }

    pub fn set_all_tasks_completion(&self, target: Option<AllTasksCompletionTarget>) {
        *self.all_tasks.write() = target;
    }

    fn target_for(&self, task_id: TaskId) -> Option<CompletionTarget> {
        let own = self.per_task.lock().get(&task_id).cloned();
        own.or_else(|| self.shared.read().clone())
    }

    pub fn did_finish_downloading(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        location: &Path,
    ) {
        self.resolved.lock().insert(task.id());

        match self.target_for(task.id()) {
            Some(target) => invoke(
                &target,
                task.id(),
                Completion::succeeded(location.to_path_buf(), task.original_url().clone()),
            ),
            None => tracing::debug!(
                session_id = %session,
                task_id = task.id(),
                "No completion target for finished task"
            ),
        }
    }

    pub fn did_complete(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        error: Option<&TransferError>,
    ) {
        let own = self.per_task.lock().remove(&task.id());
        let already_resolved = self.resolved.lock().remove(&task.id());

        let Some(error) = error else {
            return;
        };
        if already_resolved {
            return;
        }

        match own.or_else(|| self.shared.read().clone()) {
            Some(target) => invoke(
                &target,
                task.id(),
                Completion::failed(task.original_url().clone(), error.clone()),
            ),
            None => tracing::debug!(
                session_id = %session,
                task_id = task.id(),
                error = %error,
                "No completion target for failed task"
            ),
        }
    }

    /// Hand the host's acknowledgment back on the main queue, after the
    /// all-tasks target.
    pub fn did_finish_events(&self, session: &SessionIdentifier) {
        let host = Arc::clone(&self.host);
        let all_tasks = Arc::clone(&self.all_tasks);
        let session = session.clone();

        self.main_queue.post(Box::new(move || {
            let Some(acknowledge) = host.take_background_completion() else {
                tracing::debug!(
                    session_id = %session,
                    "Background events finished with nothing pending"
                );
                return;
            };

            let target = all_tasks.read().clone();
            if let Some(target) = target {
                if std::panic::catch_unwind(AssertUnwindSafe(|| target(&session))).is_err() {
                    tracing::error!(session_id = %session, "All-tasks completion target panicked");
                }
            }

            acknowledge();
            tracing::info!(session_id = %session, "Acknowledged background event delivery");
        }));
    }
}

fn invoke(target: &CompletionTarget, task_id: TaskId, completion: Completion) {
    let success = completion.success;
    if std::panic::catch_unwind(AssertUnwindSafe(|| target(completion))).is_err() {
        tracing::error!(task_id, success, "Completion target panicked");
    }
}

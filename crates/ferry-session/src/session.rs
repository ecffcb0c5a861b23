//! Transport session
//!
//! Owns the HTTP client, the task table and the sending half of the
//! delegate queue. Tasks keep a weak reference back; running transfers hold
//! a strong one, so a session lives at least as long as its transfers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use ferry_storage::{TaskJournal, TaskRecord, TaskRecordState};

use crate::configuration::SessionConfiguration;
use crate::delegate::{run_dispatcher, SessionDelegate, SessionEvent};
use crate::error::{SessionError, TransferError};
use crate::identifier::SessionIdentifier;
use crate::request::DownloadRequest;
use crate::resume::ResumeData;
use crate::task::{DownloadTask, TaskId};
use crate::tls::SessionTls;
use crate::transfer;
use crate::Result;

/// State shared between the session and its dispatcher.
pub(crate) struct SessionState {
    pub(crate) identifier: SessionIdentifier,
    pub(crate) outstanding: AtomicUsize,
    pub(crate) invalidated: AtomicBool,
    pub(crate) sends_launch_events: bool,
    tasks: Mutex<HashMap<TaskId, DownloadTask>>,
    journal: Option<TaskJournal>,
}

impl SessionState {
    pub(crate) fn forget_task(&self, task_id: TaskId) {
        self.tasks.lock().remove(&task_id);

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove_task(self.identifier.as_str(), task_id) {
                tracing::warn!(
                    session_id = %self.identifier,
                    task_id,
                    error = %e,
                    "Failed to journal task completion"
                );
            }
        }
    }
}

pub struct TransportSession {
    configuration: SessionConfiguration,
    client: reqwest::Client,
    tls: SessionTls,
    runtime: Handle,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<SessionState>,
    next_task_id: AtomicU64,
    this: Weak<TransportSession>,
}

impl TransportSession {
    pub(crate) fn create(
        configuration: SessionConfiguration,
        delegate: Arc<dyn SessionDelegate>,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        let tls = SessionTls::new(&configuration.root_certificates)?;
        let client = configuration.build_client(&tls)?;
        let identifier = configuration.identifier.clone();

        let mut first_task_id = 1;
        if let Some(journal) = &configuration.journal {
            if let Err(e) = journal.register_session(identifier.as_str()) {
                tracing::warn!(session_id = %identifier, error = %e, "Failed to journal session");
            }
            match journal.highest_task_id(identifier.as_str()) {
                Ok(Some(highest)) => first_task_id = highest + 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    session_id = %identifier,
                    error = %e,
                    "Failed to read journaled tasks"
                ),
            }
        }

        let state = Arc::new(SessionState {
            identifier: identifier.clone(),
            outstanding: AtomicUsize::new(0),
            invalidated: AtomicBool::new(false),
            sends_launch_events: configuration.sends_launch_events,
            tasks: Mutex::new(HashMap::new()),
            journal: configuration.journal.clone(),
        });

        let (events, receiver) = mpsc::unbounded_channel();
        runtime.spawn(run_dispatcher(Arc::clone(&state), delegate, receiver));

        let session = Arc::new_cyclic(|this| Self {
            configuration,
            client,
            tls,
            runtime,
            events,
            state,
            next_task_id: AtomicU64::new(first_task_id),
            this: this.clone(),
        });

        tracing::info!(
            session_id = %identifier,
            timeout_secs = session.configuration.request_timeout.as_secs(),
            "Created transport session"
        );

        Ok(session)
    }

    pub fn identifier(&self) -> &SessionIdentifier {
        &self.state.identifier
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.invalidated.load(Ordering::SeqCst)
    }

    /// Tasks that have not delivered their completion yet, by id.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.state.tasks.lock().values().cloned().collect();
        tasks.sort_by_key(DownloadTask::id);
        tasks
    }

    pub fn task(&self, task_id: TaskId) -> Option<DownloadTask> {
        self.state.tasks.lock().get(&task_id).cloned()
    }

    /// Create a suspended task for the request.
    pub fn download_task(&self, request: DownloadRequest) -> Result<DownloadTask> {
        self.issue(None, request, None)
    }

    /// Create a suspended task continuing a partial download.
    pub fn download_task_with_resume_data(&self, resume_data: ResumeData) -> Result<DownloadTask> {
        let request = resume_data
            .request()?
            .with_timeout(self.configuration.request_timeout);
        self.issue(None, request, Some(resume_data))
    }

    fn issue(
        &self,
        task_id: Option<TaskId>,
        request: DownloadRequest,
        resume_from: Option<ResumeData>,
    ) -> Result<DownloadTask> {
        if self.is_invalidated() {
            return Err(SessionError::Invalidated);
        }

        // Reattached tasks keep their journal row and its partial file
        let journaled = task_id.is_some();
        let task_id = task_id.unwrap_or_else(|| self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let task = DownloadTask::new(task_id, request, resume_from, self.this.clone());

        self.state.tasks.lock().insert(task_id, task.clone());

        if let Some(journal) = self.state.journal.as_ref().filter(|_| !journaled) {
            let record = TaskRecord::new(
                self.identifier().as_str(),
                task_id,
                task.original_url().to_string(),
                task.original_request().header_fields(),
            );
            if let Err(e) = journal.save_task(&record) {
                tracing::warn!(
                    session_id = %self.identifier(),
                    task_id,
                    error = %e,
                    "Failed to journal task"
                );
            }
        }

        tracing::debug!(
            session_id = %self.identifier(),
            task_id,
            url = %task.original_url(),
            "Issued download task"
        );

        Ok(task)
    }

    /// Recreate and resume tasks journaled as running under this session's
    /// identifier by an earlier process.
    pub(crate) fn reattach_journaled_tasks(&self) -> usize {
        let Some(journal) = &self.state.journal else {
            return 0;
        };

        let records = match journal.running_tasks(self.identifier().as_str()) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.identifier(),
                    error = %e,
                    "Failed to read journaled tasks"
                );
                return 0;
            }
        };

        let mut reattached = 0;
        for record in records {
            let request = match journaled_request(&record) {
                Ok(request) => request.with_timeout(self.configuration.request_timeout),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.identifier(),
                        task_id = record.task_id,
                        error = %e,
                        "Dropping unusable journaled task"
                    );
                    self.state.forget_task(record.task_id);
                    continue;
                }
            };

            let resume_from = ResumeData::from_record(&record);
            match self.issue(Some(record.task_id), request, resume_from) {
                Ok(task) => {
                    task.resume();
                    reattached += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.identifier(),
                        error = %e,
                        "Failed to reattach task"
                    );
                }
            }
        }

        if reattached > 0 {
            tracing::info!(
                session_id = %self.identifier(),
                reattached,
                "Reattached journaled tasks"
            );
        }
        reattached
    }

    pub(crate) fn start_transfer(&self, task: DownloadTask) {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);

        let session = match self.this.upgrade() {
            Some(session) if !self.is_invalidated() => session,
            _ => {
                self.emit(SessionEvent::Completed {
                    task,
                    error: Some(TransferError::cancelled()),
                });
                return;
            }
        };

        if let Some(journal) = &self.state.journal {
            if let Err(e) =
                journal.set_state(self.identifier().as_str(), task.id(), TaskRecordState::Running)
            {
                tracing::warn!(
                    session_id = %self.identifier(),
                    task_id = task.id(),
                    error = %e,
                    "Failed to journal task start"
                );
            }
        }

        self.runtime.spawn(transfer::run(session, task));
    }

    /// Deliver the cancellation of a task that never started.
    pub(crate) fn complete_unstarted(&self, task: DownloadTask) {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        self.emit(SessionEvent::Completed {
            task,
            error: Some(TransferError::cancelled()),
        });
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // A closed queue means the session is gone; dropping the event also
        // cancels any challenge it carried.
        let _ = self.events.send(event);
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn tls(&self) -> &SessionTls {
        &self.tls
    }

    pub(crate) fn journal(&self) -> Option<&TaskJournal> {
        self.state.journal.as_ref()
    }

    /// Cancel every task and tear the session down. Returns before the
    /// transfers have stopped; the delegate hears `did_become_invalid` after
    /// the last cancellation was delivered.
    pub fn invalidate_and_cancel(&self) {
        if self.state.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(journal) = &self.state.journal {
            if let Err(e) = journal.invalidate_session(self.identifier().as_str()) {
                tracing::warn!(
                    session_id = %self.identifier(),
                    error = %e,
                    "Failed to journal invalidation"
                );
            }
        }

        let tasks = self.tasks();
        let cancelled = tasks.len();
        for task in tasks {
            task.cancel();
        }

        // Queued behind the cancellations of suspended tasks above
        self.emit(SessionEvent::Invalidated);

        tracing::info!(session_id = %self.identifier(), cancelled, "Invalidated transport session");
    }
}

fn journaled_request(
    record: &TaskRecord,
) -> std::result::Result<DownloadRequest, crate::error::RequestError> {
    let mut request = DownloadRequest::new(&record.url)?;
    for (name, value) in &record.headers {
        request.insert_header(name, value)?;
    }
    Ok(request)
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("identifier", self.identifier())
            .field("invalidated", &self.is_invalidated())
            .field("outstanding", &self.state.outstanding.load(Ordering::SeqCst))
            .finish()
    }
}

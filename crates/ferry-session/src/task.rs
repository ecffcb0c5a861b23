//! Download task handles

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use url::Url;

use crate::request::DownloadRequest;
use crate::resume::ResumeData;
use crate::session::TransportSession;

/// Session-unique task number.
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created, waiting for `resume`
    Suspended,
    /// Transfer in progress
    Running,
    /// Cancel requested, completion not yet delivered
    Canceling,
    /// Completion delivered (or queued)
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Suspended => "suspended",
            TaskState::Running => "running",
            TaskState::Canceling => "canceling",
            TaskState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskControl {
    Continue,
    Cancel,
    CancelProducingResumeData,
}

struct TaskInner {
    id: TaskId,
    request: DownloadRequest,
    state: RwLock<TaskState>,
    control: watch::Sender<TaskControl>,
    bytes_received: AtomicU64,
    current_url: RwLock<Url>,
    resume_from: Mutex<Option<ResumeData>>,
    resume_data_reply: Mutex<Option<oneshot::Sender<Option<ResumeData>>>>,
    session: Weak<TransportSession>,
}

/// Handle to one transfer. Clones refer to the same task.
#[derive(Clone)]
pub struct DownloadTask {
    inner: Arc<TaskInner>,
}

impl DownloadTask {
    pub(crate) fn new(
        id: TaskId,
        request: DownloadRequest,
        resume_from: Option<ResumeData>,
        session: Weak<TransportSession>,
    ) -> Self {
        let (control, _) = watch::channel(TaskControl::Continue);
        let current_url = request.url().clone();

        Self {
            inner: Arc::new(TaskInner {
                id,
                request,
                state: RwLock::new(TaskState::Suspended),
                control,
                bytes_received: AtomicU64::new(0),
                current_url: RwLock::new(current_url),
                resume_from: Mutex::new(resume_from),
                resume_data_reply: Mutex::new(None),
                session,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn original_request(&self) -> &DownloadRequest {
        &self.inner.request
    }

    pub fn original_url(&self) -> &Url {
        self.inner.request.url()
    }

    /// URL of the response after redirects, once one arrived.
    pub fn current_url(&self) -> Url {
        self.inner.current_url.read().clone()
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.read()
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Start a suspended task. Does nothing for a task that already started.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != TaskState::Suspended {
                return;
            }
            *state = TaskState::Running;
        }

        match self.inner.session.upgrade() {
            Some(session) => session.start_transfer(self.clone()),
            None => *self.inner.state.write() = TaskState::Completed,
        }
    }

    /// Cancel the task. Its completion arrives asynchronously with a
    /// cancellation error.
    pub fn cancel(&self) {
        let previous = {
            let mut state = self.inner.state.write();
            let previous = *state;
            match previous {
                TaskState::Suspended => *state = TaskState::Completed,
                TaskState::Running => *state = TaskState::Canceling,
                TaskState::Canceling | TaskState::Completed => return,
            }
            previous
        };

        match previous {
            TaskState::Suspended => {
                if let Some(session) = self.inner.session.upgrade() {
                    session.complete_unstarted(self.clone());
                }
            }
            _ => {
                self.inner.control.send_replace(TaskControl::Cancel);
            }
        }
    }

    /// Cancel the task and hand back what is needed to continue it later.
    ///
    /// Yields `None` when nothing was received yet or the server gave no
    /// validator to resume against.
    pub async fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        let reply = {
            let mut state = self.inner.state.write();
            let current = *state;
            match current {
                TaskState::Suspended => {
                    drop(state);
                    let resume_from = self.inner.resume_from.lock().clone();
                    self.cancel();
                    return resume_from;
                }
                TaskState::Running => {
                    *state = TaskState::Canceling;
                    let (tx, rx) = oneshot::channel();
                    *self.inner.resume_data_reply.lock() = Some(tx);
                    rx
                }
                TaskState::Canceling | TaskState::Completed => return None,
            }
        };

        self.inner
            .control
            .send_replace(TaskControl::CancelProducingResumeData);
        reply.await.ok().flatten()
    }

    pub(crate) fn subscribe_control(&self) -> watch::Receiver<TaskControl> {
        self.inner.control.subscribe()
    }

    pub(crate) fn take_resume_from(&self) -> Option<ResumeData> {
        self.inner.resume_from.lock().take()
    }

    pub(crate) fn reply_resume_data(&self, data: Option<ResumeData>) {
        if let Some(reply) = self.inner.resume_data_reply.lock().take() {
            let _ = reply.send(data);
        }
    }

    pub(crate) fn set_bytes_received(&self, bytes: u64) {
        self.inner.bytes_received.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_current_url(&self, url: Url) {
        *self.inner.current_url.write() = url;
    }

    pub(crate) fn mark_completed(&self) {
        *self.inner.state.write() = TaskState::Completed;
        // Anyone still waiting for resume data gets nothing
        self.reply_resume_data(None);
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.inner.id)
            .field("url", &self.inner.request.url().as_str())
            .field("state", &self.state())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}

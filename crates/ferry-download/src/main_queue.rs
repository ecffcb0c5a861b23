//! Main-context queue
//!
//! A single Tokio task that runs posted jobs one after another, in order.
//! The worker is spawned on first use so the queue can be built outside a
//! runtime.

use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub struct MainQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl MainQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job. Without a runtime to host the worker the job runs on
    /// the calling thread.
    pub fn post(&self, job: Job) {
        let mut sender = self.sender.lock();

        if sender.as_ref().map_or(true, |s| s.is_closed()) {
            match Handle::try_current() {
                Ok(runtime) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    runtime.spawn(run_jobs(rx));
                    *sender = Some(tx);
                }
                Err(_) => {
                    drop(sender);
                    tracing::debug!("No runtime for main queue, running job inline");
                    run_job(job);
                    return;
                }
            }
        }

        let result = match sender.as_ref() {
            Some(tx) => tx.send(job),
            None => return,
        };
        drop(sender);

        if let Err(mpsc::error::SendError(job)) = result {
            run_job(job);
        }
    }
}

async fn run_jobs(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        run_job(job);
    }
}

fn run_job(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("Main queue job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let queue = MainQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            queue.post(Box::new(move || seen.lock().push(i)));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.post(Box::new(move || {
            let _ = tx.send(());
        }));
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let queue = MainQueue::new();
        queue.post(Box::new(|| panic!("job failed")));

        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.post(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(tokio::time::timeout(Duration::from_secs(5), rx).await.is_ok());
    }

    #[test]
    fn test_runs_inline_without_runtime() {
        let queue = MainQueue::new();
        let ran = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&ran);
        queue.post(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
    }
}

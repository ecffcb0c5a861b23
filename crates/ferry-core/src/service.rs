//! Background download service
//!
//! The entry point callers hold on to. Copies of a service share one
//! controller, router and session.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_download::{
    Completion, CompletionRouter, DownloadController, HostApplication, NoHost,
    TrustChallengeDelegate,
};
use ferry_session::{
    DirectoryProtection, DownloadTask, OwnerOnlyProtection, ResumeData, SessionIdentifier,
};
use ferry_storage::{Database, TaskJournal};
use ferry_trust::{DefaultTrustPolicy, TrustPolicy};

use crate::config::Config;
use crate::Result;

struct ServiceInner {
    config: Config,
    controller: DownloadController,
}

#[derive(Clone)]
pub struct BackgroundDownloadService {
    inner: Arc<ServiceInner>,
}

impl BackgroundDownloadService {
    /// A service with the default configuration, trust policy and host.
    pub fn create_instance() -> Result<Self> {
        Self::builder(Config::default()).build()
    }

    pub fn builder(config: Config) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Download `url` in the background; `on_complete` runs once with the
    /// outcome. Malformed input is ignored without calling it.
    pub fn start<F>(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        on_complete: F,
    ) -> Result<()>
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        self.inner.controller.start(url, headers, Arc::new(on_complete))?;
        Ok(())
    }

    /// Create a suspended task; `None` for malformed input.
    pub fn create_task<F>(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        on_complete: F,
    ) -> Result<Option<DownloadTask>>
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        Ok(self
            .inner
            .controller
            .create_task(url, headers, Arc::new(on_complete))?)
    }

    pub fn resume_download<F>(
        &self,
        resume_data: ResumeData,
        on_complete: F,
    ) -> Result<DownloadTask>
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        Ok(self
            .inner
            .controller
            .resume_download(resume_data, Arc::new(on_complete))?)
    }

    /// Start the session now so journaled tasks resume without waiting for
    /// the next `start`.
    pub fn reattach(&self) -> Result<()> {
        Ok(self.inner.controller.reattach()?)
    }

    /// Cancel all tasks and invalidate the session. The service accepts no
    /// work afterwards.
    pub fn cancel_all(&self) {
        self.inner.controller.cancel_all();
    }

    pub fn set_all_tasks_completion<F>(&self, target: F)
    where
        F: Fn(&SessionIdentifier) + Send + Sync + 'static,
    {
        self.inner
            .controller
            .router()
            .set_all_tasks_completion(Some(Arc::new(target)));
    }

    pub fn clear_all_tasks_completion(&self) {
        self.inner.controller.router().set_all_tasks_completion(None);
    }

    /// Fallback target for tasks without their own, such as reattached ones.
    pub fn set_completion_target<F>(&self, target: F)
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        self.inner
            .controller
            .router()
            .set_shared_target(Some(Arc::new(target)));
    }

    pub fn session_identifier(&self) -> &SessionIdentifier {
        self.inner.controller.session_identifier()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn controller(&self) -> &DownloadController {
        &self.inner.controller
    }
}

pub struct ServiceBuilder {
    config: Config,
    identifier: Option<SessionIdentifier>,
    trust_policy: Arc<dyn TrustPolicy>,
    host: Arc<dyn HostApplication>,
    protection: Option<Arc<dyn DirectoryProtection>>,
}

impl ServiceBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            identifier: None,
            trust_policy: Arc::new(DefaultTrustPolicy),
            host: Arc::new(NoHost),
            protection: Some(Arc::new(OwnerOnlyProtection)),
        }
    }

    /// Reuse an identifier from an earlier process instead of generating one.
    pub fn identifier(mut self, identifier: SessionIdentifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn trust_policy(mut self, policy: Arc<dyn TrustPolicy>) -> Self {
        self.trust_policy = policy;
        self
    }

    pub fn host(mut self, host: Arc<dyn HostApplication>) -> Self {
        self.host = host;
        self
    }

    pub fn directory_protection(
        mut self,
        protection: Option<Arc<dyn DirectoryProtection>>,
    ) -> Self {
        self.protection = protection;
        self
    }

    pub fn build(self) -> Result<BackgroundDownloadService> {
        let identifier = self
            .identifier
            .unwrap_or_else(|| SessionIdentifier::generate(&self.config.identifier_prefix));

        let mut configuration = self.config.session_configuration(identifier);

        if let Some(path) = &self.config.journal_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let journal = TaskJournal::new(Database::open(path)?);
            configuration = configuration.with_journal(journal);
        }

        let router = Arc::new(CompletionRouter::new(self.config.completion_mode, self.host));
        let mut controller = DownloadController::new(
            configuration,
            router,
            TrustChallengeDelegate::new(self.trust_policy),
        );
        if let Some(protection) = self.protection {
            controller = controller.with_directory_protection(protection);
        }

        tracing::info!(
            session_id = %controller.session_identifier(),
            cache_dir = %self.config.transfer_cache_dir().display(),
            mode = ?self.config.completion_mode,
            "Background download service ready"
        );

        Ok(BackgroundDownloadService {
            inner: Arc::new(ServiceInner {
                config: self.config,
                controller,
            }),
        })
    }
}

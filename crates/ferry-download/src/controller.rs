//! Download task controller
//!
//! Turns caller requests into session tasks and records where each task's
//! outcome should go.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_session::{
    DirectoryProtection, DownloadRequest, DownloadTask, ResumeData, SessionConfiguration,
    SessionIdentifier, SessionManager,
};

use crate::completion::CompletionTarget;
use crate::delegate::ServiceDelegate;
use crate::router::CompletionRouter;
use crate::trust::TrustChallengeDelegate;
use crate::Result;

pub struct DownloadController {
    sessions: SessionManager,
    router: Arc<CompletionRouter>,
}

impl DownloadController {
    pub fn new(
        configuration: SessionConfiguration,
        router: Arc<CompletionRouter>,
        trust: TrustChallengeDelegate,
    ) -> Self {
        let delegate = Arc::new(ServiceDelegate::new(Arc::clone(&router), trust));

        Self {
            sessions: SessionManager::new(configuration, delegate),
            router,
        }
    }

    pub fn with_directory_protection(mut self, protection: Arc<dyn DirectoryProtection>) -> Self {
        self.sessions = self.sessions.with_directory_protection(protection);
        self
    }

    /// Download `url` in the background and report to `on_complete`.
    ///
    /// A URL or header that cannot form a request is ignored: no task is
    /// created and `on_complete` is never called.
    pub fn start(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        on_complete: CompletionTarget,
    ) -> Result<()> {
        if let Some(task) = self.create_task(url, headers, on_complete)? {
            task.resume();
        }
        Ok(())
    }

    /// Like [`start`](Self::start) but leaves the task suspended.
    pub fn create_task(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        on_complete: CompletionTarget,
    ) -> Result<Option<DownloadTask>> {
        let request = match DownloadRequest::parse(url, headers) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Ignoring malformed download request");
                return Ok(None);
            }
        };

        let session = self.sessions.get_or_create_session()?;
        let request = request.with_timeout(session.configuration().request_timeout);
        let task = session.download_task(request)?;
        self.router.register(task.id(), on_complete);

        tracing::info!(
            session_id = %session.identifier(),
            task_id = task.id(),
            url = %task.original_url(),
            "Submitted download"
        );

        Ok(Some(task))
    }

    /// Continue a download from data produced by a cancelled or failed task.
    pub fn resume_download(
        &self,
        resume_data: ResumeData,
        on_complete: CompletionTarget,
    ) -> Result<DownloadTask> {
        let session = self.sessions.get_or_create_session()?;
        let task = session.download_task_with_resume_data(resume_data)?;
        self.router.register(task.id(), on_complete);
        task.resume();

        tracing::info!(
            session_id = %session.identifier(),
            task_id = task.id(),
            "Resumed download"
        );

        Ok(task)
    }

    /// Create the session now instead of on first use, so tasks journaled
    /// by an earlier process start again right away.
    pub fn reattach(&self) -> Result<()> {
        self.sessions.get_or_create_session()?;
        Ok(())
    }

    /// Cancel everything and invalidate the session. Returns immediately;
    /// cancelled tasks report through their targets.
    pub fn cancel_all(&self) {
        self.sessions.invalidate_and_cancel();
    }

    pub fn session_identifier(&self) -> &SessionIdentifier {
        self.sessions.session_identifier()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<CompletionRouter> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, CompletionMode};
    use crate::error::DownloadError;
    use crate::host::NoHost;
    use ferry_session::{SessionError, TransferError};
    use ferry_trust::PinnedCertificates;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Recorded {
        completion: Completion,
        body: Option<Vec<u8>>,
    }

    fn controller(cache_dir: &Path, mode: CompletionMode) -> DownloadController {
        let configuration = SessionConfiguration::background(
            SessionIdentifier::generate("ferry.test"),
            cache_dir.to_path_buf(),
        );
        let router = Arc::new(CompletionRouter::new(mode, Arc::new(NoHost)));
        DownloadController::new(configuration, router, TrustChallengeDelegate::default())
    }

    fn recording() -> (CompletionTarget, Arc<Mutex<Vec<Recorded>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let target: CompletionTarget = Arc::new(move |completion: Completion| {
            let body = completion
                .location
                .as_ref()
                .map(|location| std::fs::read(location).unwrap());
            sink.lock().push(Recorded { completion, body });
        });
        (target, seen)
    }

    async fn wait_for_count(seen: &Mutex<Vec<Recorded>>, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("completion target was not invoked");
    }

    #[tokio::test]
    async fn test_start_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        let url = format!("{}/file.bin", server.uri());
        controller.start(&url, None, target).unwrap();
        wait_for_count(&seen, 1).await;

        // Give a stray second invocation a chance to show up
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].completion.success);
        assert_eq!(seen[0].completion.url.as_ref().map(|u| u.as_str()), Some(url.as_str()));
        assert!(seen[0].completion.error.is_none());
        assert_eq!(seen[0].body.as_deref(), Some(&b"payload"[..]));
        assert!(!seen[0].completion.location.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_malformed_url_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        controller.start("not a url", None, target.clone()).unwrap();
        assert!(controller
            .create_task("://missing-scheme", None, target)
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        controller
            .start("http://127.0.0.1:1/file.bin", None, target)
            .unwrap();
        wait_for_count(&seen, 1).await;

        let seen = seen.lock();
        let completion = &seen[0].completion;
        assert!(!completion.success);
        assert!(completion.location.is_none());
        assert_eq!(
            completion.url.as_ref().map(|u| u.as_str()),
            Some("http://127.0.0.1:1/file.bin")
        );
        assert!(matches!(completion.error, Some(TransferError::Network { .. })));
    }

    #[tokio::test]
    async fn test_headers_sent_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-request-id", "abc-123"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        let mut headers = HashMap::new();
        headers.insert("X-Request-Id".to_string(), "abc-123".to_string());
        headers.insert("Authorization".to_string(), "Bearer token".to_string());

        controller
            .start(&format!("{}/h", server.uri()), Some(&headers), target)
            .unwrap();
        wait_for_count(&seen, 1).await;
        assert!(seen.lock()[0].completion.success);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_create_task_waits_for_resume() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"later".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        let task = controller
            .create_task(&format!("{}/later", server.uri()), None, target)
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(seen.lock().is_empty());

        task.resume();
        wait_for_count(&seen, 1).await;
        assert_eq!(seen.lock()[0].body.as_deref(), Some(&b"later"[..]));
    }

    #[tokio::test]
    async fn test_dropped_task_handle_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        let task = controller
            .create_task("https://example.com/file.bin", None, target)
            .unwrap()
            .unwrap();
        let task_id = task.id();
        drop(task);

        // The session keeps the task, so it can be found and cancelled later
        let session = controller.sessions().get_or_create_session().unwrap();
        let kept = session.task(task_id).unwrap();
        kept.cancel();

        wait_for_count(&seen, 1).await;
        assert_eq!(
            seen.lock()[0].completion.error,
            Some(TransferError::Cancelled { resume_data: None })
        );
    }

    #[tokio::test]
    async fn test_cancel_all_then_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), CompletionMode::PerTask);
        let (target, seen) = recording();

        let task = controller
            .create_task("https://example.com/file.bin", None, target.clone())
            .unwrap()
            .unwrap();
        controller.cancel_all();

        wait_for_count(&seen, 1).await;
        assert_eq!(
            seen.lock()[0].completion.error,
            Some(TransferError::Cancelled { resume_data: None })
        );
        assert_eq!(task.state(), ferry_session::TaskState::Completed);

        let result = controller.start("https://example.com/other.bin", None, target);
        assert!(matches!(
            result,
            Err(DownloadError::Session(SessionError::Invalidated))
        ));
    }

    /// HTTPS server with a self-signed `localhost` certificate that records
    /// the HTTP requests it reads.
    struct TlsServer {
        port: u16,
        certificate: Vec<u8>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    async fn tls_server(body: &'static [u8]) -> TlsServer {
        use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate = cert.der().to_vec();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(certificate.clone())], key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(tcp).await else {
                        return;
                    };

                    let mut raw = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => raw.extend_from_slice(&buf[..n]),
                        }
                    }
                    seen.lock().push(String::from_utf8_lossy(&raw).to_string());

                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        TlsServer {
            port,
            certificate,
            requests,
        }
    }

    fn pinned_controller(
        cache_dir: &Path,
        server: &TlsServer,
        pins: PinnedCertificates,
    ) -> DownloadController {
        let configuration = SessionConfiguration::background(
            SessionIdentifier::generate("ferry.test"),
            cache_dir.to_path_buf(),
        )
        .with_root_certificate(server.certificate.clone());
        let router = Arc::new(CompletionRouter::new(CompletionMode::PerTask, Arc::new(NoHost)));
        DownloadController::new(
            configuration,
            router,
            TrustChallengeDelegate::new(Arc::new(pins)),
        )
    }

    #[tokio::test]
    async fn test_wrong_pin_rejects_before_request_is_sent() {
        let server = tls_server(b"secret").await;

        let mut pins = PinnedCertificates::new();
        pins.add_certificate("localhost", b"some other certificate")
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let controller = pinned_controller(dir.path(), &server, pins);
        let (target, seen) = recording();

        let url = format!("https://localhost:{}/file.bin", server.port);
        controller.start(&url, None, target).unwrap();
        wait_for_count(&seen, 1).await;

        {
            let seen = seen.lock();
            assert!(!seen[0].completion.success);
            assert_eq!(
                seen[0].completion.error,
                Some(TransferError::TrustRejected("localhost".to_string()))
            );
        }
        assert!(server.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_matching_pin_downloads() {
        let server = tls_server(b"pinned payload").await;

        let mut pins = PinnedCertificates::new();
        pins.add_certificate("localhost", &server.certificate).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let controller = pinned_controller(dir.path(), &server, pins);
        let (target, seen) = recording();

        let url = format!("https://localhost:{}/file.bin", server.port);
        controller.start(&url, None, target).unwrap();
        wait_for_count(&seen, 1).await;

        let seen = seen.lock();
        assert!(seen[0].completion.success, "{:?}", seen[0].completion.error);
        assert_eq!(seen[0].body.as_deref(), Some(&b"pinned payload"[..]));
        assert_eq!(server.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_download_requests_remaining_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"tail".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("partial.download");
        std::fs::write(&partial, b"head").unwrap();

        let controller = controller(&dir.path().join("cache"), CompletionMode::PerTask);
        let (target, seen) = recording();

        let resume_data = ResumeData {
            url: url::Url::parse(&format!("{}/file.bin", server.uri())).unwrap(),
            headers: Default::default(),
            partial_path: partial,
            bytes_received: 4,
            etag: None,
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
        };
        controller.resume_download(resume_data, target).unwrap();

        wait_for_count(&seen, 1).await;
        assert_eq!(seen.lock()[0].body.as_deref(), Some(&b"headtail"[..]));
    }
}

//! Transfer runner
//!
//! Drives one task from request to stored file: negotiates trust and
//! authentication challenges through the delegate, resumes against a
//! validator when a partial file exists, streams the body to disk and
//! reports the outcome on the session queue.

use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, AUTHORIZATION, COOKIE, ETAG, IF_RANGE, LAST_MODIFIED, LOCATION,
    PROXY_AUTHORIZATION, RANGE, WWW_AUTHENTICATE,
};
use reqwest::{Response, StatusCode};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use url::Url;

use ferry_trust::{Challenge, ChallengeCompletion, ChallengeDisposition, Credential};

use crate::delegate::SessionEvent;
use crate::error::TransferError;
use crate::resume::ResumeData;
use crate::session::TransportSession;
use crate::task::{DownloadTask, TaskControl};

pub(crate) async fn run(session: Arc<TransportSession>, task: DownloadTask) {
    let mut control = task.subscribe_control();

    tracing::debug!(
        session_id = %session.identifier(),
        task_id = task.id(),
        url = %task.original_url(),
        "Transfer started"
    );

    match execute(&session, &task, &mut control).await {
        Ok(location) => {
            tracing::info!(
                session_id = %session.identifier(),
                task_id = task.id(),
                bytes = task.bytes_received(),
                "Download finished"
            );
            session.emit(SessionEvent::FinishedDownloading {
                task: task.clone(),
                location,
            });
            session.emit(SessionEvent::Completed { task, error: None });
        }
        Err(error) => {
            if error.is_cancelled() {
                tracing::info!(
                    session_id = %session.identifier(),
                    task_id = task.id(),
                    "Download cancelled"
                );
            } else {
                tracing::warn!(
                    session_id = %session.identifier(),
                    task_id = task.id(),
                    error = %error,
                    "Download failed"
                );
            }
            task.reply_resume_data(error.resume_data().cloned());
            session.emit(SessionEvent::Completed {
                task,
                error: Some(error),
            });
        }
    }
}

/// Byte offset and validators of a partial file being continued.
struct ResumePoint {
    offset: u64,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl ResumePoint {
    fn validator(&self) -> &str {
        self.etag
            .as_deref()
            .or(self.last_modified.as_deref())
            .unwrap_or_default()
    }
}

/// Bookkeeping for the file the body is written to.
struct PartialBody {
    path: PathBuf,
    url: Url,
    headers: BTreeMap<String, String>,
    received: u64,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl PartialBody {
    fn resume_data(&self) -> Option<ResumeData> {
        if self.received == 0 || (self.etag.is_none() && self.last_modified.is_none()) {
            return None;
        }

        Some(ResumeData {
            url: self.url.clone(),
            headers: self.headers.clone(),
            partial_path: self.path.clone(),
            bytes_received: self.received,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        })
    }

    /// Keep the file when it can be resumed, remove it otherwise.
    async fn settle(self) -> Option<ResumeData> {
        let resume_data = self.resume_data();
        if resume_data.is_none() {
            discard(&self.path).await;
        }
        resume_data
    }
}

async fn execute(
    session: &TransportSession,
    task: &DownloadTask,
    control: &mut watch::Receiver<TaskControl>,
) -> Result<PathBuf, TransferError> {
    let request = task.original_request();
    let dir = session.configuration().session_dir();
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}.download", task.id()));

    let resume = prepare_resume(task.take_resume_from(), &path).await;

    let negotiated = negotiate(session, task, control, resume.as_ref()).await;
    let response = match negotiated {
        Ok(response) => response,
        Err(error) => {
            let interrupted = *control.borrow();
            return Err(settle_before_body(error, resume, &path, task, interrupted).await);
        }
    };

    let mut offset = resume.as_ref().map(|point| point.offset).unwrap_or(0);
    if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
        tracing::debug!(
            session_id = %session.identifier(),
            task_id = task.id(),
            status = response.status().as_u16(),
            "Server ignored range, restarting from zero"
        );
        offset = 0;
    }

    let etag = header_string(response.headers(), ETAG);
    let last_modified = header_string(response.headers(), LAST_MODIFIED);

    if let Some(journal) = session.journal() {
        if let Err(e) = journal.set_partial(
            session.identifier().as_str(),
            task.id(),
            &path.to_string_lossy(),
            etag.as_deref(),
            last_modified.as_deref(),
        ) {
            tracing::warn!(task_id = task.id(), error = %e, "Failed to journal partial download");
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true);
    if offset > 0 {
        options.append(true);
    } else {
        options.truncate(true);
    }
    let mut file = options.open(&path).await?;

    let mut body = PartialBody {
        path: path.clone(),
        url: task.original_url().clone(),
        headers: request.header_fields(),
        received: offset,
        etag,
        last_modified,
    };
    task.set_bytes_received(offset);
    let mut checkpoint = offset;
    if offset > 0 {
        journal_progress(session, task, offset);
    }

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::time::timeout(request.timeout(), stream.next());
        let next = match interruptible(control, chunk).await {
            Ok(next) => next,
            Err(TaskControl::CancelProducingResumeData) => {
                let _ = file.flush().await;
                drop(file);
                return Err(TransferError::Cancelled {
                    resume_data: body.settle().await,
                });
            }
            Err(_) => {
                drop(file);
                discard(&body.path).await;
                return Err(TransferError::cancelled());
            }
        };

        match next {
            Err(_elapsed) => {
                let _ = file.flush().await;
                drop(file);
                return Err(TransferError::TimedOut {
                    resume_data: body.settle().await,
                });
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = file.flush().await;
                drop(file);
                return Err(network_error(&e, body.settle().await));
            }
            Ok(Some(Ok(chunk))) => {
                if let Err(e) = file.write_all(&chunk).await {
                    drop(file);
                    discard(&body.path).await;
                    return Err(e.into());
                }
                body.received += chunk.len() as u64;
                task.set_bytes_received(body.received);

                if body.received - checkpoint >= JOURNAL_CHECKPOINT_BYTES {
                    checkpoint = body.received;
                    journal_progress(session, task, checkpoint);
                }
            }
        }
    }

    file.flush().await?;
    Ok(path)
}

/// Progress is written to the journal at most once per this many bytes.
const JOURNAL_CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;

fn journal_progress(session: &TransportSession, task: &DownloadTask, bytes: u64) {
    let Some(journal) = session.journal() else {
        return;
    };
    if let Err(e) = journal.set_bytes_received(session.identifier().as_str(), task.id(), bytes) {
        tracing::warn!(task_id = task.id(), error = %e, "Failed to journal download progress");
    }
}

/// Move a previous partial file into this task's slot and work out where
/// to continue from.
async fn prepare_resume(resume_from: Option<ResumeData>, path: &Path) -> Option<ResumePoint> {
    let data = resume_from?;

    if data.validator().is_none() {
        return None;
    }

    if data.partial_path != path {
        if let Err(e) = tokio::fs::rename(&data.partial_path, path).await {
            tracing::debug!(
                partial = %data.partial_path.display(),
                error = %e,
                "Partial download unavailable, starting over"
            );
            return None;
        }
    }

    let offset = tokio::fs::metadata(path).await.ok()?.len();
    if offset == 0 {
        return None;
    }

    Some(ResumePoint {
        offset,
        etag: data.etag,
        last_modified: data.last_modified,
    })
}

/// A transfer that failed before its body arrived still owns the partial
/// file it was resuming; keep it for retryable failures.
async fn settle_before_body(
    error: TransferError,
    resume: Option<ResumePoint>,
    path: &Path,
    task: &DownloadTask,
    interrupted: TaskControl,
) -> TransferError {
    let Some(point) = resume else {
        return error;
    };

    let keep = match &error {
        TransferError::Network { .. } | TransferError::TimedOut { .. } => true,
        TransferError::Cancelled { .. } => interrupted == TaskControl::CancelProducingResumeData,
        _ => false,
    };

    if !keep {
        discard(path).await;
        return error;
    }

    let resume_data = Some(ResumeData {
        url: task.original_url().clone(),
        headers: task.original_request().header_fields(),
        partial_path: path.to_path_buf(),
        bytes_received: point.offset,
        etag: point.etag,
        last_modified: point.last_modified,
    });

    match error {
        TransferError::Network { message, .. } => TransferError::Network {
            message,
            resume_data,
        },
        TransferError::TimedOut { .. } => TransferError::TimedOut { resume_data },
        _ => TransferError::Cancelled { resume_data },
    }
}

/// Send the request until a final response arrives, answering trust and
/// authentication challenges and following redirects along the way.
async fn negotiate(
    session: &TransportSession,
    task: &DownloadTask,
    control: &mut watch::Receiver<TaskControl>,
    resume: Option<&ResumePoint>,
) -> Result<Response, TransferError> {
    let request = task.original_request();
    let mut url = request.url().clone();
    let mut headers = request.outgoing_headers();
    let mut credential: Option<Credential> = None;
    let mut auth_failures = 0u32;
    let mut redirects = 0usize;
    let mut evaluated: HashSet<(String, u16)> = HashSet::new();

    loop {
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(0);

        if url.scheme() == "https" && evaluated.insert((host.clone(), port)) {
            evaluate_server_trust(session, task, control, &host, port).await?;
        }

        let mut builder = session.client().get(url.clone()).headers(headers.clone());

        if let Some(point) = resume {
            builder = builder
                .header(RANGE, format!("bytes={}-", point.offset))
                .header(IF_RANGE, point.validator());
        }

        builder = match &credential {
            Some(Credential::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credential::Bearer { token }) => builder.bearer_auth(token),
            _ => builder,
        };

        let sent = tokio::time::timeout(request.timeout(), builder.send());
        let response = match interruptible(control, sent).await {
            Err(_) => return Err(TransferError::cancelled()),
            Ok(Err(_elapsed)) => return Err(TransferError::TimedOut { resume_data: None }),
            Ok(Ok(Err(e))) => return Err(network_error(&e, None)),
            Ok(Ok(Ok(response))) => response,
        };

        task.set_current_url(response.url().clone());

        if response.status().is_redirection() {
            if let Some(next) = redirect_target(&url, response.headers()) {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(TransferError::Network {
                        message: format!("Too many redirects starting at {}", request.url()),
                        resume_data: None,
                    });
                }

                if next.origin() != url.origin() {
                    // Credentials stay with the origin they were meant for
                    strip_credentials(&mut headers);
                    credential = None;
                    auth_failures = 0;
                }

                tracing::debug!(
                    session_id = %session.identifier(),
                    task_id = task.id(),
                    status = response.status().as_u16(),
                    location = %next,
                    "Following redirect"
                );
                url = next;
                continue;
            }
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            let (scheme, realm) = parse_authenticate(response.headers());
            let challenge = Challenge::HttpAuthentication {
                host: host.clone(),
                port,
                scheme,
                realm,
                previous_failure_count: auth_failures,
            };

            match ask(session, task, challenge, control).await? {
                ChallengeDisposition::UseCredential(
                    answer @ (Credential::Basic { .. } | Credential::Bearer { .. }),
                ) => {
                    credential = Some(answer);
                    auth_failures += 1;
                    continue;
                }
                ChallengeDisposition::Cancel => {
                    return Err(TransferError::AuthenticationRejected(host))
                }
                _ => {}
            }
        }

        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }

        return Ok(response);
    }
}

/// Learn the host's leaf certificate over a bare handshake and let the
/// delegate decide on it. Approved leaves are the only ones the HTTP client
/// will complete a handshake with.
async fn evaluate_server_trust(
    session: &TransportSession,
    task: &DownloadTask,
    control: &mut watch::Receiver<TaskControl>,
    host: &str,
    port: u16,
) -> Result<(), TransferError> {
    let inspect = session.tls().peer_leaf_certificate(
        host,
        port,
        session.configuration().connect_timeout,
    );
    let inspected =
        interruptible(control, tokio::time::timeout(task.original_request().timeout(), inspect))
            .await;

    let leaf_certificate = match inspected {
        Err(_) => return Err(TransferError::cancelled()),
        Ok(Err(_elapsed)) => return Err(TransferError::TimedOut { resume_data: None }),
        Ok(Ok(Err(e))) => {
            return Err(TransferError::Network {
                message: format!("TLS handshake with {} failed: {}", host, e),
                resume_data: None,
            })
        }
        Ok(Ok(Ok(leaf))) => leaf,
    };

    let challenge = Challenge::ServerTrust {
        host: host.to_string(),
        port,
        leaf_certificate: leaf_certificate.clone(),
    };

    let disposition = ask(session, task, challenge, control).await?;
    if disposition == ChallengeDisposition::Cancel {
        return Err(TransferError::TrustRejected(host.to_string()));
    }

    if let Some(leaf) = &leaf_certificate {
        session.tls().approvals().approve(host, leaf);
    }
    tracing::debug!(
        session_id = %session.identifier(),
        task_id = task.id(),
        host = %host,
        disposition = disposition.as_str(),
        "Server trust accepted"
    );
    Ok(())
}

const MAX_REDIRECTS: usize = 10;

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

fn strip_credentials(headers: &mut HeaderMap) {
    headers.remove(AUTHORIZATION);
    headers.remove(COOKIE);
    headers.remove(PROXY_AUTHORIZATION);
}

/// Hand a challenge to the delegate and wait for its answer. A dropped
/// completion counts as a cancel.
async fn ask(
    session: &TransportSession,
    task: &DownloadTask,
    challenge: Challenge,
    control: &mut watch::Receiver<TaskControl>,
) -> Result<ChallengeDisposition, TransferError> {
    let (completion, answer) = ChallengeCompletion::channel();
    session.emit(SessionEvent::Challenge {
        task: task.clone(),
        challenge,
        completion,
    });

    match interruptible(control, answer).await {
        Err(_) => Err(TransferError::cancelled()),
        Ok(Ok(disposition)) => Ok(disposition),
        Ok(Err(_)) => Ok(ChallengeDisposition::Cancel),
    }
}

/// Run `future` unless the task is told to stop first.
async fn interruptible<F>(
    control: &mut watch::Receiver<TaskControl>,
    future: F,
) -> Result<F::Output, TaskControl>
where
    F: Future,
{
    tokio::pin!(future);

    loop {
        let current = *control.borrow_and_update();
        if current != TaskControl::Continue {
            return Err(current);
        }

        tokio::select! {
            output = &mut future => return Ok(output),
            changed = control.changed() => {
                if changed.is_err() {
                    // Control sender gone; nobody can cancel any more
                    return Ok(future.await);
                }
            }
        }
    }
}

fn network_error(error: &reqwest::Error, resume_data: Option<ResumeData>) -> TransferError {
    if error.is_timeout() {
        return TransferError::TimedOut { resume_data };
    }

    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }

    TransferError::Network {
        message,
        resume_data,
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Scheme and realm of the first `WWW-Authenticate` challenge.
fn parse_authenticate(headers: &HeaderMap) -> (String, Option<String>) {
    let Some(value) = header_string(headers, WWW_AUTHENTICATE) else {
        return ("Basic".to_string(), None);
    };

    let value = value.trim();
    let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));

    let realm = params.split(',').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("realm")
            .then(|| value.trim().trim_matches('"').to_string())
    });

    (scheme.to_string(), realm)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(
                path = %path.display(),
                error = %e,
                "Failed to remove partial download"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_authenticate() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"files\", charset=\"UTF-8\""),
        );
        assert_eq!(
            parse_authenticate(&headers),
            ("Basic".to_string(), Some("files".to_string()))
        );

        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        assert_eq!(parse_authenticate(&headers), ("Bearer".to_string(), None));

        assert_eq!(
            parse_authenticate(&HeaderMap::new()),
            ("Basic".to_string(), None)
        );
    }

    #[test]
    fn test_redirect_target_resolves_location() {
        let current = Url::parse("https://example.com/files/a.bin").unwrap();
        let mut headers = HeaderMap::new();
        assert!(redirect_target(&current, &headers).is_none());

        headers.insert(LOCATION, HeaderValue::from_static("../mirror/a.bin"));
        assert_eq!(
            redirect_target(&current, &headers).unwrap().as_str(),
            "https://example.com/mirror/a.bin"
        );

        headers.insert(LOCATION, HeaderValue::from_static("ftp://example.com/a.bin"));
        assert!(redirect_target(&current, &headers).is_none());
    }

    #[test]
    fn test_strip_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        headers.insert(COOKIE, HeaderValue::from_static("session=1"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        strip_credentials(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_interruptible_stops_on_cancel() {
        let (tx, mut rx) = watch::channel(TaskControl::Continue);

        let output = interruptible(&mut rx, async { 7 }).await;
        assert_eq!(output, Ok(7));

        tx.send_replace(TaskControl::CancelProducingResumeData);
        let output = interruptible(&mut rx, std::future::pending::<()>()).await;
        assert_eq!(output, Err(TaskControl::CancelProducingResumeData));
    }

    #[tokio::test]
    async fn test_prepare_resume_requires_validator() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("old.download");
        let path = dir.path().join("2.download");
        std::fs::write(&partial, b"hello").unwrap();

        let mut data = ResumeData {
            url: Url::parse("https://example.com/file.bin").unwrap(),
            headers: Default::default(),
            partial_path: partial.clone(),
            bytes_received: 5,
            etag: None,
            last_modified: None,
        };
        assert!(prepare_resume(Some(data.clone()), &path).await.is_none());

        data.etag = Some("\"v1\"".to_string());
        let point = prepare_resume(Some(data), &path).await.unwrap();
        assert_eq!(point.offset, 5);
        assert_eq!(point.validator(), "\"v1\"");
        assert!(path.exists());
        assert!(!partial.exists());
    }
}

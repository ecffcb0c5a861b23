//! Download requests

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, PRAGMA};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

use crate::configuration::DEFAULT_TIMEOUT;
use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Ask every cache on the path to revalidate
    #[default]
    ReloadIgnoringCacheData,
    /// Send no cache directives
    UseProtocolCachePolicy,
}

/// A validated GET request. Construction fails instead of producing a
/// request the transport could not send.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    cache_policy: CachePolicy,
}

impl DownloadRequest {
    pub fn new(url: &str) -> Result<Self, RequestError> {
        let url = Url::parse(url.trim()).map_err(|_| RequestError::InvalidUrl(url.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(RequestError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none() {
            return Err(RequestError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            url,
            headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
            cache_policy: CachePolicy::default(),
        })
    }

    /// Build a request from a URL string and an optional caller header map.
    /// A missing map means no extra headers.
    pub fn parse(
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<Self, RequestError> {
        let mut request = Self::new(url)?;
        if let Some(headers) = headers {
            for (name, value) in headers {
                request.insert_header(name, value)?;
            }
        }
        Ok(request)
    }

    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), RequestError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RequestError::InvalidHeader(name.to_string()))?;
        let header_value =
            HeaderValue::from_str(value)
                .map_err(|_| RequestError::InvalidHeader(name.to_string()))?;

        self.headers.insert(header_name, header_value);
        Ok(())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Headers supplied by the caller, verbatim.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Caller headers as strings, for the journal and resume data.
    pub fn header_fields(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }

    /// What goes on the wire: caller headers plus cache directives the
    /// caller did not set itself.
    pub(crate) fn outgoing_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();

        if self.cache_policy == CachePolicy::ReloadIgnoringCacheData {
            if !headers.contains_key(CACHE_CONTROL) {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
            if !headers.contains_key(PRAGMA) {
                headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            }
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_url() {
        let request = DownloadRequest::new("https://example.com/file.bin").unwrap();
        assert_eq!(request.url().as_str(), "https://example.com/file.bin");
        assert!(request.headers().is_empty());
        assert_eq!(request.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_malformed_urls_rejected() {
        assert!(matches!(
            DownloadRequest::new("not a url"),
            Err(RequestError::InvalidUrl(_))
        ));
        assert!(matches!(
            DownloadRequest::new("/relative/path"),
            Err(RequestError::InvalidUrl(_))
        ));
        assert!(matches!(
            DownloadRequest::new("ftp://example.com/file"),
            Err(RequestError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_headers_verbatim() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        headers.insert("X-Client".to_string(), "ferry".to_string());

        let request = DownloadRequest::parse("https://example.com/a", Some(&headers)).unwrap();
        let fields = request.header_fields();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("authorization").map(String::as_str), Some("Bearer abc"));
        assert_eq!(fields.get("x-client").map(String::as_str), Some("ferry"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("Bad Header".to_string(), "x".to_string());

        assert!(matches!(
            DownloadRequest::parse("https://example.com/a", Some(&headers)),
            Err(RequestError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_cache_directives_do_not_override_caller() {
        let mut headers = HashMap::new();
        headers.insert("Cache-Control".to_string(), "max-age=0".to_string());

        let request = DownloadRequest::parse("https://example.com/a", Some(&headers)).unwrap();
        let outgoing = request.outgoing_headers();

        assert_eq!(outgoing.get(CACHE_CONTROL).unwrap(), "max-age=0");
        assert_eq!(outgoing.get(PRAGMA).unwrap(), "no-cache");

        let plain = DownloadRequest::new("https://example.com/a")
            .unwrap()
            .with_cache_policy(CachePolicy::UseProtocolCachePolicy);
        assert!(plain.outgoing_headers().is_empty());
    }
}

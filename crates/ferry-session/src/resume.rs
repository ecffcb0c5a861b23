//! Resume data
//!
//! Everything needed to continue a partially received download: where the
//! bytes so far live and which validator the server attached to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

use ferry_storage::TaskRecord;

use crate::error::RequestError;
use crate::request::DownloadRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub partial_path: PathBuf,
    pub bytes_received: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResumeData {
    /// The `If-Range` value: the entity tag when the server sent one,
    /// otherwise the modification date.
    pub fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub(crate) fn request(&self) -> Result<DownloadRequest, RequestError> {
        let mut request = DownloadRequest::new(self.url.as_str())?;
        for (name, value) in &self.headers {
            request.insert_header(name, value)?;
        }
        Ok(request)
    }

    /// Resume data for a journaled task, if it left a usable partial file.
    pub(crate) fn from_record(record: &TaskRecord) -> Option<Self> {
        let partial_path = PathBuf::from(record.partial_path.as_ref()?);
        if record.etag.is_none() && record.last_modified.is_none() {
            return None;
        }

        let bytes_received = std::fs::metadata(&partial_path).ok()?.len();
        if bytes_received == 0 {
            return None;
        }

        Some(Self {
            url: Url::parse(&record.url).ok()?,
            headers: record.headers.clone(),
            partial_path,
            bytes_received,
            etag: record.etag.clone(),
            last_modified: record.last_modified.clone(),
        })
    }
}

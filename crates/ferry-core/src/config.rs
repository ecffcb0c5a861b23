//! Service configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_download::CompletionMode;
use ferry_session::{SessionConfiguration, SessionIdentifier, DEFAULT_IDENTIFIER_PREFIX};

use crate::error::CoreError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-user library directory; transfer caches live under `Caches/`
    pub library_dir: PathBuf,
    /// Names this application's cache directory
    pub bundle_identifier: String,
    /// Prefix of generated session identifiers
    pub identifier_prefix: String,
    /// Idle timeout per request
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub sends_launch_events: bool,
    pub extended_background_idle_mode: bool,
    pub completion_mode: CompletionMode,
    /// Task journal database; without one, tasks do not survive a restart
    pub journal_path: Option<PathBuf>,
}

impl Config {
    pub fn new(library_dir: PathBuf) -> Self {
        Self {
            library_dir,
            bundle_identifier: "com.ferry.app".to_string(),
            identifier_prefix: DEFAULT_IDENTIFIER_PREFIX.to_string(),
            request_timeout_secs: 60 * 10,
            connect_timeout_secs: 60,
            sends_launch_events: true,
            extended_background_idle_mode: true,
            completion_mode: CompletionMode::default(),
            journal_path: None,
        }
    }

    pub fn library_dir() -> PathBuf {
        dirs::library_dir().unwrap_or_else(|| PathBuf::from(".ferry"))
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&contents)?;

        if config.bundle_identifier.trim().is_empty() {
            return Err(CoreError::Config("bundle_identifier is empty".to_string()));
        }

        Ok(config)
    }

    /// `<library>/Caches/ferry.transferd/Downloads/<bundle id>`
    pub fn transfer_cache_dir(&self) -> PathBuf {
        self.library_dir
            .join("Caches")
            .join("ferry.transferd")
            .join("Downloads")
            .join(&self.bundle_identifier)
    }

    pub fn session_configuration(&self, identifier: SessionIdentifier) -> SessionConfiguration {
        let mut configuration =
            SessionConfiguration::background(identifier, self.transfer_cache_dir())
                .with_request_timeout(Duration::from_secs(self.request_timeout_secs));
        configuration.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        configuration.sends_launch_events = self.sends_launch_events;
        configuration.extended_background_idle_mode = self.extended_background_idle_mode;
        configuration
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::library_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn library_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

//! Certificate pinning
//!
//! Pins are lowercase hex SHA-256 digests of a host's DER leaf certificate.
//! A pinned host is trusted only when the presented leaf matches one of its
//! pins; hosts without pins fall back to default handling.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::challenge::{Challenge, ChallengeCompletion, ChallengeDisposition};
use crate::error::TrustError;
use crate::policy::TrustPolicy;
use crate::Result;

/// Compute the pin for a DER-encoded certificate.
pub fn certificate_pin(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn normalize_pin(pin: &str) -> Result<String> {
    let pin = pin.trim().to_lowercase();
    if pin.len() != 64 || !pin.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TrustError::InvalidPin(pin));
    }
    Ok(pin)
}

fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    if host.is_empty() || host.contains('/') {
        return Err(TrustError::InvalidHost(host));
    }
    Ok(host)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPins {
    pub host: String,
    pub pins: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PinnedCertificates {
    /// host -> accepted leaf pins
    pins: HashMap<String, BTreeSet<String>>,
}

impl PinnedCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of [`HostPins`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<HostPins> = serde_json::from_str(&raw)?;
        Self::from_host_pins(entries)
    }

    pub fn add_pin(&mut self, host: &str, pin: &str) -> Result<()> {
        let host = normalize_host(host)?;
        let pin = normalize_pin(pin)?;
        self.pins.entry(host).or_default().insert(pin);
        Ok(())
    }

    /// Pin the given DER certificate for a host.
    pub fn add_certificate(&mut self, host: &str, der: &[u8]) -> Result<()> {
        self.add_pin(host, &certificate_pin(der))
    }

    pub fn remove_host(&mut self, host: &str) {
        if let Ok(host) = normalize_host(host) {
            self.pins.remove(&host);
        }
    }

    pub fn is_pinned(&self, host: &str) -> bool {
        normalize_host(host)
            .map(|h| self.pins.contains_key(&h))
            .unwrap_or(false)
    }

    /// Whether the leaf certificate is acceptable for the host. Unpinned
    /// hosts return `None`.
    pub fn matches(&self, host: &str, leaf_certificate: Option<&[u8]>) -> Option<bool> {
        let host = normalize_host(host).ok()?;
        let pins = self.pins.get(&host)?;
        Some(leaf_certificate.is_some_and(|der| pins.contains(&certificate_pin(der))))
    }

    pub fn export_pins(&self) -> Vec<HostPins> {
        let mut out: Vec<HostPins> = self
            .pins
            .iter()
            .map(|(host, pins)| HostPins {
                host: host.clone(),
                pins: pins.iter().cloned().collect(),
            })
            .collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    pub fn from_host_pins(entries: Vec<HostPins>) -> Result<Self> {
        let mut pinned = Self::new();
        for entry in entries {
            for pin in &entry.pins {
                pinned.add_pin(&entry.host, pin)?;
            }
        }
        Ok(pinned)
    }
}

impl TrustPolicy for PinnedCertificates {
    fn handle_challenge(
        &self,
        session_identifier: &str,
        challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        let Challenge::ServerTrust {
            host,
            leaf_certificate,
            ..
        } = challenge
        else {
            completion.complete(ChallengeDisposition::PerformDefaultHandling);
            return;
        };

        match self.matches(host, leaf_certificate.as_deref()) {
            None => completion.complete(ChallengeDisposition::PerformDefaultHandling),
            Some(true) => {
                tracing::debug!(
                    session_id = %session_identifier,
                    host = %host,
                    "Pinned certificate matched"
                );
                completion.complete(ChallengeDisposition::Proceed);
            }
            Some(false) => {
                tracing::warn!(
                    session_id = %session_identifier,
                    host = %host,
                    "Certificate pin mismatch"
                );
                completion.complete(ChallengeDisposition::Cancel);
            }
        }
    }
}

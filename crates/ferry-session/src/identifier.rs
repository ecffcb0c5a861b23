//! Session identifiers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier a background session is registered under.
///
/// Generated identifiers carry a fresh UUID, so two service instances (or
/// two launches of the same process) never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentifier(String);

impl SessionIdentifier {
    pub fn generate(prefix: &str) -> Self {
        Self(format!(
            "{}_{}",
            prefix,
            Uuid::new_v4().to_string().to_uppercase()
        ))
    }

    /// Reuse an identifier minted by an earlier process, to reattach to its
    /// journaled tasks.
    pub fn from_existing(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

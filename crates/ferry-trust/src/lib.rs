//! Ferry Trust
//!
//! Authentication challenges raised by the transport and the policies that
//! answer them:
//! - Server trust: the TLS peer's leaf certificate, checked after the
//!   platform chain validation succeeded
//! - HTTP authentication: `401` responses that may be answered with a
//!   credential
//!
//! Every challenge comes with a [`ChallengeCompletion`] that must be answered
//! exactly once. The policy is a strategy object injected by the host.

mod challenge;
mod credentials;
mod error;
mod pinning;
mod policy;

pub use challenge::{Challenge, ChallengeCompletion, ChallengeDisposition, Credential};
pub use credentials::StaticCredentials;
pub use error::TrustError;
pub use pinning::{certificate_pin, HostPins, PinnedCertificates};
pub use policy::{DefaultTrustPolicy, TrustPolicy};

pub type Result<T> = std::result::Result<T, TrustError>;

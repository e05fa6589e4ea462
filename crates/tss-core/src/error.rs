//! Error types for threshold signing operations

use crate::types::MemberId;
use thiserror::Error;

/// Result type alias for TSS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during DKG and signing
#[derive(Debug, Error)]
pub enum Error {
    /// Syntactically invalid submission (wrong length, bad encoding)
    #[error("Malformed submission: {0}")]
    MalformedSubmission(String),

    /// The same submission was already accepted
    #[error("Duplicate submission: {0}")]
    DuplicateSubmission(String),

    /// A member's contribution failed cryptographic verification
    #[error("Verification failed for member {member}: {reason}")]
    VerificationFailed { member: MemberId, reason: String },

    /// Locally derived key material disagrees with the group's
    #[error("Inconsistent group key: {0}")]
    InconsistentGroupKey(String),

    /// A one-time nonce pair was selected for a second signing
    #[error("Nonce reuse detected: {0}")]
    NonceReuse(String),

    /// Referenced group, member, session or key is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fewer than threshold honest members remain
    #[error("Resource exhausted: required {required}, remaining {remaining}")]
    ResourceExhausted { required: usize, remaining: usize },

    /// DKG context does not match the group's recorded value
    #[error("Invalid DKG context")]
    InvalidContext,

    /// Submission arrived in the wrong protocol phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Sender is not bound to the member it claims to be
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid group or session configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Nonce generator could not be seeded
    #[error("Bad DRBG initialization")]
    BadDrbgInitialization,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Secret store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Ledger submission or query error
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Timeout waiting for a ledger operation
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that must halt the affected group or session and never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InconsistentGroupKey(_) | Error::NonceReuse(_))
    }

    /// Local errors absorbed at the orchestrator boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSubmission(_) | Error::MalformedSubmission(_) | Error::InvalidState(_)
        )
    }

    /// Transient errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Ledger(_) | Error::Timeout(_))
    }

    /// Member a verification failure is attributed to, if any.
    pub fn culprit(&self) -> Option<MemberId> {
        match self {
            Error::VerificationFailed { member, .. } => Some(*member),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

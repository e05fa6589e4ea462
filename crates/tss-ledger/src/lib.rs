//! Dev Ledger
//!
//! An in-process stand-in for the ordered log that threshold groups run
//! against. It orders submissions, runs the public DKG and signing
//! bookkeeping, announces sequenced events and keeps the nonce-pair queues
//! signers are assigned from.

mod memory;

pub use memory::MemoryLedger;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tss_core::keygen::ConfirmPolicy;
use tss_core::GroupId;

/// Ledger error types
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),
    #[error("Not enough nonce pairs: {0}")]
    NotEnoughNonces(String),
    #[error(transparent)]
    Core(#[from] tss_core::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl From<LedgerError> for tss_core::Error {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Core(inner) => inner,
            LedgerError::GroupNotFound(id) => tss_core::Error::NotFound(format!("group {}", id)),
            other => tss_core::Error::Ledger(other.to_string()),
        }
    }
}

/// Dev ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Seconds a DKG round may stay open
    pub round_timeout_secs: i64,
    /// Seconds a signing request may wait for partials
    pub signing_timeout_secs: i64,
    /// When a confirming group activates
    pub confirm_policy: ConfirmPolicy,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    /// Seconds an accepted submission is remembered for replay rejection
    pub dedup_ttl_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            round_timeout_secs: 300,
            signing_timeout_secs: 120,
            confirm_policy: ConfirmPolicy::All,
            event_buffer: 1024,
            dedup_ttl_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: tss_core::Error = LedgerError::GroupNotFound(GroupId(4)).into();
        assert!(matches!(err, tss_core::Error::NotFound(_)));

        let err: tss_core::Error = LedgerError::NotEnoughNonces("member 2".into()).into();
        assert!(err.is_retryable());

        let err: tss_core::Error = LedgerError::Core(tss_core::Error::InvalidContext).into();
        assert!(matches!(err, tss_core::Error::InvalidContext));
    }

    #[test]
    fn test_config_parses_from_json() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"round_timeout_secs":5,"signing_timeout_secs":6,"confirm_policy":"threshold","event_buffer":8}"#)
                .unwrap();
        assert_eq!(config.confirm_policy, ConfirmPolicy::Threshold);
        assert_eq!(config.event_buffer, 8);
        assert_eq!(config.dedup_ttl_secs, LedgerConfig::default().dedup_ttl_secs);
    }
}

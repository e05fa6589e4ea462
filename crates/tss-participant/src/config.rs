//! Participant configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tss_core::{Address, Error, Result};

/// Backoff settings for ledger submissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first; at least one is always made
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Settings for one participant node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Ledger address this node submits as
    pub address: Address,
    /// Directory holding the secret store file
    pub data_dir: PathBuf,
    /// Capacity of each per-group and per-request event queue; events beyond
    /// it are held back by the router rather than blocking delivery
    pub channel_capacity: usize,
    /// Unused nonce pairs to keep published
    pub min_des: usize,
    /// Nonce pairs generated per replenishment
    pub de_batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            data_dir: PathBuf::from("./data"),
            channel_capacity: 32,
            min_des: 4,
            de_batch_size: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl ParticipantConfig {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("address must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig("channel_capacity must be positive".into()));
        }
        if self.de_batch_size == 0 {
            return Err(Error::InvalidConfig("de_batch_size must be positive".into()));
        }
        Ok(())
    }

    /// Secret store file for this node's address
    pub fn store_path(&self) -> PathBuf {
        let name: String = self
            .address
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join(format!("store.{}.json", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participant.json");
        std::fs::write(&path, r#"{"address":"validator-1","min_des":2}"#).unwrap();

        let config = ParticipantConfig::load(&path).unwrap();
        assert_eq!(config.address, "validator-1");
        assert_eq!(config.min_des, 2);
        assert_eq!(config.de_batch_size, 8);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_validation() {
        assert!(ParticipantConfig::default().validate().is_err());

        let mut config = ParticipantConfig::new("validator-1");
        assert!(config.validate().is_ok());
        config.de_batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_store_path_is_sanitized() {
        let mut config = ParticipantConfig::new("node/1:a");
        config.data_dir = PathBuf::from("/var/tss");
        assert_eq!(config.store_path(), PathBuf::from("/var/tss/store.node_1_a.json"));
    }
}

//! Secret store
//!
//! Holds everything a member must never publish: DKG scratch secrets,
//! one-time nonce pairs and the finalized key share. Nonce consumption is an
//! atomic test-and-set and the key share is written exactly once.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::crypto::{self, scalar_serde};
use crate::keygen::DkgSecrets;
use crate::sign::{DePublic, DeSecret};
use crate::{Error, GroupId, MemberId, Result, SigningId};
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A member's finalized share of a group key
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    #[zeroize(skip)]
    pub group_id: GroupId,

    #[zeroize(skip)]
    pub member_id: MemberId,

    #[zeroize(skip)]
    pub threshold: usize,

    /// Private share `x_j`
    #[serde(with = "scalar_serde")]
    pub private_share: Scalar,

    /// Compressed group public key
    #[zeroize(skip)]
    pub public_key: Vec<u8>,

    /// Compressed own public share `x_j·G`
    #[zeroize(skip)]
    pub public_share: Vec<u8>,
}

impl GroupKey {
    pub fn public_key_point(&self) -> Result<ProjectivePoint> {
        crypto::decode_point(&self.public_key)
    }

    pub fn public_share_point(&self) -> Result<ProjectivePoint> {
        crypto::decode_point(&self.public_share)
    }

    /// Same group, member and share
    pub fn same_as(&self, other: &GroupKey) -> bool {
        self.group_id == other.group_id
            && self.member_id == other.member_id
            && self.public_key == other.public_key
            && bool::from(self.private_share.ct_eq(&other.private_share))
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("threshold", &self.threshold)
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a stored nonce pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeStatus {
    Unused,
    Consumed { signing_id: SigningId },
}

/// A nonce pair record; the secret is erased once consumed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeRecord {
    pub public: DePublic,
    pub status: DeStatus,
    pub secret: Option<DeSecret>,
    /// Set once the ledger has accepted the public half
    #[serde(default)]
    pub published: bool,
}

impl DeRecord {
    pub fn new(secret: DeSecret) -> Self {
        Self {
            public: secret.public(),
            status: DeStatus::Unused,
            secret: Some(secret),
            published: false,
        }
    }

    /// Unused and waiting to be signed with
    pub(crate) fn is_available(&self) -> bool {
        self.published && self.status == DeStatus::Unused
    }

    /// Unused but never acknowledged by the ledger
    pub(crate) fn is_pending(&self) -> bool {
        !self.published && self.status == DeStatus::Unused
    }

    /// Test-and-set consumption shared by all backends.
    pub(crate) fn consume(&mut self, signing_id: SigningId) -> Result<DeSecret> {
        match self.status {
            DeStatus::Unused => {
                let secret = self.secret.take().ok_or_else(|| {
                    Error::Storage("unused nonce pair has no secret".into())
                })?;
                self.status = DeStatus::Consumed { signing_id };
                Ok(secret)
            }
            DeStatus::Consumed { signing_id: used } if used == signing_id => {
                Err(Error::DuplicateSubmission(format!(
                    "nonce pair already consumed by signing {}",
                    signing_id
                )))
            }
            DeStatus::Consumed { signing_id: used } => Err(Error::NonceReuse(format!(
                "nonce pair consumed by signing {} requested again by signing {}",
                used, signing_id
            ))),
        }
    }
}

/// Durable storage for a member's secrets
///
/// Implementations must make `consume_de` atomic with respect to concurrent
/// callers and must refuse to overwrite DKG secrets or a key share.
pub trait SecretStore: Send + Sync {
    /// Store DKG scratch secrets for a group; write-once.
    fn put_dkg(&self, secrets: DkgSecrets) -> Result<()>;

    fn dkg(&self, group_id: GroupId) -> Result<Option<DkgSecrets>>;

    /// Drop DKG scratch secrets once the group is finalized or failed.
    fn delete_dkg(&self, group_id: GroupId) -> Result<()>;

    /// Store fresh, not yet published nonce pairs and return their public
    /// halves ordered by key.
    fn insert_des(&self, des: Vec<DeSecret>) -> Result<Vec<DePublic>>;

    /// Unused pairs the ledger has not acknowledged yet, ordered by key.
    fn unpublished_des(&self) -> Result<Vec<DePublic>>;

    /// Record that the ledger accepted these pairs.
    fn mark_published(&self, des: &[DePublic]) -> Result<()>;

    /// Atomically mark the pair consumed for `signing_id` and hand out its secret.
    fn consume_de(&self, public: &DePublic, signing_id: SigningId) -> Result<DeSecret>;

    /// Published pairs that are still unused
    fn unused_de_count(&self) -> Result<usize>;

    /// Public halves and status of every stored pair
    fn des(&self) -> Result<Vec<(DePublic, DeStatus)>>;

    /// Record the finalized key share; write-once.
    fn set_group_key(&self, key: GroupKey) -> Result<()>;

    fn group_key(&self, group_id: GroupId) -> Result<Option<GroupKey>>;

    fn group_ids(&self) -> Result<Vec<GroupId>>;
}

/// Write-once check shared by all backends.
pub(crate) fn check_group_key_overwrite(existing: &GroupKey, key: &GroupKey) -> Error {
    if existing.same_as(key) {
        Error::DuplicateSubmission(format!("key share for group {}", key.group_id))
    } else {
        Error::InconsistentGroupKey(format!(
            "group {} already has a different key share",
            key.group_id
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keygen::DkgSecrets;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    pub(crate) fn sample_secrets(group_id: u64) -> DkgSecrets {
        DkgSecrets {
            group_id: GroupId(group_id),
            member_id: MemberId(1),
            threshold: 2,
            dkg_context: [7; 32],
            one_time_secret: Scalar::random(&mut OsRng),
            coefficients: vec![Scalar::random(&mut OsRng), Scalar::random(&mut OsRng)],
        }
    }

    pub(crate) fn sample_key(group_id: u64) -> GroupKey {
        let share = Scalar::random(&mut OsRng);
        GroupKey {
            group_id: GroupId(group_id),
            member_id: MemberId(1),
            threshold: 2,
            private_share: share,
            public_key: crypto::encode_point(&crypto::public_point(&Scalar::random(&mut OsRng))),
            public_share: crypto::encode_point(&crypto::public_point(&share)),
        }
    }

    /// Behaviour every backend must share.
    pub(crate) fn exercise(store: &dyn SecretStore) {
        store.put_dkg(sample_secrets(1)).unwrap();
        assert!(matches!(
            store.put_dkg(sample_secrets(1)),
            Err(Error::DuplicateSubmission(_))
        ));
        assert_eq!(store.dkg(GroupId(1)).unwrap().unwrap().threshold, 2);
        store.delete_dkg(GroupId(1)).unwrap();
        assert!(store.dkg(GroupId(1)).unwrap().is_none());

        let publics = store
            .insert_des((0..3).map(|_| DeSecret::generate(&mut OsRng)).collect())
            .unwrap();
        assert!(publics.windows(2).all(|w| w[0].key() < w[1].key()));
        assert_eq!(store.unused_de_count().unwrap(), 0);
        assert_eq!(store.unpublished_des().unwrap(), publics);

        store.mark_published(&publics[..2]).unwrap();
        assert_eq!(store.unused_de_count().unwrap(), 2);
        assert_eq!(store.unpublished_des().unwrap(), vec![publics[2].clone()]);
        store.mark_published(&publics).unwrap();
        assert_eq!(store.unused_de_count().unwrap(), 3);
        assert!(store.unpublished_des().unwrap().is_empty());

        let secret = store.consume_de(&publics[0], SigningId(10)).unwrap();
        assert_eq!(secret.public(), publics[0]);
        assert_eq!(store.unused_de_count().unwrap(), 2);
        assert!(matches!(
            store.consume_de(&publics[0], SigningId(10)),
            Err(Error::DuplicateSubmission(_))
        ));
        let reuse = store.consume_de(&publics[0], SigningId(11)).unwrap_err();
        assert!(matches!(reuse, Error::NonceReuse(_)));
        assert!(reuse.is_fatal());

        let unknown = DeSecret::generate(&mut OsRng).public();
        assert!(matches!(
            store.consume_de(&unknown, SigningId(1)),
            Err(Error::NotFound(_))
        ));
        let consumed: Vec<_> = store
            .des()
            .unwrap()
            .into_iter()
            .filter(|(_, status)| *status == DeStatus::Consumed { signing_id: SigningId(10) })
            .collect();
        assert_eq!(consumed.len(), 1);

        let key = sample_key(5);
        store.set_group_key(key.clone()).unwrap();
        assert!(matches!(
            store.set_group_key(key.clone()),
            Err(Error::DuplicateSubmission(_))
        ));
        assert!(matches!(
            store.set_group_key(sample_key(5)),
            Err(Error::InconsistentGroupKey(_))
        ));
        assert!(store.group_key(GroupId(5)).unwrap().unwrap().same_as(&key));
        assert_eq!(store.group_ids().unwrap(), vec![GroupId(5)]);
    }

    #[test]
    fn test_record_serializes_status() {
        let mut record = DeRecord::new(DeSecret::generate(&mut OsRng));
        record.consume(SigningId(4)).unwrap();
        assert!(record.secret.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"]["status"], "consumed");
        assert_eq!(json["status"]["signing_id"], 4);
    }
}

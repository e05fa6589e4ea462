//! Core types for the threshold signing protocol

use crate::crypto::{self, POINT_LENGTH, SCALAR_LENGTH};
use crate::keygen::{Complaint, Confirm, Round1Info, Round2Info};
use crate::sign::DePublic;
use crate::{Error, Result};
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest group the protocol accepts
pub const MAX_GROUP_SIZE: usize = 255;

/// Length of an encoded signature: R (compressed) || s
pub const SIGNATURE_LENGTH: usize = POINT_LENGTH + SCALAR_LENGTH;

/// Account address a member is bound to
pub type Address = String;

/// Per-group domain-separation seed fixed at creation
pub type DkgContext = [u8; 32];

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Big-endian encoding used inside hashes
            pub fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Member identifier, dense 1..N within a group
    MemberId
);
id_type!(
    /// Group identifier assigned by the ledger
    GroupId
);
id_type!(
    /// Signing request identifier assigned by the ledger
    SigningId
);

impl MemberId {
    /// Evaluation point for this member's share
    pub fn scalar(self) -> Scalar {
        Scalar::from(self.0)
    }
}

/// Lifecycle of a group's key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Created,
    Round1Pending,
    Round2Pending,
    Confirming,
    Active,
    Failed,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::Active | GroupStatus::Failed)
    }
}

/// Group configuration and public key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub threshold: usize,
    pub size: usize,
    pub dkg_context: DkgContext,
    pub status: GroupStatus,
    /// Compressed group public key, set once when the group activates
    pub public_key: Option<Vec<u8>>,
}

impl Group {
    /// Create a group, validating `1 <= threshold <= size <= MAX_GROUP_SIZE`.
    pub fn new(id: GroupId, threshold: usize, size: usize, dkg_context: DkgContext) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidConfig("Threshold must be at least 1".into()));
        }
        if threshold > size {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of members".into(),
            ));
        }
        if size > MAX_GROUP_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Group size {} exceeds maximum {}",
                size, MAX_GROUP_SIZE
            )));
        }

        Ok(Self {
            id,
            threshold,
            size,
            dkg_context,
            status: GroupStatus::Created,
            public_key: None,
        })
    }

    /// Reject a DKG context that differs from the recorded one.
    pub fn check_context(&self, dkg_context: &DkgContext) -> Result<()> {
        if &self.dkg_context != dkg_context {
            return Err(Error::InvalidContext);
        }
        Ok(())
    }

    /// Record the group public key; it is immutable once set.
    pub fn set_public_key(&mut self, public_key: &ProjectivePoint) -> Result<()> {
        let encoded = crypto::encode_point(public_key);
        match &self.public_key {
            Some(existing) if existing == &encoded => Ok(()),
            Some(_) => Err(Error::InconsistentGroupKey(format!(
                "group {} already has a different public key",
                self.id
            ))),
            None => {
                self.public_key = Some(encoded);
                Ok(())
            }
        }
    }

    /// Decoded group public key.
    pub fn public_key_point(&self) -> Result<ProjectivePoint> {
        let bytes = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("public key of group {}", self.id)))?;
        crypto::decode_point(bytes)
    }

    /// All member ids of this group.
    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> {
        (1..=self.size as u64).map(MemberId)
    }
}

/// Public per-member state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub group_id: GroupId,
    pub address: Address,
    /// One-time public key from Round 1
    pub one_time_pub_key: Option<Vec<u8>>,
    /// Feldman commitments to the member's polynomial
    pub coefficient_commits: Vec<Vec<u8>>,
    /// Public verification point, set when the group activates
    pub public_key: Option<Vec<u8>>,
    pub is_malicious: bool,
    pub is_active: bool,
}

impl Member {
    pub fn new(id: MemberId, group_id: GroupId, address: impl Into<Address>) -> Self {
        Self {
            id,
            group_id,
            address: address.into(),
            one_time_pub_key: None,
            coefficient_commits: Vec::new(),
            public_key: None,
            is_malicious: false,
            is_active: true,
        }
    }

    /// Whether the member can still take part in the protocol
    pub fn is_honest(&self) -> bool {
        !self.is_malicious && self.is_active
    }
}

/// Schnorr signature (R, s)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Nonce commitment
    pub r: ProjectivePoint,
    /// Response
    pub s: Scalar,
}

impl Signature {
    pub fn new(r: ProjectivePoint, s: Scalar) -> Self {
        Self { r, s }
    }

    /// Convert to bytes (R || s)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH);
        bytes.extend_from_slice(&crypto::encode_point(&self.r));
        bytes.extend_from_slice(&crypto::encode_scalar(&self.s));
        bytes
    }

    /// Parse (R || s); any length or encoding problem is a malformed submission.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(Error::MalformedSubmission(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            )));
        }
        let r = crypto::decode_point(&bytes[..POINT_LENGTH])?;
        let s = crypto::decode_scalar(&bytes[POINT_LENGTH..])?;
        Ok(Self { r, s })
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Messages a member submits to the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TssMessage {
    SubmitRound1 {
        group_id: GroupId,
        round1: Round1Info,
    },
    SubmitRound2 {
        group_id: GroupId,
        round2: Round2Info,
    },
    Complain {
        group_id: GroupId,
        complaints: Vec<Complaint>,
    },
    Confirm {
        group_id: GroupId,
        confirm: Confirm,
    },
    SubmitDes {
        des: Vec<DePublic>,
    },
    SubmitSignature {
        signing_id: SigningId,
        member_id: MemberId,
        signature: Vec<u8>,
    },
}

impl TssMessage {
    /// Group this message belongs to, if any
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            TssMessage::SubmitRound1 { group_id, .. }
            | TssMessage::SubmitRound2 { group_id, .. }
            | TssMessage::Complain { group_id, .. }
            | TssMessage::Confirm { group_id, .. } => Some(*group_id),
            TssMessage::SubmitDes { .. } | TssMessage::SubmitSignature { .. } => None,
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            TssMessage::SubmitRound1 { group_id, .. } => format!("SubmitRound1, GroupID: {}", group_id),
            TssMessage::SubmitRound2 { group_id, .. } => format!("SubmitRound2, GroupID: {}", group_id),
            TssMessage::Complain { group_id, .. } => format!("Complain, GroupID: {}", group_id),
            TssMessage::Confirm { group_id, .. } => format!("Confirm, GroupID: {}", group_id),
            TssMessage::SubmitDes { des } => format!("SubmitDes, Count: {}", des.len()),
            TssMessage::SubmitSignature { signing_id, .. } => {
                format!("SubmitSignature, SigningID: {}", signing_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_group_validation() {
        assert!(Group::new(GroupId(1), 3, 4, [0; 32]).is_ok());
        assert!(Group::new(GroupId(1), 1, 1, [0; 32]).is_ok());
        assert!(Group::new(GroupId(1), 0, 4, [0; 32]).is_err());
        assert!(Group::new(GroupId(1), 5, 4, [0; 32]).is_err());
        assert!(Group::new(GroupId(1), 2, MAX_GROUP_SIZE + 1, [0; 32]).is_err());
    }

    #[test]
    fn test_group_context_and_key_are_write_once() {
        let mut group = Group::new(GroupId(7), 2, 3, [5; 32]).unwrap();
        assert!(group.check_context(&[5; 32]).is_ok());
        assert!(matches!(group.check_context(&[6; 32]), Err(Error::InvalidContext)));

        let key = crypto::public_point(&Scalar::random(&mut OsRng));
        group.set_public_key(&key).unwrap();
        group.set_public_key(&key).unwrap();
        assert_eq!(group.public_key_point().unwrap(), key);

        let other = crypto::public_point(&Scalar::random(&mut OsRng));
        assert!(matches!(
            group.set_public_key(&other),
            Err(Error::InconsistentGroupKey(_))
        ));
    }

    #[test]
    fn test_signature_bytes() {
        let sig = Signature::new(
            crypto::public_point(&Scalar::random(&mut OsRng)),
            Scalar::random(&mut OsRng),
        );
        let bytes = sig.to_bytes();
        assert_eq!(bytes.len(), SIGNATURE_LENGTH);
        assert_eq!(Signature::from_bytes(&bytes).unwrap(), sig);
        assert!(matches!(
            Signature::from_bytes(&bytes[..64]),
            Err(Error::MalformedSubmission(_))
        ));

        let json = serde_json::to_string(&sig).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_message_description() {
        let msg = TssMessage::SubmitSignature {
            signing_id: SigningId(1),
            member_id: MemberId(2),
            signature: vec![],
        };
        assert_eq!(msg.describe(), "SubmitSignature, SigningID: 1");
        assert_eq!(msg.group_id(), None);
    }
}

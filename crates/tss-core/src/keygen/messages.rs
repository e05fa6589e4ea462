//! DKG message types
//!
//! Fields carry raw encodings; the engine parses them and reports any
//! length or encoding problem as a malformed submission.

use crate::MemberId;
use serde::{Deserialize, Serialize};

/// Round 1: commitment to the secret polynomial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round1Info {
    /// Sender member ID
    pub member_id: MemberId,
    /// Commitments to polynomial coefficients (Feldman VSS)
    pub coefficient_commits: Vec<Vec<u8>>,
    /// One-time public key used for share encryption
    pub one_time_pub_key: Vec<u8>,
    /// Proof of knowledge of the constant term
    pub a0_signature: Vec<u8>,
    /// Proof of knowledge of the one-time secret
    pub one_time_signature: Vec<u8>,
}

/// Round 2: encrypted secret shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round2Info {
    /// Sender member ID
    pub member_id: MemberId,
    /// Masked shares by ascending receiver id, sender skipped
    pub encrypted_secret_shares: Vec<Vec<u8>>,
}

/// Accusation that a received share is inconsistent with its commitments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complaint {
    /// Accusing member
    pub complainant: MemberId,
    /// Accused member
    pub respondent: MemberId,
    /// Shared key `sk_complainant · OneTimePub_respondent`
    pub key_sym: Vec<u8>,
    /// Discrete-log-equality proof for `key_sym`
    pub proof: Vec<u8>,
}

/// Round 3: confirmation of the member's derived key share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirm {
    /// Confirming member
    pub member_id: MemberId,
    /// Dealer set the share was computed over
    pub dealers: Vec<MemberId>,
    /// Signature by the private share over its public share
    pub own_pub_key_signature: Vec<u8>,
}

//! Threshold signing module
//!
//! Each signer holds a one-time nonce pair `(d, e)` whose public half
//! `(D, E)` was published ahead of time. For a request, every assigned
//! signer derives the same binding factors, group nonce and challenge from
//! public data, then contributes `z_i = d_i + ρ_i·e_i + λ_i·x_i·c`.

mod dsg;
mod messages;
mod session;

pub use dsg::{
    aggregate, binding_factor, commitment_encoding, compute_partial, prepare, verify,
    verify_partial,
};
pub use messages::*;
pub use session::{SigningOutcome, SigningSession, SigningStatus};

use crate::crypto::{self, scalar_serde};
use crate::{GroupId, MemberId, Result, SigningId};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public half of a one-time nonce pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DePublic {
    /// Compressed `D = d·G`
    pub d: Vec<u8>,
    /// Compressed `E = e·G`
    pub e: Vec<u8>,
}

impl DePublic {
    /// Decode both points.
    pub fn points(&self) -> Result<(ProjectivePoint, ProjectivePoint)> {
        Ok((crypto::decode_point(&self.d)?, crypto::decode_point(&self.e)?))
    }

    /// Hex key used to index nonce pairs in stores
    pub fn key(&self) -> String {
        format!("{}{}", hex::encode(&self.d), hex::encode(&self.e))
    }
}

/// Secret half of a one-time nonce pair
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DeSecret {
    #[serde(with = "scalar_serde")]
    pub d: Scalar,
    #[serde(with = "scalar_serde")]
    pub e: Scalar,
}

impl DeSecret {
    /// Fresh random pair.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            d: Scalar::random(&mut *rng),
            e: Scalar::random(&mut *rng),
        }
    }

    pub fn public(&self) -> DePublic {
        DePublic {
            d: crypto::encode_point(&crypto::public_point(&self.d)),
            e: crypto::encode_point(&crypto::public_point(&self.e)),
        }
    }
}

impl std::fmt::Debug for DeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeSecret").finish_non_exhaustive()
    }
}

/// Per-signer commitment data inside a [`SigningContext`]
#[derive(Debug, Clone)]
pub struct SignerCommitment {
    pub d: ProjectivePoint,
    pub e: ProjectivePoint,
    /// Binding factor `ρ_i`
    pub binding_factor: Scalar,
    /// Lagrange coefficient `λ_i` over the assigned set
    pub lagrange: Scalar,
}

impl SignerCommitment {
    /// Signer's nonce contribution `D_i + ρ_i·E_i`
    pub fn nonce_point(&self) -> ProjectivePoint {
        self.d + self.e * self.binding_factor
    }
}

/// Everything an assigned signer derives from public data
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub signing_id: SigningId,
    pub group_id: GroupId,
    pub message: Vec<u8>,
    pub group_public_key: ProjectivePoint,
    /// Assigned signers, ascending by member id
    pub signers: BTreeMap<MemberId, SignerCommitment>,
    /// Group nonce `R = Σ (D_i + ρ_i·E_i)`
    pub group_nonce: ProjectivePoint,
    /// Challenge `c = H(R, Y, message)`
    pub challenge: Scalar,
}

impl SigningContext {
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.signers.keys().copied().collect()
    }

    pub fn signer(&self, id: MemberId) -> Result<&SignerCommitment> {
        self.signers.get(&id).ok_or_else(|| {
            crate::Error::NotFound(format!(
                "member {} in signing {}",
                id, self.signing_id
            ))
        })
    }
}

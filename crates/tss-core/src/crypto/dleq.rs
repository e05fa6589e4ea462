//! Chaum-Pedersen proof of discrete-log equality
//!
//! Proves `log_G(Y1) = log_H(Y2)` without revealing the exponent. A
//! complainant uses it to show that the shared key it reveals really is
//! `sk · OneTimePub_respondent` for its own one-time secret `sk`.

use super::{decode_point, decode_scalar, encode_point, encode_scalar, hash_to_scalar, public_point, tags};
use super::{nonce::derive_nonce, POINT_LENGTH, SCALAR_LENGTH};
use crate::{Error, Result};
use k256::{ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use subtle::ConstantTimeEq;

/// Encoded proof length: A1 || A2 || z
pub const PROOF_LENGTH: usize = POINT_LENGTH * 2 + SCALAR_LENGTH;

/// Proof `(A1, A2, z)` for the statement `(Y1, H, Y2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DleqProof {
    pub a1: ProjectivePoint,
    pub a2: ProjectivePoint,
    pub z: Scalar,
}

fn challenge(
    a1: &ProjectivePoint,
    a2: &ProjectivePoint,
    y1: &ProjectivePoint,
    h: &ProjectivePoint,
    y2: &ProjectivePoint,
) -> Scalar {
    hash_to_scalar(
        tags::COMPLAINT,
        &[
            &encode_point(a1),
            &encode_point(a2),
            &encode_point(y1),
            &encode_point(h),
            &encode_point(y2),
        ],
    )
}

impl DleqProof {
    /// Prove knowledge of `secret` with `Y1 = secret·G` and `Y2 = secret·H`.
    pub fn prove<R: CryptoRngCore>(secret: &Scalar, h: &ProjectivePoint, rng: &mut R) -> Result<Self> {
        let y1 = public_point(secret);
        let y2 = *h * secret;
        let k = derive_nonce(secret, tags::COMPLAINT, &[&encode_point(h), &encode_point(&y2)], rng)?;
        let a1 = public_point(&k);
        let a2 = *h * k;
        let c = challenge(&a1, &a2, &y1, h, &y2);
        Ok(Self { a1, a2, z: k + c * secret })
    }

    /// Check `z·G = A1 + c·Y1` and `z·H = A2 + c·Y2`.
    pub fn verify(&self, y1: &ProjectivePoint, h: &ProjectivePoint, y2: &ProjectivePoint) -> bool {
        let c = challenge(&self.a1, &self.a2, y1, h, y2);
        let first = public_point(&self.z).ct_eq(&(self.a1 + *y1 * c));
        let second = (*h * self.z).ct_eq(&(self.a2 + *y2 * c));
        bool::from(first & second)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROOF_LENGTH);
        bytes.extend_from_slice(&encode_point(&self.a1));
        bytes.extend_from_slice(&encode_point(&self.a2));
        bytes.extend_from_slice(&encode_scalar(&self.z));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PROOF_LENGTH {
            return Err(Error::MalformedSubmission(format!(
                "complaint proof must be {} bytes, got {}",
                PROOF_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self {
            a1: decode_point(&bytes[..POINT_LENGTH])?,
            a2: decode_point(&bytes[POINT_LENGTH..POINT_LENGTH * 2])?,
            z: decode_scalar(&bytes[POINT_LENGTH * 2..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_dleq_proof() {
        let x = Scalar::random(&mut OsRng);
        let h = public_point(&Scalar::random(&mut OsRng));
        let proof = DleqProof::prove(&x, &h, &mut OsRng).unwrap();

        let y1 = public_point(&x);
        let y2 = h * x;
        assert!(proof.verify(&y1, &h, &y2));

        let parsed = DleqProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(parsed, proof);
    }

    #[test]
    fn test_dleq_rejects_wrong_shared_key() {
        let x = Scalar::random(&mut OsRng);
        let h = public_point(&Scalar::random(&mut OsRng));
        let proof = DleqProof::prove(&x, &h, &mut OsRng).unwrap();

        let forged = h * (x + Scalar::ONE);
        assert!(!proof.verify(&public_point(&x), &h, &forged));
    }
}

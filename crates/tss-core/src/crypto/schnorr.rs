//! Schnorr signatures with tagged challenges
//!
//! `c = H(tag, R, P, parts...)`, `s = k + c·x`, verified as `s·G = R + c·P`.
//! The aggregate group signature uses the same equation, so a threshold
//! signature verifies like a single-signer one.

use super::{encode_point, hash_to_scalar, nonce::derive_nonce, public_point};
use crate::{Result, Signature};
use k256::{ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use subtle::ConstantTimeEq;

/// Challenge scalar for nonce commitment `r` and public key `public_key`.
pub fn challenge(
    tag: &[u8],
    r: &ProjectivePoint,
    public_key: &ProjectivePoint,
    parts: &[&[u8]],
) -> Scalar {
    let r_bytes = encode_point(r);
    let key_bytes = encode_point(public_key);
    let mut framed: Vec<&[u8]> = Vec::with_capacity(parts.len() + 2);
    framed.push(&r_bytes);
    framed.push(&key_bytes);
    framed.extend_from_slice(parts);
    hash_to_scalar(tag, &framed)
}

/// Sign `parts` under `tag` with `secret`.
pub fn sign<R: CryptoRngCore>(
    secret: &Scalar,
    tag: &[u8],
    parts: &[&[u8]],
    rng: &mut R,
) -> Result<Signature> {
    let public_key = public_point(secret);
    let k = derive_nonce(secret, tag, parts, rng)?;
    let r = public_point(&k);
    let c = challenge(tag, &r, &public_key, parts);
    Ok(Signature::new(r, k + c * secret))
}

/// Check `s·G = R + c·P`.
pub fn verify(public_key: &ProjectivePoint, signature: &Signature, tag: &[u8], parts: &[&[u8]]) -> bool {
    let c = challenge(tag, &signature.r, public_key, parts);
    let lhs = public_point(&signature.s);
    let rhs = signature.r + *public_key * c;
    bool::from(lhs.ct_eq(&rhs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_verify() {
        let secret = Scalar::random(&mut OsRng);
        let public_key = public_point(&secret);
        let sig = sign(&secret, b"tag", &[b"hello"], &mut OsRng).unwrap();

        assert!(verify(&public_key, &sig, b"tag", &[b"hello"]));
        assert!(!verify(&public_key, &sig, b"tag", &[b"hellp"]));
        assert!(!verify(&public_key, &sig, b"other", &[b"hello"]));

        let stranger = public_point(&Scalar::random(&mut OsRng));
        assert!(!verify(&stranger, &sig, b"tag", &[b"hello"]));
    }

    #[test]
    fn test_tampered_response_fails() {
        let secret = Scalar::random(&mut OsRng);
        let public_key = public_point(&secret);
        let mut sig = sign(&secret, b"tag", &[b"m"], &mut OsRng).unwrap();
        sig.s += Scalar::ONE;
        assert!(!verify(&public_key, &sig, b"tag", &[b"m"]));
    }
}

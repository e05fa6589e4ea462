//! Hedged deterministic nonce generation
//!
//! The nonce DRBG is a ChaCha20 stream seeded with
//! HMAC-SHA256(secret, tag || parts || fresh randomness). A broken RNG
//! still yields distinct nonces for distinct messages.

use super::tags;
use crate::{Error, Result};
use hmac::{Hmac, Mac};
use k256::{elliptic_curve::Field, Scalar};
use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRngCore, SeedableRng};
use sha2::Sha256;
use zeroize::Zeroize;

/// Derive a non-zero signing nonce bound to `secret` and the signed parts.
pub fn derive_nonce<R: CryptoRngCore>(
    secret: &Scalar,
    tag: &[u8],
    parts: &[&[u8]],
    rng: &mut R,
) -> Result<Scalar> {
    let mut key: [u8; 32] = secret.to_bytes().into();
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(|_| Error::BadDrbgInitialization)?;
    key.zeroize();

    let mut extra = [0u8; 32];
    rng.fill_bytes(&mut extra);

    mac.update(tags::NONCE);
    mac.update(tag);
    for part in parts {
        mac.update(&(part.len() as u32).to_be_bytes());
        mac.update(part);
    }
    mac.update(&extra);

    let mut seed: [u8; 32] = mac.finalize().into_bytes().into();
    let mut drbg = ChaCha20Rng::from_seed(seed);
    seed.zeroize();

    loop {
        let nonce = Scalar::random(&mut drbg);
        if !bool::from(nonce.is_zero()) {
            return Ok(nonce);
        }
    }
}

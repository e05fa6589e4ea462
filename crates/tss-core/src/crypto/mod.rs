//! Curve and field primitives over secp256k1
//!
//! Every hash in the protocol goes through [`hash_to_scalar`] or
//! [`hash_to_point`] with the versioned [`DOMAIN`] prefix, so independent
//! members derive identical challenges and binding factors.

pub mod dleq;
pub mod nonce;
pub mod poly;
pub mod schnorr;

use crate::{Error, Result};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        PrimeField,
    },
    AffinePoint, FieldBytes, ProjectivePoint, Scalar,
};
use sha3::{Digest, Keccak256};

/// Versioned domain-separation prefix for every protocol hash
pub const DOMAIN: &[u8] = b"TSS-SECP256K1-KECCAK256-v1";

/// Compressed SEC1 point length
pub const POINT_LENGTH: usize = 33;

/// Big-endian scalar length
pub const SCALAR_LENGTH: usize = 32;

/// Hash tags, one per protocol use
pub mod tags {
    pub const ROUND1_ONE_TIME: &[u8] = b"round1_one_time";
    pub const ROUND1_A0: &[u8] = b"round1_a0";
    pub const ROUND3_OWN_PUB_KEY: &[u8] = b"round3_own_pub_key";
    pub const SHARE_ENCRYPTION: &[u8] = b"share_encryption";
    pub const COMPLAINT: &[u8] = b"complaint";
    pub const BINDING_FACTOR: &[u8] = b"binding_factor";
    pub const SIGNING_CHALLENGE: &[u8] = b"signing_challenge";
    pub const NONCE: &[u8] = b"nonce";
}

fn framed_hasher(tag: &[u8], parts: &[&[u8]]) -> Keccak256 {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN);
    hasher.update((tag.len() as u32).to_be_bytes());
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher
}

/// Hash tagged, length-framed parts into a scalar (mod n).
pub fn hash_to_scalar(tag: &[u8], parts: &[&[u8]]) -> Scalar {
    let digest = framed_hasher(tag, parts).finalize();
    <Scalar as Reduce<U256>>::reduce_bytes(&digest)
}

/// Hash tagged parts onto the curve by try-and-increment.
///
/// Candidates are x-coordinates with even y; roughly half of all
/// candidates are on the curve, so the loop terminates quickly.
pub fn hash_to_point(tag: &[u8], parts: &[&[u8]]) -> ProjectivePoint {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = framed_hasher(tag, parts);
        hasher.update(counter.to_be_bytes());
        let x = hasher.finalize();

        let mut candidate = [0u8; POINT_LENGTH];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&x);
        if let Ok(point) = decode_point(&candidate) {
            return point;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Compressed SEC1 encoding of a point.
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a compressed point, rejecting malformed encodings and the identity.
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    if bytes.len() != POINT_LENGTH {
        return Err(Error::MalformedSubmission(format!(
            "point must be {} bytes, got {}",
            POINT_LENGTH,
            bytes.len()
        )));
    }
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::MalformedSubmission(e.to_string()))?;
    let affine: AffinePoint = Option::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::MalformedSubmission("point not on curve".into()))?;
    let point = ProjectivePoint::from(affine);
    if point == ProjectivePoint::IDENTITY {
        return Err(Error::MalformedSubmission("identity point".into()));
    }
    Ok(point)
}

/// Decode a list of compressed points.
pub fn decode_points(items: &[Vec<u8>]) -> Result<Vec<ProjectivePoint>> {
    items.iter().map(|bytes| decode_point(bytes)).collect()
}

/// Big-endian encoding of a scalar.
pub fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_LENGTH] {
    scalar.to_bytes().into()
}

/// Decode a canonical big-endian scalar (must be below the group order).
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != SCALAR_LENGTH {
        return Err(Error::MalformedSubmission(format!(
            "scalar must be {} bytes, got {}",
            SCALAR_LENGTH,
            bytes.len()
        )));
    }
    Option::from(Scalar::from_repr(*FieldBytes::from_slice(bytes)))
        .ok_or_else(|| Error::MalformedSubmission("scalar not canonical".into()))
}

/// Public point for a secret scalar.
pub fn public_point(secret: &Scalar) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * secret
}

/// Serde helpers for secret scalars kept in store records
pub(crate) mod scalar_serde {
    use k256::Scalar;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(scalar.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
        super::decode_scalar(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for vectors of secret scalars
pub(crate) mod scalars_serde {
    use k256::Scalar;
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalars: &[Scalar], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(scalars.len()))?;
        for scalar in scalars {
            seq.serialize_element(&hex::encode(scalar.to_bytes()))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Scalar>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items: Vec<String> = Vec::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|text| {
                let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
                super::decode_scalar(&bytes).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_hash_to_scalar_is_deterministic_and_tagged() {
        let a = hash_to_scalar(tags::BINDING_FACTOR, &[b"msg", &[1, 2, 3]]);
        let b = hash_to_scalar(tags::BINDING_FACTOR, &[b"msg", &[1, 2, 3]]);
        let c = hash_to_scalar(tags::SIGNING_CHALLENGE, &[b"msg", &[1, 2, 3]]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_framing_separates_part_boundaries() {
        let a = hash_to_scalar(tags::NONCE, &[b"ab", b"c"]);
        let b = hash_to_scalar(tags::NONCE, &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_to_point_lands_on_curve() {
        let p = hash_to_point(b"test", &[b"seed"]);
        let q = hash_to_point(b"test", &[b"seed"]);
        assert_eq!(p, q);
        assert_eq!(decode_point(&encode_point(&p)).unwrap(), p);
        assert_ne!(p, hash_to_point(b"test", &[b"other"]));
    }

    #[test]
    fn test_point_decoding_rejects_garbage() {
        let point = public_point(&Scalar::random(&mut OsRng));
        let bytes = encode_point(&point);
        assert_eq!(bytes.len(), POINT_LENGTH);
        assert_eq!(decode_point(&bytes).unwrap(), point);

        assert!(matches!(
            decode_point(&bytes[..32]),
            Err(Error::MalformedSubmission(_))
        ));
        let mut bad_tag = bytes.clone();
        bad_tag[0] = 0x05;
        assert!(matches!(
            decode_point(&bad_tag),
            Err(Error::MalformedSubmission(_))
        ));
    }

    #[test]
    fn test_scalar_decoding_rejects_non_canonical() {
        let s = Scalar::random(&mut OsRng);
        assert_eq!(decode_scalar(&encode_scalar(&s)).unwrap(), s);
        assert!(decode_scalar(&[0xff; 32]).is_err());
        assert!(decode_scalar(&[1; 31]).is_err());
    }
}

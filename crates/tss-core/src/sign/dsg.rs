//! Signing computations
//!
//! All functions are deterministic in their inputs: any observer holding
//! the request and the group's public data derives the same context.

use super::{AssignedMember, DeSecret, SignerCommitment, SigningContext, SigningRequest};
use crate::crypto::{self, hash_to_scalar, poly::lagrange_coefficient, schnorr, tags};
use crate::store::GroupKey;
use crate::{Error, Group, GroupId, GroupStatus, MemberId, Result, Signature};
use k256::{ProjectivePoint, Scalar};
use std::collections::{BTreeMap, BTreeSet};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};

/// Canonical encoding of the assigned nonce commitments.
///
/// `Σ (member_id u64 BE || D || E)` in ascending member order.
pub fn commitment_encoding(assigned: &[AssignedMember]) -> Vec<u8> {
    let mut sorted: Vec<&AssignedMember> = assigned.iter().collect();
    sorted.sort_by_key(|a| a.member_id);

    let mut encoding = Vec::with_capacity(sorted.len() * (8 + 2 * crypto::POINT_LENGTH));
    for member in sorted {
        encoding.extend_from_slice(&member.member_id.to_be_bytes());
        encoding.extend_from_slice(&member.pub_de.d);
        encoding.extend_from_slice(&member.pub_de.e);
    }
    encoding
}

/// Binding factor `ρ_i = H(group_id, message, encoding, i)`.
pub fn binding_factor(group_id: GroupId, message: &[u8], encoding: &[u8], member: MemberId) -> Scalar {
    hash_to_scalar(
        tags::BINDING_FACTOR,
        &[&group_id.to_be_bytes(), message, encoding, &member.to_be_bytes()],
    )
}

/// Derive the public signing context for a request.
///
/// # Arguments
/// * `group` - The active group the request targets
/// * `request` - Message and assigned signers with their nonce commitments
///
/// # Returns
/// Binding factors, Lagrange weights, group nonce and challenge
#[instrument(skip_all, fields(signing_id = %request.signing_id, group_id = %group.id))]
pub fn prepare(group: &Group, request: &SigningRequest) -> Result<SigningContext> {
    if request.group_id != group.id {
        return Err(Error::InvalidState(format!(
            "signing {} targets group {}, not {}",
            request.signing_id, request.group_id, group.id
        )));
    }
    if group.status != GroupStatus::Active {
        return Err(Error::InvalidState(format!(
            "group {} is {:?}",
            group.id, group.status
        )));
    }
    let group_public_key = group.public_key_point()?;

    let ids: Vec<MemberId> = request.assigned.iter().map(|a| a.member_id).collect();
    let unique: BTreeSet<MemberId> = ids.iter().copied().collect();
    if unique.len() != ids.len() {
        return Err(Error::InvalidConfig("Duplicate member in signer set".into()));
    }
    if ids.len() < group.threshold {
        return Err(Error::ThresholdNotMet {
            required: group.threshold,
            actual: ids.len(),
        });
    }
    if let Some(outsider) = ids.iter().find(|m| m.0 == 0 || m.0 > group.size as u64) {
        return Err(Error::NotFound(format!(
            "member {} in group {}",
            outsider, group.id
        )));
    }

    let encoding = commitment_encoding(&request.assigned);
    let mut signers = BTreeMap::new();
    let mut group_nonce = ProjectivePoint::IDENTITY;

    for member in &request.assigned {
        let (d, e) = member.pub_de.points()?;
        let commitment = SignerCommitment {
            d,
            e,
            binding_factor: binding_factor(group.id, &request.message, &encoding, member.member_id),
            lagrange: lagrange_coefficient(member.member_id, &ids)?,
        };
        group_nonce += commitment.nonce_point();
        signers.insert(member.member_id, commitment);
    }

    let challenge = schnorr::challenge(
        tags::SIGNING_CHALLENGE,
        &group_nonce,
        &group_public_key,
        &[&request.message],
    );

    debug!(signers = ?ids, "Signing context prepared");
    Ok(SigningContext {
        signing_id: request.signing_id,
        group_id: group.id,
        message: request.message.clone(),
        group_public_key,
        signers,
        group_nonce,
        challenge,
    })
}

/// Compute this member's partial signature `(D_i + ρ_i·E_i, z_i)`.
///
/// The nonce pair must already be consumed from the store for this request.
pub fn compute_partial(ctx: &SigningContext, key: &GroupKey, de: &DeSecret) -> Result<Signature> {
    if key.group_id != ctx.group_id {
        return Err(Error::InvalidState(format!(
            "key share is for group {}, signing targets group {}",
            key.group_id, ctx.group_id
        )));
    }
    let signer = ctx.signer(key.member_id)?;

    let d = crypto::public_point(&de.d);
    let e = crypto::public_point(&de.e);
    if d != signer.d || e != signer.e {
        return Err(Error::InvalidState(format!(
            "nonce pair does not match the one assigned to member {}",
            key.member_id
        )));
    }

    let z = de.d + signer.binding_factor * de.e + signer.lagrange * key.private_share * ctx.challenge;
    Ok(Signature::new(signer.nonce_point(), z))
}

/// Check `z_i·G = (D_i + ρ_i·E_i) + λ_i·c·V_i`.
pub fn verify_partial(
    ctx: &SigningContext,
    member: MemberId,
    public_share: &ProjectivePoint,
    partial: &Signature,
) -> Result<()> {
    let signer = ctx.signer(member)?;
    let expected_nonce = signer.nonce_point();
    let lhs = crypto::public_point(&partial.s);
    let rhs = expected_nonce + *public_share * (signer.lagrange * ctx.challenge);

    let valid = partial.r.ct_eq(&expected_nonce) & lhs.ct_eq(&rhs);
    if !bool::from(valid) {
        return Err(Error::VerificationFailed {
            member,
            reason: "partial signature does not verify".into(),
        });
    }
    Ok(())
}

/// Combine every assigned signer's partial into `(R, Σ z_i)`.
pub fn aggregate(ctx: &SigningContext, partials: &BTreeMap<MemberId, Signature>) -> Result<Signature> {
    if let Some(extra) = partials.keys().find(|m| !ctx.signers.contains_key(m)) {
        return Err(Error::InvalidState(format!(
            "member {} is not assigned to signing {}",
            extra, ctx.signing_id
        )));
    }
    if partials.len() != ctx.signers.len() {
        return Err(Error::ThresholdNotMet {
            required: ctx.signers.len(),
            actual: partials.len(),
        });
    }

    let z = partials.values().fold(Scalar::ZERO, |acc, p| acc + p.s);
    let signature = Signature::new(ctx.group_nonce, z);

    if !verify(&ctx.group_public_key, &ctx.message, &signature) {
        return Err(Error::Internal(format!(
            "aggregate signature for signing {} does not verify",
            ctx.signing_id
        )));
    }
    Ok(signature)
}

/// Verify a group signature: `z·G = R + c·Y`.
pub fn verify(public_key: &ProjectivePoint, message: &[u8], signature: &Signature) -> bool {
    schnorr::verify(public_key, signature, tags::SIGNING_CHALLENGE, &[message])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dealt_group, request_for};
    use rand::rngs::OsRng;
    use rand::Rng;

    fn sign_with(
        group: &Group,
        keys: &[GroupKey],
        signers: &[u64],
        message: &[u8],
    ) -> (SigningContext, BTreeMap<MemberId, Signature>) {
        let (request, des) = request_for(group, signers, message);
        let ctx = prepare(group, &request).unwrap();
        let partials = signers
            .iter()
            .zip(des.iter())
            .map(|(&id, de)| {
                let key = &keys[id as usize - 1];
                (MemberId(id), compute_partial(&ctx, key, de).unwrap())
            })
            .collect();
        (ctx, partials)
    }

    #[test]
    fn test_any_threshold_subset_signs() {
        let (group, keys) = dealt_group(3, 4);
        let public_key = group.public_key_point().unwrap();

        for signers in [&[1, 2, 3][..], &[1, 2, 4], &[2, 3, 4], &[1, 2, 3, 4]] {
            let (ctx, partials) = sign_with(&group, &keys, signers, b"transfer 10");
            for (member, partial) in &partials {
                let share = keys[member.0 as usize - 1].public_share_point().unwrap();
                verify_partial(&ctx, *member, &share, partial).unwrap();
            }
            let signature = aggregate(&ctx, &partials).unwrap();
            assert!(verify(&public_key, b"transfer 10", &signature));
            assert_eq!(signature.to_bytes().len(), crate::SIGNATURE_LENGTH);
        }
    }

    #[test]
    fn test_single_byte_corruption_fails() {
        let (group, keys) = dealt_group(2, 3);
        let public_key = group.public_key_point().unwrap();
        let (ctx, partials) = sign_with(&group, &keys, &[1, 3], b"message");
        let signature = aggregate(&ctx, &partials).unwrap();

        let mut message = b"message".to_vec();
        message[0] ^= 0x01;
        assert!(!verify(&public_key, &message, &signature));

        let mut bytes = signature.to_bytes();
        bytes[64] ^= 0x01;
        if let Ok(tampered) = Signature::from_bytes(&bytes) {
            assert!(!verify(&public_key, b"message", &tampered));
        }
    }

    #[test]
    fn test_random_partial_corruption_is_attributed() {
        let (group, keys) = dealt_group(3, 4);
        let (ctx, mut partials) = sign_with(&group, &keys, &[1, 2, 4], b"payload");

        let victim = [MemberId(1), MemberId(2), MemberId(4)][OsRng.gen_range(0..3)];
        let tweak = Scalar::from(OsRng.gen_range(1u64..u64::MAX));
        partials.get_mut(&victim).unwrap().s += tweak;

        for (member, partial) in &partials {
            let share = keys[member.0 as usize - 1].public_share_point().unwrap();
            let result = verify_partial(&ctx, *member, &share, partial);
            if *member == victim {
                assert_eq!(result.unwrap_err().culprit(), Some(victim));
            } else {
                assert!(result.is_ok());
            }
        }
        assert!(aggregate(&ctx, &partials).is_err());
    }

    #[test]
    fn test_prepare_rejects_bad_assignments() {
        let (group, _) = dealt_group(3, 4);

        let (request, _) = request_for(&group, &[1, 2], b"m");
        assert!(matches!(
            prepare(&group, &request),
            Err(Error::ThresholdNotMet { required: 3, actual: 2 })
        ));

        let (mut request, _) = request_for(&group, &[1, 2, 3], b"m");
        request.assigned[2].member_id = MemberId(1);
        assert!(matches!(prepare(&group, &request), Err(Error::InvalidConfig(_))));

        let (mut request, _) = request_for(&group, &[1, 2, 3], b"m");
        request.assigned[2].member_id = MemberId(9);
        assert!(matches!(prepare(&group, &request), Err(Error::NotFound(_))));

        let (mut request, _) = request_for(&group, &[1, 2, 3], b"m");
        request.assigned[0].pub_de.d.truncate(20);
        assert!(matches!(
            prepare(&group, &request),
            Err(Error::MalformedSubmission(_))
        ));
    }

    #[test]
    fn test_binding_factors_depend_on_commitments() {
        let (group, _) = dealt_group(2, 3);
        let (a, _) = request_for(&group, &[1, 2], b"m");
        let (b, _) = request_for(&group, &[1, 2], b"m");
        let ctx_a = prepare(&group, &a).unwrap();
        let ctx_b = prepare(&group, &b).unwrap();
        assert_ne!(
            ctx_a.signer(MemberId(1)).unwrap().binding_factor,
            ctx_b.signer(MemberId(1)).unwrap().binding_factor
        );
        // Assignment order does not matter
        let mut reversed = a.clone();
        reversed.assigned.reverse();
        assert_eq!(prepare(&group, &reversed).unwrap().challenge, ctx_a.challenge);
    }

    #[test]
    fn test_mismatched_nonce_pair_is_rejected() {
        let (group, keys) = dealt_group(2, 3);
        let (request, _) = request_for(&group, &[1, 2], b"m");
        let ctx = prepare(&group, &request).unwrap();
        let stray = DeSecret::generate(&mut OsRng);
        assert!(matches!(
            compute_partial(&ctx, &keys[0], &stray),
            Err(Error::InvalidState(_))
        ));
    }
}

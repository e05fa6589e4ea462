//! Member-side DKG round computations
//!
//! These functions are pure apart from randomness: callers pass in the
//! ledger's view of each round and persist the returned secrets themselves.

use super::{Complaint, Confirm, DkgSecrets, Round1Info, Round2Info};
use crate::crypto::poly::{evaluate_commitments, Polynomial};
use crate::crypto::{self, hash_to_scalar, schnorr, tags};
use crate::store::GroupKey;
use crate::{DkgContext, Error, Group, MemberId, Result, Signature};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Everything a member produces when it opens Round 1
pub struct Round1Output {
    /// Secrets to persist before broadcasting
    pub secrets: DkgSecrets,
    /// Public data to broadcast
    pub info: Round1Info,
}

/// Round 1 data after syntactic and cryptographic checks
#[derive(Debug, Clone)]
pub struct ParsedRound1 {
    pub member_id: MemberId,
    pub commits: Vec<ProjectivePoint>,
    pub one_time_pub_key: ProjectivePoint,
}

/// Result of checking the shares a member received in Round 2
#[derive(Debug, Default)]
pub struct Round2Verification {
    /// Dealers whose shares verified
    pub valid_dealers: Vec<MemberId>,
    /// Complaints against dealers whose shares did not
    pub complaints: Vec<Complaint>,
}

/// A member's derived key material over a dealer set
#[derive(Clone)]
pub struct KeyMaterial {
    pub private_share: Scalar,
    pub public_share: ProjectivePoint,
    pub group_public_key: ProjectivePoint,
}

fn proof_parts(member_id: MemberId, dkg_context: &DkgContext, key: &ProjectivePoint) -> [Vec<u8>; 3] {
    [
        member_id.to_be_bytes().to_vec(),
        dkg_context.to_vec(),
        crypto::encode_point(key),
    ]
}

fn sign_proof<R: CryptoRngCore>(
    secret: &Scalar,
    tag: &[u8],
    member_id: MemberId,
    dkg_context: &DkgContext,
    rng: &mut R,
) -> Result<Signature> {
    let parts = proof_parts(member_id, dkg_context, &crypto::public_point(secret));
    schnorr::sign(secret, tag, &[&parts[0], &parts[1], &parts[2]], rng)
}

fn verify_proof(
    key: &ProjectivePoint,
    signature: &Signature,
    tag: &[u8],
    member_id: MemberId,
    dkg_context: &DkgContext,
) -> bool {
    let parts = proof_parts(member_id, dkg_context, key);
    schnorr::verify(key, signature, tag, &[&parts[0], &parts[1], &parts[2]])
}

/// Open Round 1: one-time key pair, secret polynomial and both proofs.
#[instrument(skip(group, dkg_context, rng), fields(group_id = %group.id))]
pub fn start_round1<R: CryptoRngCore>(
    group: &Group,
    member_id: MemberId,
    dkg_context: &DkgContext,
    rng: &mut R,
) -> Result<Round1Output> {
    group.check_context(dkg_context)?;
    if member_id.0 == 0 || member_id.0 > group.size as u64 {
        return Err(Error::NotFound(format!(
            "member {} in group {}",
            member_id, group.id
        )));
    }

    let one_time_secret = Scalar::random(&mut *rng);
    let polynomial = Polynomial::random(group.threshold, rng);

    let secrets = DkgSecrets {
        group_id: group.id,
        member_id,
        threshold: group.threshold,
        dkg_context: *dkg_context,
        one_time_secret,
        coefficients: polynomial.coefficients().to_vec(),
    };
    let info = round1_info(&secrets, rng)?;

    debug!(member_id = %member_id, "Round 1 data generated");
    Ok(Round1Output { secrets, info })
}

/// Rebuild the Round 1 broadcast from persisted secrets, with fresh proofs.
pub fn round1_info<R: CryptoRngCore>(secrets: &DkgSecrets, rng: &mut R) -> Result<Round1Info> {
    let polynomial = Polynomial::from_coefficients(secrets.coefficients.clone());
    let commits = polynomial.commitments();
    let (member_id, dkg_context) = (secrets.member_id, &secrets.dkg_context);

    let a0_signature = sign_proof(&polynomial.secret(), tags::ROUND1_A0, member_id, dkg_context, rng)?;
    let one_time_signature =
        sign_proof(&secrets.one_time_secret, tags::ROUND1_ONE_TIME, member_id, dkg_context, rng)?;

    Ok(Round1Info {
        member_id,
        coefficient_commits: commits.iter().map(crypto::encode_point).collect(),
        one_time_pub_key: crypto::encode_point(&crypto::public_point(&secrets.one_time_secret)),
        a0_signature: a0_signature.to_bytes(),
        one_time_signature: one_time_signature.to_bytes(),
    })
}

/// Syntactic parse of Round 1 data; no signature checks.
pub fn parse_round1(info: &Round1Info, threshold: usize) -> Result<ParsedRound1> {
    if info.coefficient_commits.len() != threshold {
        return Err(Error::MalformedSubmission(format!(
            "expected {} coefficient commits, got {}",
            threshold,
            info.coefficient_commits.len()
        )));
    }
    Ok(ParsedRound1 {
        member_id: info.member_id,
        commits: crypto::decode_points(&info.coefficient_commits)?,
        one_time_pub_key: crypto::decode_point(&info.one_time_pub_key)?,
    })
}

/// Verify a Round 1 submission: format first, then both proofs.
pub fn verify_round1(group: &Group, info: &Round1Info) -> Result<ParsedRound1> {
    let parsed = parse_round1(info, group.threshold)?;
    let a0_signature = Signature::from_bytes(&info.a0_signature)?;
    let one_time_signature = Signature::from_bytes(&info.one_time_signature)?;

    if !verify_proof(
        &parsed.commits[0],
        &a0_signature,
        tags::ROUND1_A0,
        info.member_id,
        &group.dkg_context,
    ) {
        return Err(Error::VerificationFailed {
            member: info.member_id,
            reason: "invalid a0 signature".into(),
        });
    }
    if !verify_proof(
        &parsed.one_time_pub_key,
        &one_time_signature,
        tags::ROUND1_ONE_TIME,
        info.member_id,
        &group.dkg_context,
    ) {
        return Err(Error::VerificationFailed {
            member: info.member_id,
            reason: "invalid one-time signature".into(),
        });
    }

    Ok(parsed)
}

/// Position of `receiver`'s share in `sender`'s Round 2 data.
pub fn share_index(qualified: &[MemberId], sender: MemberId, receiver: MemberId) -> Option<usize> {
    if sender == receiver {
        return None;
    }
    let mut receivers: Vec<MemberId> = qualified.iter().copied().filter(|&m| m != sender).collect();
    receivers.sort_unstable();
    receivers.dedup();
    receivers.binary_search(&receiver).ok()
}

fn share_mask(key_sym: &ProjectivePoint, sender: MemberId, receiver: MemberId) -> Scalar {
    hash_to_scalar(
        tags::SHARE_ENCRYPTION,
        &[
            &crypto::encode_point(key_sym),
            &sender.to_be_bytes(),
            &receiver.to_be_bytes(),
        ],
    )
}

/// Mask a share under the pairwise shared key.
pub fn encrypt_share(share: &Scalar, key_sym: &ProjectivePoint, sender: MemberId, receiver: MemberId) -> Scalar {
    share + &share_mask(key_sym, sender, receiver)
}

/// Remove the pairwise mask from a share.
pub fn decrypt_share(
    encrypted: &Scalar,
    key_sym: &ProjectivePoint,
    sender: MemberId,
    receiver: MemberId,
) -> Scalar {
    encrypted - &share_mask(key_sym, sender, receiver)
}

fn sorted_ids(round1: &[Round1Info]) -> Vec<MemberId> {
    let mut ids: Vec<MemberId> = round1.iter().map(|info| info.member_id).collect();
    ids.sort_unstable();
    ids
}

fn find_round1<'a>(round1: &'a [Round1Info], member: MemberId) -> Result<&'a Round1Info> {
    round1
        .iter()
        .find(|info| info.member_id == member)
        .ok_or_else(|| Error::NotFound(format!("round 1 data of member {}", member)))
}

fn find_round2<'a>(round2: &'a [Round2Info], member: MemberId) -> Result<&'a Round2Info> {
    round2
        .iter()
        .find(|info| info.member_id == member)
        .ok_or_else(|| Error::NotFound(format!("round 2 data of member {}", member)))
}

/// Open Round 2: encrypt `f(j)` for every other Round-1-qualified member.
///
/// `round1` is the qualified members' Round 1 data.
#[instrument(skip_all, fields(group_id = %secrets.group_id, member_id = %secrets.member_id))]
pub fn start_round2(secrets: &DkgSecrets, round1: &[Round1Info]) -> Result<Round2Info> {
    let polynomial = Polynomial::from_coefficients(secrets.coefficients.clone());
    let receivers: Vec<MemberId> = sorted_ids(round1)
        .into_iter()
        .filter(|&m| m != secrets.member_id)
        .collect();

    if receivers.len() + 1 != round1.len() {
        return Err(Error::InvalidState(format!(
            "member {} is not in the qualified set",
            secrets.member_id
        )));
    }

    let mut encrypted_secret_shares = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let info = find_round1(round1, receiver)?;
        let their_key = crypto::decode_point(&info.one_time_pub_key)?;
        let key_sym = their_key * secrets.one_time_secret;
        let share = polynomial.evaluate(&receiver.scalar());
        let encrypted = encrypt_share(&share, &key_sym, secrets.member_id, receiver);
        encrypted_secret_shares.push(crypto::encode_scalar(&encrypted).to_vec());
    }

    debug!(shares = encrypted_secret_shares.len(), "Round 2 shares encrypted");
    Ok(Round2Info {
        member_id: secrets.member_id,
        encrypted_secret_shares,
    })
}

/// Decrypt and Feldman-check the share `dealer` sent to this member.
fn received_share(
    secrets: &DkgSecrets,
    dealer: &ParsedRound1,
    round2: &Round2Info,
    qualified: &[MemberId],
) -> Result<(Scalar, bool)> {
    let index = share_index(qualified, dealer.member_id, secrets.member_id).ok_or_else(|| {
        Error::NotFound(format!(
            "share for member {} from member {}",
            secrets.member_id, dealer.member_id
        ))
    })?;
    let encrypted_bytes = round2.encrypted_secret_shares.get(index).ok_or_else(|| {
        Error::MalformedSubmission(format!(
            "member {} sent too few shares",
            dealer.member_id
        ))
    })?;
    let encrypted = crypto::decode_scalar(encrypted_bytes)?;
    let key_sym = dealer.one_time_pub_key * secrets.one_time_secret;
    let share = decrypt_share(&encrypted, &key_sym, dealer.member_id, secrets.member_id);

    let expected = evaluate_commitments(&dealer.commits, &secrets.member_id.scalar());
    Ok((share, crypto::public_point(&share) == expected))
}

/// Check every share received from `dealers`; bad ones become complaints.
///
/// `qualified` is the Round-1-qualified set that fixed the share layout.
#[instrument(skip_all, fields(group_id = %secrets.group_id, member_id = %secrets.member_id))]
pub fn verify_round2<R: CryptoRngCore>(
    secrets: &DkgSecrets,
    round1: &[Round1Info],
    round2: &[Round2Info],
    qualified: &[MemberId],
    dealers: &[MemberId],
    rng: &mut R,
) -> Result<Round2Verification> {
    let mut result = Round2Verification::default();

    for &dealer_id in dealers.iter().filter(|&&m| m != secrets.member_id) {
        let dealer = parse_round1(find_round1(round1, dealer_id)?, secrets.threshold)?;
        let dealer_round2 = find_round2(round2, dealer_id)?;
        let (_, valid) = received_share(secrets, &dealer, dealer_round2, qualified)?;

        if valid {
            result.valid_dealers.push(dealer_id);
        } else {
            warn!(dealer = %dealer_id, "Share failed Feldman verification");
            result.complaints.push(super::make_complaint(
                secrets,
                dealer_id,
                &dealer.one_time_pub_key,
                rng,
            )?);
        }
    }

    Ok(result)
}

/// Sum of dealers' commitments, coefficient by coefficient.
pub fn accumulated_commits(round1: &[Round1Info], dealers: &[MemberId], threshold: usize) -> Result<Vec<ProjectivePoint>> {
    let mut accumulated = vec![ProjectivePoint::IDENTITY; threshold];
    for &dealer in dealers {
        let parsed = parse_round1(find_round1(round1, dealer)?, threshold)?;
        for (acc, commit) in accumulated.iter_mut().zip(parsed.commits.iter()) {
            *acc += commit;
        }
    }
    Ok(accumulated)
}

/// Group public key: the sum of the dealers' constant-term commitments.
pub fn group_public_key(round1: &[Round1Info], dealers: &[MemberId], threshold: usize) -> Result<ProjectivePoint> {
    let accumulated = accumulated_commits(round1, dealers, threshold)?;
    accumulated
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidConfig("threshold must be at least 1".into()))
}

/// Derive this member's private share and check it against public data.
pub fn derive_key(
    secrets: &DkgSecrets,
    round1: &[Round1Info],
    round2: &[Round2Info],
    qualified: &[MemberId],
    dealers: &[MemberId],
) -> Result<KeyMaterial> {
    if !dealers.contains(&secrets.member_id) {
        return Err(Error::InvalidState(format!(
            "member {} is not a dealer",
            secrets.member_id
        )));
    }

    let polynomial = Polynomial::from_coefficients(secrets.coefficients.clone());
    let mut private_share = polynomial.evaluate(&secrets.member_id.scalar());

    for &dealer_id in dealers.iter().filter(|&&m| m != secrets.member_id) {
        let dealer = parse_round1(find_round1(round1, dealer_id)?, secrets.threshold)?;
        let (share, valid) = received_share(secrets, &dealer, find_round2(round2, dealer_id)?, qualified)?;
        if !valid {
            return Err(Error::VerificationFailed {
                member: dealer_id,
                reason: "share does not match commitments".into(),
            });
        }
        private_share += share;
    }

    let accumulated = accumulated_commits(round1, dealers, secrets.threshold)?;
    let group_public_key = accumulated[0];
    let public_share = crypto::public_point(&private_share);
    let expected_share = evaluate_commitments(&accumulated, &secrets.member_id.scalar());

    if public_share != expected_share {
        return Err(Error::InconsistentGroupKey(format!(
            "member {} derived a share inconsistent with the dealers' commitments",
            secrets.member_id
        )));
    }

    Ok(KeyMaterial {
        private_share,
        public_share,
        group_public_key,
    })
}

/// Round 3: derive the key share and sign its public point.
#[instrument(skip_all, fields(group_id = %secrets.group_id, member_id = %secrets.member_id))]
pub fn confirm<R: CryptoRngCore>(
    secrets: &DkgSecrets,
    round1: &[Round1Info],
    round2: &[Round2Info],
    qualified: &[MemberId],
    dealers: &[MemberId],
    rng: &mut R,
) -> Result<(Confirm, KeyMaterial)> {
    let material = derive_key(secrets, round1, round2, qualified, dealers)?;
    let signature = sign_proof(
        &material.private_share,
        tags::ROUND3_OWN_PUB_KEY,
        secrets.member_id,
        &secrets.dkg_context,
        rng,
    )?;

    let mut sorted_dealers = dealers.to_vec();
    sorted_dealers.sort_unstable();

    debug!(dealers = sorted_dealers.len(), "Confirmation signed");
    Ok((
        Confirm {
            member_id: secrets.member_id,
            dealers: sorted_dealers,
            own_pub_key_signature: signature.to_bytes(),
        },
        material,
    ))
}

/// Verify a confirmation against the member's public share.
pub fn verify_confirm(group: &Group, confirm: &Confirm, public_share: &ProjectivePoint) -> Result<()> {
    let signature = Signature::from_bytes(&confirm.own_pub_key_signature)?;
    if !verify_proof(
        public_share,
        &signature,
        tags::ROUND3_OWN_PUB_KEY,
        confirm.member_id,
        &group.dkg_context,
    ) {
        return Err(Error::VerificationFailed {
            member: confirm.member_id,
            reason: "invalid own public key signature".into(),
        });
    }
    Ok(())
}

/// Recompute the key over the announced dealer set and check it against the
/// announced group key before the single write to the store.
pub fn finalize(
    secrets: &DkgSecrets,
    round1: &[Round1Info],
    round2: &[Round2Info],
    qualified: &[MemberId],
    dealers: &[MemberId],
    announced_key: &ProjectivePoint,
) -> Result<GroupKey> {
    let material = derive_key(secrets, round1, round2, qualified, dealers)?;
    if &material.group_public_key != announced_key {
        return Err(Error::InconsistentGroupKey(format!(
            "local key {} differs from announced key {}",
            hex::encode(crypto::encode_point(&material.group_public_key)),
            hex::encode(crypto::encode_point(announced_key))
        )));
    }

    info!(
        group_id = %secrets.group_id,
        member_id = %secrets.member_id,
        public_key = hex::encode(crypto::encode_point(announced_key)),
        "Group key finalized"
    );

    Ok(GroupKey {
        group_id: secrets.group_id,
        member_id: secrets.member_id,
        threshold: secrets.threshold,
        private_share: material.private_share,
        public_key: crypto::encode_point(&material.group_public_key),
        public_share: crypto::encode_point(&material.public_share),
    })
}

/// Per-member public shares derived from accumulated commitments.
pub(crate) fn public_shares(
    accumulated: &[ProjectivePoint],
    members: &[MemberId],
) -> BTreeMap<MemberId, ProjectivePoint> {
    #[cfg(feature = "multi-thread")]
    {
        use rayon::prelude::*;
        members
            .par_iter()
            .map(|&m| (m, evaluate_commitments(accumulated, &m.scalar())))
            .collect()
    }
    #[cfg(not(feature = "multi-thread"))]
    {
        members
            .iter()
            .map(|&m| (m, evaluate_commitments(accumulated, &m.scalar())))
            .collect()
    }
}

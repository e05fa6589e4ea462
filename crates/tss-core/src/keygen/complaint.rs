//! Complaints against dealers and their adjudication
//!
//! A complainant reveals the pairwise key it shares with the accused dealer
//! and proves it was derived from its own one-time secret. Anyone can then
//! decrypt the disputed share and check it against the dealer's commitments.

use super::{decrypt_share, Complaint, DkgSecrets};
use crate::crypto::dleq::DleqProof;
use crate::crypto::poly::evaluate_commitments;
use crate::crypto::{self};
use crate::{MemberId, Result};
use k256::ProjectivePoint;
use rand_core::CryptoRngCore;
use tracing::debug;

/// Public data needed to settle one complaint
#[derive(Debug, Clone)]
pub struct ComplaintEvidence<'a> {
    /// Complainant's one-time public key from Round 1
    pub complainant_key: &'a ProjectivePoint,
    /// Respondent's one-time public key from Round 1
    pub respondent_key: &'a ProjectivePoint,
    /// Respondent's coefficient commitments
    pub respondent_commits: &'a [ProjectivePoint],
    /// Encrypted share the respondent addressed to the complainant
    pub encrypted_share: &'a [u8],
}

/// Which side of a complaint is at fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RespondentMalicious(MemberId),
    ComplainantMalicious(MemberId),
}

impl Verdict {
    pub fn culprit(self) -> MemberId {
        match self {
            Verdict::RespondentMalicious(m) | Verdict::ComplainantMalicious(m) => m,
        }
    }
}

/// Build a complaint against `respondent`.
pub fn make_complaint<R: CryptoRngCore>(
    secrets: &DkgSecrets,
    respondent: MemberId,
    respondent_key: &ProjectivePoint,
    rng: &mut R,
) -> Result<Complaint> {
    let key_sym = *respondent_key * secrets.one_time_secret;
    let proof = DleqProof::prove(&secrets.one_time_secret, respondent_key, rng)?;

    Ok(Complaint {
        complainant: secrets.member_id,
        respondent,
        key_sym: crypto::encode_point(&key_sym),
        proof: proof.to_bytes(),
    })
}

/// Decide a complaint from public data alone.
///
/// A complaint that cannot be parsed, whose proof fails, or whose disputed
/// share turns out to be valid condemns the complainant.
pub fn adjudicate(complaint: &Complaint, evidence: &ComplaintEvidence<'_>) -> Verdict {
    let complainant = Verdict::ComplainantMalicious(complaint.complainant);
    let respondent = Verdict::RespondentMalicious(complaint.respondent);

    let key_sym = match crypto::decode_point(&complaint.key_sym) {
        Ok(point) => point,
        Err(_) => return complainant,
    };
    let proof = match DleqProof::from_bytes(&complaint.proof) {
        Ok(proof) => proof,
        Err(_) => return complainant,
    };
    if !proof.verify(evidence.complainant_key, evidence.respondent_key, &key_sym) {
        debug!(complainant = %complaint.complainant, "Complaint proof rejected");
        return complainant;
    }

    let encrypted = match crypto::decode_scalar(evidence.encrypted_share) {
        Ok(scalar) => scalar,
        Err(_) => return respondent,
    };
    let share = decrypt_share(&encrypted, &key_sym, complaint.respondent, complaint.complainant);
    let expected = evaluate_commitments(evidence.respondent_commits, &complaint.complainant.scalar());

    if crypto::public_point(&share) == expected {
        complainant
    } else {
        respondent
    }
}

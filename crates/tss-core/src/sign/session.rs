//! Public-side bookkeeping for one signing request

use super::{aggregate, verify_partial, SigningContext, SigningRequest};
use crate::{Address, Error, MemberId, Result, Signature};
use chrono::{DateTime, Utc};
use k256::ProjectivePoint;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStatus {
    Waiting,
    Completed,
    Failed,
}

/// Terminal result of a signing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    Completed(Signature),
    Failed {
        culprit: Option<MemberId>,
        reason: String,
    },
}

/// Collects and verifies partial signatures for one request
#[derive(Debug)]
pub struct SigningSession {
    context: SigningContext,
    addresses: BTreeMap<MemberId, Address>,
    public_shares: BTreeMap<MemberId, ProjectivePoint>,
    partials: BTreeMap<MemberId, Signature>,
    status: SigningStatus,
    signature: Option<Signature>,
    deadline: Option<DateTime<Utc>>,
}

impl SigningSession {
    /// `public_shares` must cover every assigned signer.
    pub fn new(
        context: SigningContext,
        request: &SigningRequest,
        public_shares: BTreeMap<MemberId, ProjectivePoint>,
    ) -> Result<Self> {
        if let Some(missing) = context.signers.keys().find(|m| !public_shares.contains_key(m)) {
            return Err(Error::NotFound(format!("public share of member {}", missing)));
        }
        let addresses = request
            .assigned
            .iter()
            .map(|a| (a.member_id, a.address.clone()))
            .collect();

        Ok(Self {
            context,
            addresses,
            public_shares,
            partials: BTreeMap::new(),
            status: SigningStatus::Waiting,
            signature: None,
            deadline: None,
        })
    }

    pub fn context(&self) -> &SigningContext {
        &self.context
    }

    pub fn status(&self) -> SigningStatus {
        self.status
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Members whose partial has not arrived yet
    pub fn pending(&self) -> Vec<MemberId> {
        self.addresses
            .keys()
            .filter(|m| !self.partials.contains_key(m))
            .copied()
            .collect()
    }

    pub fn set_deadline(&mut self, deadline: DateTime<Utc>) {
        self.deadline = Some(deadline);
    }

    fn fail(&mut self, culprit: Option<MemberId>, reason: String) -> SigningOutcome {
        warn!(
            signing_id = %self.context.signing_id,
            culprit = ?culprit,
            %reason,
            "Signing failed"
        );
        self.status = SigningStatus::Failed;
        SigningOutcome::Failed { culprit, reason }
    }

    /// Accept one partial signature; an invalid one fails the session.
    pub fn submit_partial(
        &mut self,
        sender: &str,
        member: MemberId,
        partial: &[u8],
    ) -> Result<Option<SigningOutcome>> {
        if self.status != SigningStatus::Waiting {
            return Err(Error::InvalidState(format!(
                "signing {} is {:?}",
                self.context.signing_id, self.status
            )));
        }
        let address = self.addresses.get(&member).ok_or_else(|| {
            Error::NotFound(format!(
                "member {} in signing {}",
                member, self.context.signing_id
            ))
        })?;
        if address != sender {
            return Err(Error::Unauthorized(format!(
                "{} is not bound to member {}",
                sender, member
            )));
        }
        if self.partials.contains_key(&member) {
            return Err(Error::DuplicateSubmission(format!(
                "partial signature of member {}",
                member
            )));
        }

        let partial = Signature::from_bytes(partial)?;
        let public_share = self.public_shares[&member];
        if let Err(err) = verify_partial(&self.context, member, &public_share, &partial) {
            return match err {
                Error::VerificationFailed { member, reason } => Ok(Some(self.fail(Some(member), reason))),
                other => Err(other),
            };
        }

        debug!(signing_id = %self.context.signing_id, member_id = %member, "Partial signature accepted");
        self.partials.insert(member, partial);
        if self.partials.len() < self.addresses.len() {
            return Ok(None);
        }

        match aggregate(&self.context, &self.partials) {
            Ok(signature) => {
                info!(signing_id = %self.context.signing_id, "Signature aggregated");
                self.status = SigningStatus::Completed;
                self.signature = Some(signature);
                Ok(Some(SigningOutcome::Completed(signature)))
            }
            Err(err) => Ok(Some(self.fail(None, err.to_string()))),
        }
    }

    /// Fail the session if its deadline has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<SigningOutcome> {
        if self.status != SigningStatus::Waiting {
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let pending = self.pending();
        Some(self.fail(None, format!("expired, missing partials from {:?}", pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::{compute_partial, prepare, verify};
    use crate::testing::{dealt_group, request_for};

    #[test]
    fn test_session_completes_with_all_partials() {
        let (group, keys) = dealt_group(3, 4);
        let (request, des) = request_for(&group, &[1, 2, 4], b"hello");
        let ctx = prepare(&group, &request).unwrap();
        let shares = keys
            .iter()
            .map(|k| (k.member_id, k.public_share_point().unwrap()))
            .collect();
        let mut session = SigningSession::new(ctx.clone(), &request, shares).unwrap();

        let mut outcome = None;
        for (assigned, de) in request.assigned.iter().zip(des.iter()) {
            let key = &keys[assigned.member_id.0 as usize - 1];
            let partial = compute_partial(&ctx, key, de).unwrap();
            assert_eq!(outcome, None);
            outcome = session
                .submit_partial(&assigned.address, assigned.member_id, &partial.to_bytes())
                .unwrap();
        }

        match outcome {
            Some(SigningOutcome::Completed(signature)) => {
                assert!(verify(&group.public_key_point().unwrap(), b"hello", &signature));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.status(), SigningStatus::Completed);
    }

    #[test]
    fn test_bad_partial_fails_session() {
        let (group, keys) = dealt_group(2, 3);
        let (request, des) = request_for(&group, &[2, 3], b"hello");
        let ctx = prepare(&group, &request).unwrap();
        let shares = keys
            .iter()
            .map(|k| (k.member_id, k.public_share_point().unwrap()))
            .collect();
        let mut session = SigningSession::new(ctx.clone(), &request, shares).unwrap();

        let first = &request.assigned[0];
        assert!(matches!(
            session.submit_partial("someone-else", first.member_id, &[0; 65]),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            session.submit_partial(&first.address, first.member_id, &[0; 10]),
            Err(Error::MalformedSubmission(_))
        ));

        // Member 3 signs with member 2's key
        let second = &request.assigned[1];
        let mut borrowed = keys[1].clone();
        borrowed.member_id = second.member_id;
        let wrong = compute_partial(&ctx, &borrowed, &des[1]).unwrap();
        let outcome = session
            .submit_partial(&second.address, second.member_id, &wrong.to_bytes())
            .unwrap();
        assert!(matches!(
            outcome,
            Some(SigningOutcome::Failed { culprit: Some(MemberId(3)), .. })
        ));
        assert!(session.submit_partial(&first.address, first.member_id, &[0; 65]).is_err());
    }

    #[test]
    fn test_expiry() {
        let (group, keys) = dealt_group(2, 2);
        let (request, _) = request_for(&group, &[1, 2], b"x");
        let ctx = prepare(&group, &request).unwrap();
        let shares = keys
            .iter()
            .map(|k| (k.member_id, k.public_share_point().unwrap()))
            .collect();
        let mut session = SigningSession::new(ctx, &request, shares).unwrap();
        assert_eq!(session.expire(Utc::now()), None);

        let now = Utc::now();
        session.set_deadline(now);
        assert!(matches!(session.expire(now), Some(SigningOutcome::Failed { culprit: None, .. })));
        assert_eq!(session.status(), SigningStatus::Failed);
    }
}

//! Public-side DKG bookkeeping for one group
//!
//! Every observer of the ordered log can run a [`GroupSession`]: it only
//! touches public data, verifies each submission as it arrives and decides
//! when a round is complete, who is excluded and when the group activates.

use super::dkg::public_shares;
use super::{
    adjudicate, share_index, verify_confirm, verify_round1, Complaint, ComplaintEvidence, Confirm,
    ParsedRound1, Round1Info, Round2Info,
};
use crate::crypto::{self, poly::evaluate_commitments};
use crate::{Address, Error, Group, GroupStatus, Member, MemberId, Result};
use chrono::{DateTime, Utc};
use k256::ProjectivePoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// When a group in `Confirming` becomes active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmPolicy {
    /// Every dealer must confirm
    #[default]
    All,
    /// Any `threshold` dealers suffice
    Threshold,
}

/// Observable change in a group's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Round1Completed {
        qualified: Vec<MemberId>,
    },
    Round2Completed {
        dealers: Vec<MemberId>,
    },
    /// Members were excluded while confirming; confirmations start over
    QualifiedSetChanged {
        dealers: Vec<MemberId>,
        excluded: Vec<MemberId>,
    },
    Activated {
        public_key: Vec<u8>,
        dealers: Vec<MemberId>,
    },
    Failed {
        reason: String,
    },
}

/// Public state machine of one group's DKG
#[derive(Debug)]
pub struct GroupSession {
    group: Group,
    members: BTreeMap<MemberId, Member>,
    policy: ConfirmPolicy,
    round1: BTreeMap<MemberId, Round1Info>,
    parsed: BTreeMap<MemberId, ParsedRound1>,
    qualified: Vec<MemberId>,
    round2: BTreeMap<MemberId, Round2Info>,
    dealers: BTreeSet<MemberId>,
    complaints: BTreeSet<(MemberId, MemberId)>,
    confirms: BTreeMap<MemberId, Confirm>,
    deadline: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl GroupSession {
    /// Open Round 1 for `group`, binding member `i` to `addresses[i - 1]`.
    pub fn new(mut group: Group, addresses: Vec<Address>, policy: ConfirmPolicy) -> Result<Self> {
        if addresses.len() != group.size {
            return Err(Error::InvalidConfig(format!(
                "group {} needs {} addresses, got {}",
                group.id,
                group.size,
                addresses.len()
            )));
        }
        let unique: BTreeSet<&Address> = addresses.iter().collect();
        if unique.len() != addresses.len() {
            return Err(Error::InvalidConfig("Duplicate member address".into()));
        }

        let members = group
            .member_ids()
            .zip(addresses)
            .map(|(id, address)| (id, Member::new(id, group.id, address)))
            .collect();
        group.status = GroupStatus::Round1Pending;

        Ok(Self {
            group,
            members,
            policy,
            round1: BTreeMap::new(),
            parsed: BTreeMap::new(),
            qualified: Vec::new(),
            round2: BTreeMap::new(),
            dealers: BTreeSet::new(),
            complaints: BTreeSet::new(),
            confirms: BTreeMap::new(),
            deadline: None,
            failure: None,
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn status(&self) -> GroupStatus {
        self.group.status
    }

    pub fn policy(&self) -> ConfirmPolicy {
        self.policy
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Round-1-qualified members, fixed when Round 1 completes
    pub fn qualified(&self) -> &[MemberId] {
        &self.qualified
    }

    /// Current dealer set
    pub fn dealers(&self) -> Vec<MemberId> {
        self.dealers.iter().copied().collect()
    }

    /// Members flagged as malicious so far
    pub fn malicious(&self) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.is_malicious)
            .map(|m| m.id)
            .collect()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: DateTime<Utc>) {
        self.deadline = Some(deadline);
    }

    /// Accepted Round 1 data of members that are still honest
    pub fn round1_infos(&self) -> Vec<Round1Info> {
        self.round1
            .values()
            .filter(|info| self.is_honest(info.member_id))
            .cloned()
            .collect()
    }

    /// Accepted Round 2 data
    pub fn round2_infos(&self) -> Vec<Round2Info> {
        self.round2.values().cloned().collect()
    }

    /// Public verification point of an activated member
    pub fn public_share(&self, id: MemberId) -> Result<ProjectivePoint> {
        let bytes = self
            .members
            .get(&id)
            .and_then(|m| m.public_key.as_ref())
            .ok_or_else(|| Error::NotFound(format!("public share of member {}", id)))?;
        crypto::decode_point(bytes)
    }

    fn is_honest(&self, id: MemberId) -> bool {
        self.members.get(&id).map(Member::is_honest).unwrap_or(false)
    }

    fn honest_count(&self) -> usize {
        self.members.values().filter(|m| m.is_honest()).count()
    }

    fn expect_status(&self, expected: GroupStatus) -> Result<()> {
        if self.group.status != expected {
            return Err(Error::InvalidState(format!(
                "group {} is {:?}, expected {:?}",
                self.group.id, self.group.status, expected
            )));
        }
        Ok(())
    }

    fn authorize(&self, sender: &str, id: MemberId) -> Result<()> {
        let member = self
            .members
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("member {} in group {}", id, self.group.id)))?;
        if member.address != sender {
            return Err(Error::Unauthorized(format!(
                "{} is not bound to member {}",
                sender, id
            )));
        }
        if !member.is_honest() {
            return Err(Error::InvalidState(format!("member {} is excluded", id)));
        }
        Ok(())
    }

    fn flag(&mut self, id: MemberId, reason: &str) {
        if let Some(member) = self.members.get_mut(&id) {
            warn!(group_id = %self.group.id, member_id = %id, reason, "Member flagged as malicious");
            member.is_malicious = true;
        }
        self.dealers.remove(&id);
    }

    fn fail(&mut self, reason: String) -> Transition {
        warn!(group_id = %self.group.id, %reason, "Group failed");
        self.group.status = GroupStatus::Failed;
        self.failure = Some(reason.clone());
        Transition::Failed { reason }
    }

    fn exhausted(&mut self, remaining: usize) -> Transition {
        let err = Error::ResourceExhausted {
            required: self.group.threshold,
            remaining,
        };
        self.fail(err.to_string())
    }

    /// Accept a Round 1 submission.
    pub fn submit_round1(&mut self, sender: &str, info: Round1Info) -> Result<Option<Transition>> {
        self.expect_status(GroupStatus::Round1Pending)?;
        self.authorize(sender, info.member_id)?;
        if self.round1.contains_key(&info.member_id) {
            return Err(Error::DuplicateSubmission(format!(
                "round 1 of member {}",
                info.member_id
            )));
        }

        match verify_round1(&self.group, &info) {
            Ok(parsed) => {
                if let Some(member) = self.members.get_mut(&info.member_id) {
                    member.one_time_pub_key = Some(info.one_time_pub_key.clone());
                    member.coefficient_commits = info.coefficient_commits.clone();
                }
                debug!(group_id = %self.group.id, member_id = %info.member_id, "Round 1 accepted");
                self.parsed.insert(info.member_id, parsed);
                self.round1.insert(info.member_id, info);
            }
            Err(Error::VerificationFailed { member, reason }) => self.flag(member, &reason),
            Err(e) => return Err(e),
        }

        if self.honest_count() < self.group.threshold {
            return Ok(Some(self.exhausted(self.honest_count())));
        }
        let pending = self
            .members
            .values()
            .any(|m| m.is_honest() && !self.round1.contains_key(&m.id));
        if pending {
            return Ok(None);
        }

        self.qualified = self.parsed.keys().copied().collect();
        self.group.status = GroupStatus::Round2Pending;
        info!(group_id = %self.group.id, qualified = ?self.qualified, "Round 1 completed");
        Ok(Some(Transition::Round1Completed {
            qualified: self.qualified.clone(),
        }))
    }

    /// Accept a Round 2 submission.
    pub fn submit_round2(&mut self, sender: &str, info: Round2Info) -> Result<Option<Transition>> {
        self.expect_status(GroupStatus::Round2Pending)?;
        self.authorize(sender, info.member_id)?;
        if !self.qualified.contains(&info.member_id) {
            return Err(Error::InvalidState(format!(
                "member {} did not qualify in round 1",
                info.member_id
            )));
        }
        if self.round2.contains_key(&info.member_id) {
            return Err(Error::DuplicateSubmission(format!(
                "round 2 of member {}",
                info.member_id
            )));
        }
        let expected = self.qualified.len() - 1;
        if info.encrypted_secret_shares.len() != expected {
            return Err(Error::MalformedSubmission(format!(
                "expected {} encrypted shares, got {}",
                expected,
                info.encrypted_secret_shares.len()
            )));
        }
        for share in &info.encrypted_secret_shares {
            crypto::decode_scalar(share)?;
        }

        debug!(group_id = %self.group.id, member_id = %info.member_id, "Round 2 accepted");
        self.round2.insert(info.member_id, info);

        if self.qualified.iter().any(|m| !self.round2.contains_key(m)) {
            return Ok(None);
        }

        self.dealers = self.qualified.iter().copied().collect();
        self.group.status = GroupStatus::Confirming;
        info!(group_id = %self.group.id, "Round 2 completed");
        Ok(Some(Transition::Round2Completed {
            dealers: self.dealers(),
        }))
    }

    /// Adjudicate a batch of complaints from one member.
    pub fn submit_complaints(&mut self, sender: &str, complaints: &[Complaint]) -> Result<Option<Transition>> {
        self.expect_status(GroupStatus::Confirming)?;
        let complainant = complaints
            .first()
            .map(|c| c.complainant)
            .ok_or_else(|| Error::MalformedSubmission("empty complaint list".into()))?;
        self.authorize(sender, complainant)?;
        if !self.dealers.contains(&complainant) {
            return Err(Error::InvalidState(format!(
                "member {} is not a dealer",
                complainant
            )));
        }

        let mut respondents = BTreeSet::new();
        for complaint in complaints {
            if complaint.complainant != complainant || complaint.respondent == complainant {
                return Err(Error::MalformedSubmission(format!(
                    "complaint {} -> {} in a batch from member {}",
                    complaint.complainant, complaint.respondent, complainant
                )));
            }
            if !self.dealers.contains(&complaint.respondent) {
                return Err(Error::InvalidState(format!(
                    "member {} is not a dealer",
                    complaint.respondent
                )));
            }
            if !respondents.insert(complaint.respondent)
                || self.complaints.contains(&(complainant, complaint.respondent))
            {
                return Err(Error::DuplicateSubmission(format!(
                    "complaint {} -> {}",
                    complainant, complaint.respondent
                )));
            }
        }

        let mut excluded = BTreeSet::new();
        for complaint in complaints {
            self.complaints.insert((complainant, complaint.respondent));
            let verdict = self.adjudicate(complaint)?;
            info!(
                group_id = %self.group.id,
                complainant = %complainant,
                respondent = %complaint.respondent,
                ?verdict,
                "Complaint adjudicated"
            );
            excluded.insert(verdict.culprit());
        }

        Ok(Some(self.exclude(excluded.into_iter().collect())))
    }

    fn adjudicate(&self, complaint: &Complaint) -> Result<super::Verdict> {
        let complainant = self.parsed_round1(complaint.complainant)?;
        let respondent = self.parsed_round1(complaint.respondent)?;
        let index = share_index(&self.qualified, complaint.respondent, complaint.complainant)
            .ok_or_else(|| Error::Internal("complaint outside the qualified set".into()))?;
        let encrypted_share = self
            .round2
            .get(&complaint.respondent)
            .and_then(|info| info.encrypted_secret_shares.get(index))
            .ok_or_else(|| {
                Error::NotFound(format!("share from member {}", complaint.respondent))
            })?;

        let evidence = ComplaintEvidence {
            complainant_key: &complainant.one_time_pub_key,
            respondent_key: &respondent.one_time_pub_key,
            respondent_commits: &respondent.commits,
            encrypted_share,
        };
        Ok(adjudicate(complaint, &evidence))
    }

    fn parsed_round1(&self, id: MemberId) -> Result<&ParsedRound1> {
        self.parsed
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("round 1 data of member {}", id)))
    }

    /// Drop `excluded` from the dealer set and restart confirmation.
    fn exclude(&mut self, excluded: Vec<MemberId>) -> Transition {
        for &id in &excluded {
            self.flag(id, "excluded during confirmation");
        }
        if self.dealers.len() < self.group.threshold {
            return self.exhausted(self.dealers.len());
        }
        self.confirms.clear();
        Transition::QualifiedSetChanged {
            dealers: self.dealers(),
            excluded,
        }
    }

    fn accumulated(&self) -> Vec<ProjectivePoint> {
        let mut accumulated = vec![ProjectivePoint::IDENTITY; self.group.threshold];
        for parsed in self.dealers.iter().filter_map(|id| self.parsed.get(id)) {
            for (acc, commit) in accumulated.iter_mut().zip(parsed.commits.iter()) {
                *acc += commit;
            }
        }
        accumulated
    }

    /// Accept a confirmation; confirmations over a stale dealer set are ignored.
    pub fn submit_confirm(&mut self, sender: &str, confirm: Confirm) -> Result<Option<Transition>> {
        self.expect_status(GroupStatus::Confirming)?;
        self.authorize(sender, confirm.member_id)?;
        if !self.dealers.contains(&confirm.member_id) {
            return Err(Error::InvalidState(format!(
                "member {} is not a dealer",
                confirm.member_id
            )));
        }
        if confirm.dealers != self.dealers() {
            debug!(
                group_id = %self.group.id,
                member_id = %confirm.member_id,
                "Ignoring confirmation over a stale dealer set"
            );
            return Ok(None);
        }
        if self.confirms.contains_key(&confirm.member_id) {
            return Err(Error::DuplicateSubmission(format!(
                "confirmation of member {}",
                confirm.member_id
            )));
        }

        let accumulated = self.accumulated();
        let public_share = evaluate_commitments(&accumulated, &confirm.member_id.scalar());
        match verify_confirm(&self.group, &confirm, &public_share) {
            Ok(()) => {}
            Err(Error::VerificationFailed { member, .. }) => {
                return Ok(Some(self.exclude(vec![member])));
            }
            Err(e) => return Err(e),
        }

        debug!(group_id = %self.group.id, member_id = %confirm.member_id, "Confirmation accepted");
        self.confirms.insert(confirm.member_id, confirm);

        let ready = match self.policy {
            ConfirmPolicy::All => self.confirms.len() == self.dealers.len(),
            ConfirmPolicy::Threshold => self.confirms.len() >= self.group.threshold,
        };
        if !ready {
            return Ok(None);
        }
        self.activate(&accumulated).map(Some)
    }

    fn activate(&mut self, accumulated: &[ProjectivePoint]) -> Result<Transition> {
        let public_key = accumulated
            .first()
            .copied()
            .ok_or_else(|| Error::Internal("empty commitments".into()))?;
        self.group.set_public_key(&public_key)?;

        let dealers = self.dealers();
        for (id, share) in public_shares(accumulated, &dealers) {
            if let Some(member) = self.members.get_mut(&id) {
                member.public_key = Some(crypto::encode_point(&share));
            }
        }
        self.group.status = GroupStatus::Active;

        let encoded = crypto::encode_point(&public_key);
        info!(
            group_id = %self.group.id,
            public_key = hex::encode(&encoded),
            dealers = ?dealers,
            "Group activated"
        );
        Ok(Transition::Activated {
            public_key: encoded,
            dealers,
        })
    }

    /// Fail the group if its round deadline has passed.
    ///
    /// Members that still owed a submission are marked inactive.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.group.status.is_terminal() {
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let status = self.group.status;
        let missing: Vec<MemberId> = self
            .members
            .values()
            .filter(|m| m.is_honest())
            .filter(|m| match status {
                GroupStatus::Round1Pending => !self.round1.contains_key(&m.id),
                GroupStatus::Round2Pending => {
                    self.qualified.contains(&m.id) && !self.round2.contains_key(&m.id)
                }
                GroupStatus::Confirming => {
                    self.dealers.contains(&m.id) && !self.confirms.contains_key(&m.id)
                }
                _ => false,
            })
            .map(|m| m.id)
            .collect();
        for id in &missing {
            if let Some(member) = self.members.get_mut(id) {
                member.is_active = false;
            }
        }

        Some(self.fail(format!("{:?} expired, missing {:?}", status, missing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::{confirm, group_public_key, start_round1, start_round2, verify_round2, DkgSecrets};
    use crate::GroupId;
    use k256::Scalar;
    use rand::rngs::OsRng;

    fn address(id: MemberId) -> String {
        format!("member-{}", id)
    }

    struct Fixture {
        session: GroupSession,
        secrets: Vec<DkgSecrets>,
        round1: Vec<Round1Info>,
    }

    fn fixture(threshold: usize, size: usize, policy: ConfirmPolicy) -> Fixture {
        let group = Group::new(GroupId(9), threshold, size, [3; 32]).unwrap();
        let addresses = group.member_ids().map(address).collect();
        let session = GroupSession::new(group.clone(), addresses, policy).unwrap();

        let mut secrets = Vec::new();
        let mut round1 = Vec::new();
        for id in group.member_ids() {
            let out = start_round1(&group, id, &group.dkg_context, &mut OsRng).unwrap();
            secrets.push(out.secrets);
            round1.push(out.info);
        }
        Fixture { session, secrets, round1 }
    }

    fn run_round1(f: &mut Fixture) -> Option<Transition> {
        let mut last = None;
        for info in f.round1.clone() {
            last = f.session.submit_round1(&address(info.member_id), info).unwrap();
        }
        last
    }

    fn run_round2(f: &mut Fixture) -> Vec<Round2Info> {
        let round1 = f.session.round1_infos();
        f.secrets
            .iter()
            .map(|s| start_round2(s, &round1).unwrap())
            .collect()
    }

    fn submit_round2(f: &mut Fixture, round2: Vec<Round2Info>) -> Option<Transition> {
        let mut last = None;
        for info in round2 {
            last = f.session.submit_round2(&address(info.member_id), info).unwrap();
        }
        last
    }

    fn confirm_all(f: &mut Fixture) -> Option<Transition> {
        let round1 = f.session.round1_infos();
        let round2 = f.session.round2_infos();
        let qualified = f.session.qualified().to_vec();
        let dealers = f.session.dealers();
        let mut last = None;
        for s in f.secrets.iter().filter(|s| dealers.contains(&s.member_id)) {
            let (msg, _) = confirm(s, &round1, &round2, &qualified, &dealers, &mut OsRng).unwrap();
            last = f.session.submit_confirm(&address(s.member_id), msg).unwrap();
        }
        last
    }

    #[test]
    fn test_happy_path_activates() {
        let mut f = fixture(3, 4, ConfirmPolicy::All);
        assert_eq!(
            run_round1(&mut f),
            Some(Transition::Round1Completed {
                qualified: (1..=4).map(MemberId).collect()
            })
        );
        let round2 = run_round2(&mut f);
        assert!(matches!(
            submit_round2(&mut f, round2),
            Some(Transition::Round2Completed { .. })
        ));

        let expected = group_public_key(&f.round1, f.session.qualified(), 3).unwrap();
        match confirm_all(&mut f) {
            Some(Transition::Activated { public_key, dealers }) => {
                assert_eq!(public_key, crypto::encode_point(&expected));
                assert_eq!(dealers.len(), 4);
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(f.session.status(), GroupStatus::Active);
        assert_eq!(f.session.group().public_key_point().unwrap(), expected);
        assert!(f.session.public_share(MemberId(2)).is_ok());
    }

    #[test]
    fn test_round1_replay_and_phase_errors() {
        let mut f = fixture(2, 3, ConfirmPolicy::All);
        let info = f.round1[0].clone();
        assert_eq!(f.session.submit_round1("member-1", info.clone()).unwrap(), None);
        assert!(matches!(
            f.session.submit_round1("member-1", info.clone()),
            Err(Error::DuplicateSubmission(_))
        ));
        let mut impostor = f.round1[1].clone();
        impostor.member_id = MemberId(1);
        assert!(matches!(
            f.session.submit_round1("member-2", impostor),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            f.session.submit_round2(
                "member-1",
                Round2Info {
                    member_id: MemberId(1),
                    encrypted_secret_shares: vec![]
                }
            ),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_forged_round1_excludes_member() {
        let mut f = fixture(2, 3, ConfirmPolicy::All);
        f.round1[2].a0_signature = f.round1[1].a0_signature.clone();
        match run_round1(&mut f) {
            Some(Transition::Round1Completed { qualified }) => {
                assert_eq!(qualified, vec![MemberId(1), MemberId(2)]);
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(f.session.malicious(), vec![MemberId(3)]);
        assert_eq!(f.session.round1_infos().len(), 2);
    }

    #[test]
    fn test_malformed_round1_is_not_flagged() {
        let mut f = fixture(2, 3, ConfirmPolicy::All);
        let mut info = f.round1[0].clone();
        info.one_time_pub_key = vec![0; 5];
        assert!(matches!(
            f.session.submit_round1("member-1", info),
            Err(Error::MalformedSubmission(_))
        ));
        assert!(f.session.malicious().is_empty());
        // A corrected submission is still accepted
        assert!(f.session.submit_round1("member-1", f.round1[0].clone()).is_ok());
    }

    #[test]
    fn test_too_many_forgeries_exhaust_group() {
        let mut f = fixture(3, 4, ConfirmPolicy::All);
        f.round1[0].one_time_signature = f.round1[3].one_time_signature.clone();
        f.round1[1].one_time_signature = f.round1[3].one_time_signature.clone();
        assert!(matches!(run_round1(&mut f), Some(Transition::Failed { .. })));
        assert_eq!(f.session.status(), GroupStatus::Failed);
        assert!(f.session.failure().unwrap().contains("required 3"));
    }

    #[test]
    fn test_justified_complaint_removes_dealer() {
        let mut f = fixture(3, 4, ConfirmPolicy::All);
        run_round1(&mut f);
        let mut round2 = run_round2(&mut f);

        let qualified = f.session.qualified().to_vec();
        let index = share_index(&qualified, MemberId(1), MemberId(3)).unwrap();
        let bad = crypto::decode_scalar(&round2[0].encrypted_secret_shares[index]).unwrap() + Scalar::ONE;
        round2[0].encrypted_secret_shares[index] = crypto::encode_scalar(&bad).to_vec();
        submit_round2(&mut f, round2);

        let round1 = f.session.round1_infos();
        let round2 = f.session.round2_infos();
        let dealers = f.session.dealers();
        let report = verify_round2(&f.secrets[2], &round1, &round2, &qualified, &dealers, &mut OsRng).unwrap();
        assert_eq!(report.complaints.len(), 1);

        // A confirmation over the original set, then the complaint lands
        let (early, _) = confirm(&f.secrets[1], &round1, &round2, &qualified, &dealers, &mut OsRng).unwrap();
        f.session.submit_confirm("member-2", early.clone()).unwrap();

        let transition = f.session.submit_complaints("member-3", &report.complaints).unwrap();
        assert_eq!(
            transition,
            Some(Transition::QualifiedSetChanged {
                dealers: vec![MemberId(2), MemberId(3), MemberId(4)],
                excluded: vec![MemberId(1)],
            })
        );

        // The early confirmation is stale now
        assert_eq!(f.session.submit_confirm("member-2", early).unwrap(), None);
        assert!(matches!(
            f.session.submit_complaints("member-3", &report.complaints),
            Err(Error::InvalidState(_))
        ));

        let expected = group_public_key(&round1, &f.session.dealers(), 3).unwrap();
        match confirm_all(&mut f) {
            Some(Transition::Activated { public_key, dealers }) => {
                assert_eq!(public_key, crypto::encode_point(&expected));
                assert_eq!(dealers, vec![MemberId(2), MemberId(3), MemberId(4)]);
            }
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn test_false_complaint_removes_complainant() {
        let mut f = fixture(2, 3, ConfirmPolicy::All);
        run_round1(&mut f);
        let round2 = run_round2(&mut f);
        submit_round2(&mut f, round2);

        let dealer_key = crypto::decode_point(&f.round1[0].one_time_pub_key).unwrap();
        let complaint =
            crate::keygen::make_complaint(&f.secrets[1], MemberId(1), &dealer_key, &mut OsRng).unwrap();
        let transition = f.session.submit_complaints("member-2", &[complaint]).unwrap();
        assert!(matches!(
            transition,
            Some(Transition::QualifiedSetChanged { ref excluded, .. }) if excluded == &vec![MemberId(2)]
        ));
        assert!(matches!(confirm_all(&mut f), Some(Transition::Activated { .. })));
    }

    #[test]
    fn test_threshold_policy_activates_early() {
        let mut f = fixture(2, 4, ConfirmPolicy::Threshold);
        run_round1(&mut f);
        let round2 = run_round2(&mut f);
        submit_round2(&mut f, round2);

        let round1 = f.session.round1_infos();
        let round2 = f.session.round2_infos();
        let qualified = f.session.qualified().to_vec();
        let dealers = f.session.dealers();
        let (first, _) = confirm(&f.secrets[0], &round1, &round2, &qualified, &dealers, &mut OsRng).unwrap();
        let (second, _) = confirm(&f.secrets[3], &round1, &round2, &qualified, &dealers, &mut OsRng).unwrap();
        assert_eq!(f.session.submit_confirm("member-1", first).unwrap(), None);
        assert!(matches!(
            f.session.submit_confirm("member-4", second).unwrap(),
            Some(Transition::Activated { .. })
        ));
    }

    #[test]
    fn test_expiry_fails_group_and_marks_missing() {
        let mut f = fixture(2, 3, ConfirmPolicy::All);
        let now = Utc::now();
        f.session.set_deadline(now);
        f.session.submit_round1("member-1", f.round1[0].clone()).unwrap();

        assert_eq!(f.session.expire(now - chrono::Duration::seconds(1)), None);
        assert!(matches!(f.session.expire(now), Some(Transition::Failed { .. })));
        assert!(!f.session.member(MemberId(2)).unwrap().is_active);
        assert!(f.session.member(MemberId(1)).unwrap().is_active);
        assert_eq!(f.session.expire(now), None);
    }
}

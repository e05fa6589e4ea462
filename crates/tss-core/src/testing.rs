//! Shared fixtures for unit tests

use crate::keygen::{finalize, group_public_key, start_round1, start_round2};
use crate::sign::{AssignedMember, DeSecret, SigningRequest};
use crate::store::GroupKey;
use crate::{Group, GroupId, GroupStatus, MemberId, SigningId};
use rand::rngs::OsRng;

/// An active group with every member's finalized key share.
pub(crate) fn dealt_group(threshold: usize, size: usize) -> (Group, Vec<GroupKey>) {
    let mut group = Group::new(GroupId(1), threshold, size, [11; 32]).unwrap();
    let ids: Vec<MemberId> = group.member_ids().collect();

    let mut secrets = Vec::new();
    let mut round1 = Vec::new();
    for &id in &ids {
        let out = start_round1(&group, id, &group.dkg_context, &mut OsRng).unwrap();
        secrets.push(out.secrets);
        round1.push(out.info);
    }
    let round2: Vec<_> = secrets
        .iter()
        .map(|s| start_round2(s, &round1).unwrap())
        .collect();

    let public_key = group_public_key(&round1, &ids, threshold).unwrap();
    let keys = secrets
        .iter()
        .map(|s| finalize(s, &round1, &round2, &ids, &ids, &public_key).unwrap())
        .collect();

    group.set_public_key(&public_key).unwrap();
    group.status = GroupStatus::Active;
    (group, keys)
}

/// A signing request for `signers` with fresh nonce pairs, in signer order.
pub(crate) fn request_for(group: &Group, signers: &[u64], message: &[u8]) -> (SigningRequest, Vec<DeSecret>) {
    let des: Vec<DeSecret> = signers.iter().map(|_| DeSecret::generate(&mut OsRng)).collect();
    let assigned = signers
        .iter()
        .zip(des.iter())
        .map(|(&id, de)| AssignedMember {
            member_id: MemberId(id),
            address: format!("member-{}", id),
            pub_de: de.public(),
        })
        .collect();

    let request = SigningRequest {
        signing_id: SigningId(1),
        group_id: group.id,
        message: message.to_vec(),
        assigned,
    };
    (request, des)
}

//! Signing request types

use super::DePublic;
use crate::{Address, GroupId, MemberId, SigningId};
use serde::{Deserialize, Serialize};

/// A signer picked for a request, with the nonce pair reserved for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedMember {
    pub member_id: MemberId,
    pub address: Address,
    pub pub_de: DePublic,
}

/// Request for a group signature over `message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub signing_id: SigningId,
    pub group_id: GroupId,
    pub message: Vec<u8>,
    pub assigned: Vec<AssignedMember>,
}

impl SigningRequest {
    /// Assignment for `address`, if it was picked
    pub fn assignment(&self, address: &str) -> Option<&AssignedMember> {
        self.assigned.iter().find(|a| a.address == address)
    }
}

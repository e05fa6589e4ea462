//! Interface to the ordered ledger
//!
//! The ledger totally orders submissions, runs the public DKG and signing
//! bookkeeping and announces the results as sequenced events. Members only
//! see it through this trait.

use crate::keygen::{Round1Info, Round2Info};
use crate::sign::SigningRequest;
use crate::{Group, GroupId, Member, MemberId, Result, Signature, SigningId, TssMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use ::async_trait::async_trait;

/// Events the ledger announces, in commit order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    GroupCreated {
        group: Group,
        members: Vec<Member>,
    },
    Round1Completed {
        group_id: GroupId,
        qualified: Vec<MemberId>,
    },
    Round2Completed {
        group_id: GroupId,
        dealers: Vec<MemberId>,
    },
    QualifiedSetChanged {
        group_id: GroupId,
        dealers: Vec<MemberId>,
        excluded: Vec<MemberId>,
    },
    GroupActivated {
        group_id: GroupId,
        public_key: Vec<u8>,
        dealers: Vec<MemberId>,
    },
    GroupFailed {
        group_id: GroupId,
        reason: String,
    },
    SigningRequested {
        request: SigningRequest,
    },
    SigningCompleted {
        signing_id: SigningId,
        group_id: GroupId,
        signature: Signature,
    },
    SigningFailed {
        signing_id: SigningId,
        group_id: GroupId,
        culprit: Option<MemberId>,
        reason: String,
    },
}

impl LedgerEvent {
    /// Group the event concerns
    pub fn group_id(&self) -> GroupId {
        match self {
            LedgerEvent::GroupCreated { group, .. } => group.id,
            LedgerEvent::SigningRequested { request } => request.group_id,
            LedgerEvent::Round1Completed { group_id, .. }
            | LedgerEvent::Round2Completed { group_id, .. }
            | LedgerEvent::QualifiedSetChanged { group_id, .. }
            | LedgerEvent::GroupActivated { group_id, .. }
            | LedgerEvent::GroupFailed { group_id, .. }
            | LedgerEvent::SigningCompleted { group_id, .. }
            | LedgerEvent::SigningFailed { group_id, .. } => *group_id,
        }
    }

    /// Signing request the event concerns, if any
    pub fn signing_id(&self) -> Option<SigningId> {
        match self {
            LedgerEvent::SigningRequested { request } => Some(request.signing_id),
            LedgerEvent::SigningCompleted { signing_id, .. }
            | LedgerEvent::SigningFailed { signing_id, .. } => Some(*signing_id),
            _ => None,
        }
    }

    /// Whether no further events follow for this group or request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerEvent::GroupActivated { .. }
                | LedgerEvent::GroupFailed { .. }
                | LedgerEvent::SigningCompleted { .. }
                | LedgerEvent::SigningFailed { .. }
        )
    }
}

/// An event with its position in the ledger's total order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequenced {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: LedgerEvent,
}

/// Public view of a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group: Group,
    pub members: Vec<Member>,
    /// Round-1-qualified members; empty until Round 1 completes
    pub qualified: Vec<MemberId>,
    /// Current dealer set; empty until Round 2 completes
    pub dealers: Vec<MemberId>,
}

/// Ledger access used by participants
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a message on behalf of `sender`.
    async fn submit(&self, sender: &str, message: TssMessage) -> Result<()>;

    /// Subscribe to events committed from now on.
    fn subscribe(&self) -> broadcast::Receiver<Sequenced>;

    /// Events with a sequence number above `seq`, for catching up.
    async fn events_since(&self, seq: u64) -> Result<Vec<Sequenced>>;

    async fn group(&self, group_id: GroupId) -> Result<GroupInfo>;

    /// Accepted Round 1 data of the group's honest members
    async fn round1_infos(&self, group_id: GroupId) -> Result<Vec<Round1Info>>;

    /// Accepted Round 2 data
    async fn round2_infos(&self, group_id: GroupId) -> Result<Vec<Round2Info>>;
}

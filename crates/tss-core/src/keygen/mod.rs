//! Distributed Key Generation (DKG) module
//!
//! Member-side round computations live in [`dkg`] and [`complaint`]; the
//! public bookkeeping that every observer of the ledger runs is
//! [`GroupSession`].
//!
//! ```text
//! Created ─► Round1Pending ─► Round2Pending ─► Confirming ─► Active
//!                 │                 │               │
//!                 └─────────────────┴───────────────┴──────► Failed
//! ```

mod complaint;
mod dkg;
mod messages;
mod session;

pub use complaint::{adjudicate, make_complaint, ComplaintEvidence, Verdict};
pub use dkg::{
    accumulated_commits, confirm, decrypt_share, derive_key, encrypt_share, finalize,
    group_public_key, parse_round1, round1_info, share_index, start_round1, start_round2, verify_confirm, verify_round1,
    verify_round2, KeyMaterial, ParsedRound1, Round1Output, Round2Verification,
};
pub use messages::*;
pub use session::{ConfirmPolicy, GroupSession, Transition};

use crate::crypto::{scalar_serde, scalars_serde};
use crate::{DkgContext, GroupId, MemberId};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Per-group secrets a member holds while the DKG is running
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DkgSecrets {
    #[zeroize(skip)]
    pub group_id: GroupId,

    #[zeroize(skip)]
    pub member_id: MemberId,

    #[zeroize(skip)]
    pub threshold: usize,

    #[zeroize(skip)]
    pub dkg_context: DkgContext,

    /// Secret behind the one-time public key
    #[serde(with = "scalar_serde")]
    pub one_time_secret: Scalar,

    /// Polynomial coefficients, constant term first
    #[serde(with = "scalars_serde")]
    pub coefficients: Vec<Scalar>,
}

impl std::fmt::Debug for DkgSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgSecrets")
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

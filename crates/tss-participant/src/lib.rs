//! # TSS Participant
//!
//! A participant node follows the ledger's event stream and drives its own
//! side of every group it belongs to:
//!
//! - opens Round 1 when a group is created, persisting secrets first
//! - deals shares once Round 1 completes
//! - checks received shares, then complains or confirms
//! - stores the final key share once the group activates
//! - answers signing requests it is assigned to and keeps nonce pairs
//!   published
//!
//! Events are routed to one task per group and one per signing request, so
//! a slow group never holds up another.

mod config;
mod handlers;
mod participant;
mod retry;

pub use config::{ParticipantConfig, RetryPolicy};
pub use participant::Participant;
pub use retry::with_retry;

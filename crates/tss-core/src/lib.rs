//! # TSS Core
//!
//! Core engines for threshold Schnorr signatures over secp256k1.
//!
//! This crate provides the fundamental building blocks for:
//! - Distributed Key Generation (DKG) with complaints and confirmation
//! - Threshold signing with one-time nonce pairs
//! - A secret store for nonce pairs and key shares
//! - The ledger interface participants are driven by
//!
//! ## Protocol Overview
//!
//! Any T of N members produce a signature `(R, z)` that verifies as an
//! ordinary Schnorr signature, `z·G = R + c·Y`, against the group key `Y`.
//! No member ever holds the group's private key.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tss_core::{keygen, sign};
//!
//! // Member side of Round 1
//! let out = keygen::start_round1(&group, member_id, &group.dkg_context, &mut OsRng)?;
//!
//! // Partial signature for an assigned request
//! let ctx = sign::prepare(&group, &request)?;
//! let partial = sign::compute_partial(&ctx, &key, &de)?;
//! ```

pub mod crypto;
pub mod error;
pub mod keygen;
pub mod ledger;
pub mod sign;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use types::{
    Address, DkgContext, Group, GroupId, GroupStatus, Member, MemberId, Signature, SigningId,
    TssMessage, MAX_GROUP_SIZE, SIGNATURE_LENGTH,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Per-group and per-request event handlers
//!
//! Each handler owns one bounded queue and processes its events strictly in
//! ledger order. Fatal errors halt the handler; recoverable ones are logged
//! and the next event is processed.

use crate::participant::Node;
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use tss_core::keygen::{self, DkgSecrets, Round1Info};
use tss_core::ledger::LedgerEvent;
use tss_core::sign::{self, SigningRequest};
use tss_core::store::GroupKey;
use tss_core::{crypto, Error, Group, GroupId, Member, MemberId, Result, TssMessage};

/// Drives this node's side of one group's DKG.
pub(crate) struct GroupHandler {
    node: Arc<Node>,
    group_id: GroupId,
    member_id: Option<MemberId>,
    finished: bool,
}

impl GroupHandler {
    pub(crate) fn new(node: Arc<Node>, group_id: GroupId) -> Self {
        Self {
            node,
            group_id,
            member_id: None,
            finished: false,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<LedgerEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                if e.is_fatal() {
                    error!(group_id = %self.group_id, error = %e, "Halting group");
                    break;
                }
                if e.is_recoverable() {
                    warn!(group_id = %self.group_id, error = %e, "Ignoring group event");
                } else {
                    error!(group_id = %self.group_id, error = %e, "Group event failed");
                }
            }
            if self.finished {
                break;
            }
        }
        debug!(group_id = %self.group_id, "Group handler stopped");
    }

    fn member_id(&self) -> Result<MemberId> {
        self.member_id
            .ok_or_else(|| Error::InvalidState(format!("group {} was never announced", self.group_id)))
    }

    fn secrets(&self) -> Result<DkgSecrets> {
        self.node
            .store
            .dkg(self.group_id)?
            .ok_or_else(|| Error::NotFound(format!("DKG secrets for group {}", self.group_id)))
    }

    /// Round 1 data of the qualified members
    async fn round1(&self, qualified: &[MemberId]) -> Result<Vec<Round1Info>> {
        let mut round1 = self.node.ledger.round1_infos(self.group_id).await?;
        round1.retain(|info| qualified.contains(&info.member_id));
        Ok(round1)
    }

    /// Stop taking part; the DKG secrets are no longer needed.
    fn leave(&mut self, reason: &str) -> Result<()> {
        warn!(group_id = %self.group_id, reason, "Leaving group");
        self.finished = true;
        self.node.store.delete_dkg(self.group_id)
    }

    async fn handle(&mut self, event: LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::GroupCreated { group, members } => self.on_created(group, &members).await,
            LedgerEvent::Round1Completed { qualified, .. } => self.on_round1_completed(&qualified).await,
            LedgerEvent::Round2Completed { dealers, .. } => self.on_dealers(&dealers).await,
            LedgerEvent::QualifiedSetChanged { dealers, excluded, .. } => {
                info!(group_id = %self.group_id, excluded = ?excluded, "Dealer set changed");
                self.on_dealers(&dealers).await
            }
            LedgerEvent::GroupActivated {
                public_key, dealers, ..
            } => self.on_activated(&public_key, &dealers).await,
            LedgerEvent::GroupFailed { reason, .. } => self.leave(&reason),
            other => {
                debug!(event = ?other, "Unexpected event for group handler");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(group_id = %group.id))]
    async fn on_created(&mut self, group: Group, members: &[Member]) -> Result<()> {
        let member = members
            .iter()
            .find(|m| m.address == self.node.config.address)
            .ok_or_else(|| Error::Unauthorized(format!("not a member of group {}", group.id)))?;
        self.member_id = Some(member.id);

        if self.node.store.group_key(group.id)?.is_some() {
            debug!("Key share already held");
            self.finished = true;
            return Ok(());
        }

        // Secrets are persisted before anything is broadcast
        let round1 = match self.node.store.dkg(group.id)? {
            Some(secrets) => keygen::round1_info(&secrets, &mut OsRng)?,
            None => {
                let out = keygen::start_round1(&group, member.id, &group.dkg_context, &mut OsRng)?;
                self.node.store.put_dkg(out.secrets)?;
                out.info
            }
        };

        info!(member_id = %member.id, threshold = group.threshold, size = group.size, "Starting DKG");
        self.node
            .submit(TssMessage::SubmitRound1 {
                group_id: group.id,
                round1,
            })
            .await
    }

    async fn on_round1_completed(&mut self, qualified: &[MemberId]) -> Result<()> {
        let member_id = self.member_id()?;
        if !qualified.contains(&member_id) {
            return self.leave("excluded in round 1");
        }

        let secrets = self.secrets()?;
        let round1 = self.round1(qualified).await?;
        let round2 = keygen::start_round2(&secrets, &round1)?;

        info!(group_id = %self.group_id, qualified = qualified.len(), "Submitting round 2");
        self.node
            .submit(TssMessage::SubmitRound2 {
                group_id: self.group_id,
                round2,
            })
            .await
    }

    /// Check the shares from `dealers`; complain or confirm.
    async fn on_dealers(&mut self, dealers: &[MemberId]) -> Result<()> {
        let member_id = self.member_id()?;
        if !dealers.contains(&member_id) {
            return self.leave("excluded from the dealer set");
        }

        let secrets = self.secrets()?;
        let info = self.node.ledger.group(self.group_id).await?;
        let round1 = self.round1(&info.qualified).await?;
        let round2 = self.node.ledger.round2_infos(self.group_id).await?;

        let checked = keygen::verify_round2(&secrets, &round1, &round2, &info.qualified, dealers, &mut OsRng)?;
        if !checked.complaints.is_empty() {
            let accused: Vec<MemberId> = checked.complaints.iter().map(|c| c.respondent).collect();
            warn!(group_id = %self.group_id, accused = ?accused, "Filing complaints");
            return self
                .node
                .submit(TssMessage::Complain {
                    group_id: self.group_id,
                    complaints: checked.complaints,
                })
                .await;
        }

        let (confirm, material) = keygen::confirm(&secrets, &round1, &round2, &info.qualified, dealers, &mut OsRng)?;
        info!(
            group_id = %self.group_id,
            dealers = dealers.len(),
            public_share = hex::encode(crypto::encode_point(&material.public_share)),
            "Confirming key share"
        );
        self.node
            .submit(TssMessage::Confirm {
                group_id: self.group_id,
                confirm,
            })
            .await
    }

    async fn on_activated(&mut self, public_key: &[u8], dealers: &[MemberId]) -> Result<()> {
        let member_id = self.member_id()?;
        if !dealers.contains(&member_id) {
            return self.leave("not among the final dealers");
        }
        self.finished = true;

        let announced = crypto::decode_point(public_key)?;
        let secrets = self.secrets()?;
        let info = self.node.ledger.group(self.group_id).await?;
        let round1 = self.round1(&info.qualified).await?;
        let round2 = self.node.ledger.round2_infos(self.group_id).await?;

        let key = keygen::finalize(&secrets, &round1, &round2, &info.qualified, dealers, &announced)?;
        match self.node.store.set_group_key(key) {
            Ok(()) | Err(Error::DuplicateSubmission(_)) => {}
            Err(e) => return Err(e),
        }
        self.node.store.delete_dkg(self.group_id)?;

        info!(
            group_id = %self.group_id,
            member_id = %member_id,
            public_key = hex::encode(public_key),
            "DKG completed, key share stored"
        );
        Ok(())
    }
}

/// Answers one signing request this node was assigned to.
pub(crate) struct SigningHandler {
    node: Arc<Node>,
}

impl SigningHandler {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub(crate) async fn run(self, mut events: mpsc::Receiver<LedgerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LedgerEvent::SigningRequested { request } => {
                    let signing_id = request.signing_id;
                    match self.sign(&request).await {
                        Ok(()) => self.node.top_up_des().await,
                        Err(e) if e.is_fatal() => {
                            error!(signing_id = %signing_id, error = %e, "Refusing to sign");
                            break;
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!(signing_id = %signing_id, error = %e, "Skipping signing request")
                        }
                        Err(e) => error!(signing_id = %signing_id, error = %e, "Signing failed"),
                    }
                }
                LedgerEvent::SigningCompleted {
                    signing_id, signature, ..
                } => {
                    info!(
                        signing_id = %signing_id,
                        signature = hex::encode(signature.to_bytes()),
                        "Signature aggregated"
                    );
                    break;
                }
                LedgerEvent::SigningFailed {
                    signing_id,
                    culprit,
                    reason,
                    ..
                } => {
                    warn!(signing_id = %signing_id, culprit = ?culprit, reason, "Signing request failed");
                    break;
                }
                other => debug!(event = ?other, "Unexpected event for signing handler"),
            }
        }
    }

    /// Group key share, waiting briefly for a DKG still being finalized.
    async fn group_key(&self, group_id: GroupId) -> Result<GroupKey> {
        let store = &self.node.store;
        crate::with_retry(&self.node.config.retry, "group key", || async move {
            store
                .group_key(group_id)?
                .ok_or_else(|| Error::Timeout(format!("key share for group {}", group_id)))
        })
        .await
    }

    #[instrument(skip_all, fields(signing_id = %request.signing_id, group_id = %request.group_id))]
    async fn sign(&self, request: &SigningRequest) -> Result<()> {
        let assigned = request
            .assignment(&self.node.config.address)
            .ok_or_else(|| Error::Unauthorized(format!("not assigned to signing {}", request.signing_id)))?;
        let key = self.group_key(request.group_id).await?;
        if key.member_id != assigned.member_id {
            return Err(Error::Unauthorized(format!(
                "assigned as member {} but holds the share of member {}",
                assigned.member_id, key.member_id
            )));
        }

        // The nonce pair is spent from here on, whether or not the partial lands
        let de = self.node.store.consume_de(&assigned.pub_de, request.signing_id)?;

        let info = self.node.ledger.group(request.group_id).await?;
        let ctx = sign::prepare(&info.group, request)?;
        let partial = sign::compute_partial(&ctx, &key, &de)?;

        info!(member_id = %assigned.member_id, signers = ctx.signers.len(), "Submitting partial signature");
        self.node
            .submit(TssMessage::SubmitSignature {
                signing_id: request.signing_id,
                member_id: assigned.member_id,
                signature: partial.to_bytes(),
            })
            .await
    }
}

//! In-memory ledger implementation

use crate::{LedgerConfig, LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use rand::{rngs::OsRng, seq::SliceRandom, RngCore};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};
use tss_core::keygen::{GroupSession, Round1Info, Round2Info, Transition};
use tss_core::ledger::{async_trait, GroupInfo, Ledger, LedgerEvent, Sequenced};
use tss_core::sign::{self, AssignedMember, DePublic, SigningOutcome, SigningRequest, SigningSession};
use tss_core::{Address, Error, Group, GroupId, GroupStatus, MemberId, Signature, SigningId, TssMessage};

/// Counters and the event log; holding the lock is what orders submissions.
#[derive(Default)]
struct Order {
    next_seq: u64,
    next_group: u64,
    next_signing: u64,
    log: Vec<Sequenced>,
}

/// In-memory ledger for local groups and tests
pub struct MemoryLedger {
    config: LedgerConfig,
    order: Mutex<Order>,
    groups: DashMap<GroupId, GroupSession>,
    signings: DashMap<SigningId, SigningSession>,
    /// Published nonce pairs per address, oldest first
    des: DashMap<Address, VecDeque<DePublic>>,
    /// Every nonce pair ever queued; a pair is handed out at most once
    known_des: DashSet<String>,
    /// Digests of recently accepted submissions and when they were accepted
    seen: DashMap<String, DateTime<Utc>>,
    events: broadcast::Sender<Sequenced>,
}

fn submission_id(sender: &str, message: &TssMessage) -> tss_core::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_bytes());
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(message)?);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

fn group_event(group_id: GroupId, transition: Transition) -> LedgerEvent {
    match transition {
        Transition::Round1Completed { qualified } => LedgerEvent::Round1Completed { group_id, qualified },
        Transition::Round2Completed { dealers } => LedgerEvent::Round2Completed { group_id, dealers },
        Transition::QualifiedSetChanged { dealers, excluded } => LedgerEvent::QualifiedSetChanged {
            group_id,
            dealers,
            excluded,
        },
        Transition::Activated { public_key, dealers } => LedgerEvent::GroupActivated {
            group_id,
            public_key,
            dealers,
        },
        Transition::Failed { reason } => LedgerEvent::GroupFailed { group_id, reason },
    }
}

fn signing_event(signing_id: SigningId, group_id: GroupId, outcome: SigningOutcome) -> LedgerEvent {
    match outcome {
        SigningOutcome::Completed(signature) => LedgerEvent::SigningCompleted {
            signing_id,
            group_id,
            signature,
        },
        SigningOutcome::Failed { culprit, reason } => LedgerEvent::SigningFailed {
            signing_id,
            group_id,
            culprit,
            reason,
        },
    }
}

impl MemoryLedger {
    /// Create a new in-memory ledger
    pub fn new(config: LedgerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            order: Mutex::new(Order::default()),
            groups: DashMap::new(),
            signings: DashMap::new(),
            des: DashMap::new(),
            known_des: DashSet::new(),
            seen: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn emit(&self, order: &mut Order, event: LedgerEvent) {
        order.next_seq += 1;
        let sequenced = Sequenced {
            seq: order.next_seq,
            timestamp: Utc::now(),
            event,
        };
        debug!(seq = sequenced.seq, event = ?sequenced.event, "Event committed");
        order.log.push(sequenced.clone());
        // No subscribers is fine; the log keeps the event for catch-up
        let _ = self.events.send(sequenced);
    }

    fn round_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.config.round_timeout_secs)
    }

    /// Register a group whose member `i` is bound to `addresses[i - 1]`.
    #[instrument(skip(self, addresses), fields(size = addresses.len()))]
    pub async fn create_group(&self, threshold: usize, addresses: Vec<Address>) -> Result<GroupId> {
        let mut order = self.order.lock().await;
        let group_id = GroupId(order.next_group + 1);

        let mut dkg_context = [0u8; 32];
        OsRng.fill_bytes(&mut dkg_context);
        let group = Group::new(group_id, threshold, addresses.len(), dkg_context)?;
        let mut session = GroupSession::new(group, addresses, self.config.confirm_policy)?;
        session.set_deadline(self.round_deadline(Utc::now()));

        let event = LedgerEvent::GroupCreated {
            group: session.group().clone(),
            members: session.members().cloned().collect(),
        };
        order.next_group = group_id.0;
        self.groups.insert(group_id, session);
        info!(group_id = %group_id, threshold, "Group created");
        self.emit(&mut order, event);
        Ok(group_id)
    }

    /// Request a signature from `threshold` randomly picked signers that
    /// have published nonce pairs.
    pub async fn request_signature(&self, group_id: GroupId, message: Vec<u8>) -> Result<SigningId> {
        let signers = {
            let session = self
                .groups
                .get(&group_id)
                .ok_or(LedgerError::GroupNotFound(group_id))?;
            let threshold = session.group().threshold;
            let mut eligible: Vec<MemberId> = session
                .dealers()
                .into_iter()
                .filter(|&id| {
                    session
                        .member(id)
                        .map(|m| self.unused_des(&m.address) > 0)
                        .unwrap_or(false)
                })
                .collect();
            if eligible.len() < threshold {
                return Err(LedgerError::NotEnoughNonces(format!(
                    "{} of {} required signers have nonce pairs",
                    eligible.len(),
                    threshold
                )));
            }
            eligible.shuffle(&mut OsRng);
            eligible.truncate(threshold);
            eligible.sort_unstable();
            eligible
        };
        self.request_signature_with(group_id, message, &signers).await
    }

    /// Request a signature from an explicit signer set.
    #[instrument(skip(self, message))]
    pub async fn request_signature_with(
        &self,
        group_id: GroupId,
        message: Vec<u8>,
        signers: &[MemberId],
    ) -> Result<SigningId> {
        let mut order = self.order.lock().await;
        let session = self
            .groups
            .get(&group_id)
            .ok_or(LedgerError::GroupNotFound(group_id))?;
        if session.status() != GroupStatus::Active {
            return Err(Error::InvalidState(format!(
                "group {} is {:?}",
                group_id,
                session.status()
            ))
            .into());
        }

        let dealers = session.dealers();
        let mut bindings = Vec::with_capacity(signers.len());
        for &id in signers {
            let member = session
                .member(id)
                .filter(|_| dealers.contains(&id))
                .ok_or_else(|| Error::NotFound(format!("signer {} in group {}", id, group_id)))?;
            if self.unused_des(&member.address) == 0 {
                return Err(LedgerError::NotEnoughNonces(format!("member {}", id)));
            }
            bindings.push((id, member.address.clone()));
        }

        // Pairs are only taken off the queues once the request is accepted
        let signing_id = SigningId(order.next_signing + 1);
        let mut assigned = Vec::with_capacity(bindings.len());
        for (member_id, address) in bindings {
            let pub_de = self
                .des
                .get(&address)
                .and_then(|queue| queue.front().cloned())
                .ok_or_else(|| LedgerError::NotEnoughNonces(format!("member {}", member_id)))?;
            assigned.push(AssignedMember {
                member_id,
                address,
                pub_de,
            });
        }

        let request = SigningRequest {
            signing_id,
            group_id,
            message,
            assigned,
        };
        let context = sign::prepare(session.group(), &request)?;
        let shares = signers
            .iter()
            .map(|&id| session.public_share(id).map(|share| (id, share)))
            .collect::<tss_core::Result<BTreeMap<_, _>>>()?;
        drop(session);

        let mut signing = SigningSession::new(context, &request, shares)?;
        signing.set_deadline(Utc::now() + Duration::seconds(self.config.signing_timeout_secs));
        for member in &request.assigned {
            if let Some(mut queue) = self.des.get_mut(&member.address) {
                queue.pop_front();
            }
        }
        order.next_signing = signing_id.0;
        self.signings.insert(signing_id, signing);

        info!(signing_id = %signing_id, signers = ?signers, "Signing requested");
        self.emit(&mut order, LedgerEvent::SigningRequested { request });
        Ok(signing_id)
    }

    /// Nonce pairs still queued for `address`
    pub fn unused_des(&self, address: &str) -> usize {
        self.des.get(address).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Aggregated signature of a completed request
    pub fn signature(&self, signing_id: SigningId) -> Option<Signature> {
        self.signings
            .get(&signing_id)
            .and_then(|session| session.signature().copied())
    }

    /// Fail every group round and signing request whose deadline is past.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let mut order = self.order.lock().await;
        self.expire_locked(&mut order, now)
    }

    fn expire_locked(&self, order: &mut Order, now: DateTime<Utc>) -> usize {
        let mut events = Vec::new();
        for mut entry in self.groups.iter_mut() {
            let group_id = *entry.key();
            if let Some(transition) = entry.value_mut().expire(now) {
                events.push(group_event(group_id, transition));
            }
        }
        for mut entry in self.signings.iter_mut() {
            let signing_id = *entry.key();
            let group_id = entry.context().group_id;
            if let Some(outcome) = entry.value_mut().expire(now) {
                events.push(signing_event(signing_id, group_id, outcome));
            }
        }

        let count = events.len();
        for event in events {
            self.emit(order, event);
        }
        count
    }

    /// Forget accepted submissions older than the dedup window.
    fn prune_seen(&self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(self.config.dedup_ttl_secs);
        self.seen.retain(|_, accepted| *accepted > horizon);
    }

    fn with_group<F>(&self, group_id: GroupId, now: DateTime<Utc>, f: F) -> tss_core::Result<Vec<LedgerEvent>>
    where
        F: FnOnce(&mut GroupSession) -> tss_core::Result<Option<Transition>>,
    {
        let mut session = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
        let transition = f(session.value_mut())?;

        Ok(match transition {
            Some(transition) => {
                if !session.status().is_terminal() {
                    session.set_deadline(self.round_deadline(now));
                }
                vec![group_event(group_id, transition)]
            }
            None => Vec::new(),
        })
    }

    fn accept_des(&self, sender: &str, des: Vec<DePublic>) -> tss_core::Result<Vec<LedgerEvent>> {
        if des.is_empty() {
            return Err(Error::MalformedSubmission("empty nonce pair list".into()));
        }
        for de in &des {
            de.points()?;
        }
        let offered = des.len();
        let fresh: Vec<DePublic> = des.into_iter().filter(|de| self.known_des.insert(de.key())).collect();
        if fresh.len() < offered {
            debug!(sender, skipped = offered - fresh.len(), "Nonce pairs already known");
        }
        let count = fresh.len();
        self.des.entry(sender.to_string()).or_default().extend(fresh);
        debug!(sender, count, "Nonce pairs queued");
        Ok(Vec::new())
    }

    fn accept_partial(
        &self,
        sender: &str,
        signing_id: SigningId,
        member_id: MemberId,
        partial: &[u8],
    ) -> tss_core::Result<Vec<LedgerEvent>> {
        let mut session = self
            .signings
            .get_mut(&signing_id)
            .ok_or_else(|| Error::NotFound(format!("signing {}", signing_id)))?;
        let group_id = session.context().group_id;
        let outcome = session.value_mut().submit_partial(sender, member_id, partial)?;
        Ok(outcome
            .map(|outcome| signing_event(signing_id, group_id, outcome))
            .into_iter()
            .collect())
    }

    fn apply(&self, sender: &str, message: TssMessage, now: DateTime<Utc>) -> tss_core::Result<Vec<LedgerEvent>> {
        match message {
            TssMessage::SubmitRound1 { group_id, round1 } => {
                self.with_group(group_id, now, |s| s.submit_round1(sender, round1))
            }
            TssMessage::SubmitRound2 { group_id, round2 } => {
                self.with_group(group_id, now, |s| s.submit_round2(sender, round2))
            }
            TssMessage::Complain { group_id, complaints } => {
                self.with_group(group_id, now, |s| s.submit_complaints(sender, &complaints))
            }
            TssMessage::Confirm { group_id, confirm } => {
                self.with_group(group_id, now, |s| s.submit_confirm(sender, confirm))
            }
            TssMessage::SubmitDes { des } => self.accept_des(sender, des),
            TssMessage::SubmitSignature {
                signing_id,
                member_id,
                signature,
            } => self.accept_partial(sender, signing_id, member_id, &signature),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    #[instrument(skip(self, message), fields(message = %message.describe()))]
    async fn submit(&self, sender: &str, message: TssMessage) -> tss_core::Result<()> {
        let mut order = self.order.lock().await;
        let now = Utc::now();
        self.expire_locked(&mut order, now);
        self.prune_seen(now);

        let id = submission_id(sender, &message)?;
        if self.seen.contains_key(&id) {
            return Err(Error::DuplicateSubmission(format!("submission {}", &id[..16])));
        }

        let events = match self.apply(sender, message, now) {
            Ok(events) => events,
            Err(e) => {
                warn!(sender, error = %e, "Submission rejected");
                return Err(e);
            }
        };
        self.seen.insert(id, now);
        for event in events {
            self.emit(&mut order, event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Sequenced> {
        self.events.subscribe()
    }

    async fn events_since(&self, seq: u64) -> tss_core::Result<Vec<Sequenced>> {
        let order = self.order.lock().await;
        Ok(order.log.iter().filter(|e| e.seq > seq).cloned().collect())
    }

    async fn group(&self, group_id: GroupId) -> tss_core::Result<GroupInfo> {
        let session = self
            .groups
            .get(&group_id)
            .ok_or(LedgerError::GroupNotFound(group_id))?;
        Ok(GroupInfo {
            group: session.group().clone(),
            members: session.members().cloned().collect(),
            qualified: session.qualified().to_vec(),
            dealers: session.dealers(),
        })
    }

    async fn round1_infos(&self, group_id: GroupId) -> tss_core::Result<Vec<Round1Info>> {
        let session = self
            .groups
            .get(&group_id)
            .ok_or(LedgerError::GroupNotFound(group_id))?;
        Ok(session.round1_infos())
    }

    async fn round2_infos(&self, group_id: GroupId) -> tss_core::Result<Vec<Round2Info>> {
        let session = self
            .groups
            .get(&group_id)
            .ok_or(LedgerError::GroupNotFound(group_id))?;
        Ok(session.round2_infos())
    }
}

//! Event loop of a participant node

use crate::config::ParticipantConfig;
use crate::handlers::{GroupHandler, SigningHandler};
use crate::retry::with_retry;
use rand::rngs::OsRng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tss_core::ledger::{Ledger, LedgerEvent, Sequenced};
use tss_core::sign::{DePublic, DeSecret};
use tss_core::store::SecretStore;
use tss_core::{Error, GroupId, Result, SigningId, TssMessage};

/// How often events held back for a busy handler are retried
const BACKLOG_FLUSH_INTERVAL: Duration = Duration::from_millis(20);

/// State shared by the event loop and its handlers
pub(crate) struct Node {
    pub(crate) config: ParticipantConfig,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) store: Arc<dyn SecretStore>,
    /// Serializes nonce pair replenishment
    replenishing: Mutex<()>,
}

impl Node {
    /// Submit with retries; a submission the ledger already holds counts as done.
    pub(crate) async fn submit(&self, message: TssMessage) -> Result<()> {
        let what = message.describe();
        let ledger = &self.ledger;
        let sender = self.config.address.as_str();
        let result = with_retry(&self.config.retry, &what, || ledger.submit(sender, message.clone())).await;
        match result {
            Err(Error::DuplicateSubmission(_)) => {
                debug!(what, "Submission already accepted");
                Ok(())
            }
            other => other,
        }
    }

    /// Keep at least `min_des` unused nonce pairs stored and published.
    ///
    /// Pairs stored by an earlier call whose submission never got through
    /// are resubmitted first; they do not count until the ledger accepts them.
    pub(crate) async fn replenish_des(&self) -> Result<usize> {
        let _guard = self.replenishing.lock().await;

        let pending = self.store.unpublished_des()?;
        let mut published = pending.len();
        if !pending.is_empty() {
            self.publish_des(pending).await?;
            info!(count = published, "Pending nonce pairs resubmitted");
        }

        let unused = self.store.unused_de_count()?;
        if unused < self.config.min_des {
            let count = self.config.de_batch_size.max(self.config.min_des - unused);
            let secrets: Vec<DeSecret> = (0..count).map(|_| DeSecret::generate(&mut OsRng)).collect();
            let des = self.store.insert_des(secrets)?;
            self.publish_des(des).await?;
            info!(count, unused, "Nonce pairs published");
            published += count;
        }
        Ok(published)
    }

    async fn publish_des(&self, des: Vec<DePublic>) -> Result<()> {
        self.submit(TssMessage::SubmitDes { des: des.clone() }).await?;
        self.store.mark_published(&des)
    }

    pub(crate) async fn top_up_des(&self) {
        if let Err(e) = self.replenish_des().await {
            error!(error = %e, "Failed to replenish nonce pairs");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKey {
    Group(GroupId),
    Signing(SigningId),
}

impl TaskKey {
    fn of(event: &LedgerEvent) -> Self {
        match event.signing_id() {
            Some(signing_id) => TaskKey::Signing(signing_id),
            None => TaskKey::Group(event.group_id()),
        }
    }
}

/// Event queue of one running handler
struct Queue {
    tx: mpsc::Sender<LedgerEvent>,
    /// Events waiting for room in the channel, oldest first
    backlog: VecDeque<LedgerEvent>,
    /// A terminal event is queued; drop the queue once it is delivered
    closing: bool,
}

impl Queue {
    fn new(tx: mpsc::Sender<LedgerEvent>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
            closing: false,
        }
    }

    /// Move backlogged events into the channel; false once the handler is gone.
    fn flush(&mut self) -> bool {
        while let Some(event) = self.backlog.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

/// Fans sequenced events out to one handler per group or request.
///
/// Delivery never waits on a handler: when a handler's channel is full its
/// events are held back in order and flushed later.
struct Router {
    node: Arc<Node>,
    queues: HashMap<TaskKey, Queue>,
    handlers: JoinSet<()>,
    last_seq: u64,
}

impl Router {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            queues: HashMap::new(),
            handlers: JoinSet::new(),
            last_seq: 0,
        }
    }

    /// Whether an event with no running handler concerns this node.
    fn opens_handler(&self, event: &LedgerEvent) -> bool {
        let address = self.node.config.address.as_str();
        match event {
            LedgerEvent::GroupCreated { members, .. } => members.iter().any(|m| m.address == address),
            LedgerEvent::SigningRequested { request } => request.assignment(address).is_some(),
            _ => false,
        }
    }

    fn spawn(&mut self, key: TaskKey) {
        let (tx, rx) = mpsc::channel(self.node.config.channel_capacity);
        let node = self.node.clone();
        match key {
            TaskKey::Group(group_id) => {
                self.handlers.spawn(GroupHandler::new(node, group_id).run(rx));
            }
            TaskKey::Signing(_) => {
                self.handlers.spawn(SigningHandler::new(node).run(rx));
            }
        }
        self.queues.insert(key, Queue::new(tx));
    }

    fn dispatch(&mut self, sequenced: Sequenced) {
        // Live events and catch-up overlap; each is handled once
        if sequenced.seq <= self.last_seq {
            return;
        }
        self.last_seq = sequenced.seq;

        let event = sequenced.event;
        let key = TaskKey::of(&event);
        if !self.queues.contains_key(&key) {
            if !self.opens_handler(&event) {
                return;
            }
            self.spawn(key);
        }
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.closing |= event.is_terminal();
            queue.backlog.push_back(event);
        }
        self.settle(key);

        if let Some(queue) = self.queues.get(&key).filter(|queue| !queue.backlog.is_empty()) {
            warn!(?key, held = queue.backlog.len(), "Handler is falling behind, holding events");
        }
    }

    /// Deliver what fits and drop queues that are finished.
    fn settle(&mut self, key: TaskKey) {
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        if !queue.flush() {
            debug!(?key, "Handler already stopped");
            self.queues.remove(&key);
        } else if queue.closing && queue.backlog.is_empty() {
            self.queues.remove(&key);
        }
    }

    fn has_backlog(&self) -> bool {
        self.queues.values().any(|queue| !queue.backlog.is_empty())
    }

    fn flush_backlogs(&mut self) {
        let keys: Vec<TaskKey> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.backlog.is_empty())
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            self.settle(key);
        }
    }

    async fn catch_up(&mut self) -> Result<()> {
        let ledger = &self.node.ledger;
        let since = self.last_seq;
        let missed = with_retry(&self.node.config.retry, "events", || ledger.events_since(since)).await?;
        debug!(since, count = missed.len(), "Catching up");
        for sequenced in missed {
            self.dispatch(sequenced);
        }
        Ok(())
    }
}

/// A node that follows the ledger and plays its part in every group and
/// signing request it is a member of.
#[derive(Clone)]
pub struct Participant {
    node: Arc<Node>,
}

impl Participant {
    pub fn new(config: ParticipantConfig, ledger: Arc<dyn Ledger>, store: Arc<dyn SecretStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node: Arc::new(Node {
                config,
                ledger,
                store,
                replenishing: Mutex::new(()),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.node.config.address
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.node.config
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.node.store
    }

    /// Generate, store and publish nonce pairs if fewer than `min_des` are
    /// unused, after resubmitting any the ledger never acknowledged. Returns
    /// how many were published.
    pub async fn replenish_des(&self) -> Result<usize> {
        self.node.replenish_des().await
    }

    /// Follow the ledger until `shutdown` resolves or the ledger closes.
    ///
    /// Everything already in the ledger's log is replayed first, so a node
    /// started late or restarted picks up where its store left off.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut events = self.node.ledger.subscribe();
        let mut router = Router::new(self.node.clone());

        info!(address = %self.address(), "Participant started");
        router.catch_up().await?;
        self.node.top_up_des().await;

        let mut flush = tokio::time::interval(BACKLOG_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(address = %self.address(), "Shutting down");
                    break;
                }
                received = events.recv() => match received {
                    Ok(sequenced) => router.dispatch(sequenced),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, last_seq = router.last_seq, "Event stream lagged");
                        router.catch_up().await?;
                    }
                    Err(RecvError::Closed) => {
                        info!("Ledger closed its event stream");
                        break;
                    }
                },
                _ = flush.tick(), if router.has_backlog() => router.flush_backlogs(),
                Some(joined) = router.handlers.join_next(), if !router.handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Handler panicked");
                    }
                }
            }
        }

        router.queues.clear();
        router.handlers.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use tss_core::keygen::{Round1Info, Round2Info};
    use tss_core::ledger::{async_trait, GroupInfo};
    use tss_core::store::MemoryStore;
    use tss_core::MemberId;
    use tss_ledger::MemoryLedger;

    /// Ledger whose first submissions fail as if it were unreachable
    struct FlakyLedger {
        inner: MemoryLedger,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Ledger for FlakyLedger {
        async fn submit(&self, sender: &str, message: TssMessage) -> Result<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::Ledger("unavailable".into()));
            }
            self.inner.submit(sender, message).await
        }

        fn subscribe(&self) -> broadcast::Receiver<Sequenced> {
            self.inner.subscribe()
        }

        async fn events_since(&self, seq: u64) -> Result<Vec<Sequenced>> {
            self.inner.events_since(seq).await
        }

        async fn group(&self, group_id: GroupId) -> Result<GroupInfo> {
            self.inner.group(group_id).await
        }

        async fn round1_infos(&self, group_id: GroupId) -> Result<Vec<Round1Info>> {
            self.inner.round1_infos(group_id).await
        }

        async fn round2_infos(&self, group_id: GroupId) -> Result<Vec<Round2Info>> {
            self.inner.round2_infos(group_id).await
        }
    }

    fn config() -> ParticipantConfig {
        let mut config = ParticipantConfig::new("validator-1");
        config.channel_capacity = 1;
        config.retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        config
    }

    fn round1_completed(seq: u64, group_id: u64) -> Sequenced {
        Sequenced {
            seq,
            timestamp: Default::default(),
            event: LedgerEvent::Round1Completed {
                group_id: GroupId(group_id),
                qualified: vec![MemberId(seq)],
            },
        }
    }

    fn qualified(event: LedgerEvent) -> Vec<MemberId> {
        match event {
            LedgerEvent::Round1Completed { qualified, .. } => qualified,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unacknowledged_nonce_pairs_are_resubmitted() {
        let ledger = Arc::new(FlakyLedger {
            inner: MemoryLedger::default(),
            failures: AtomicUsize::new(2),
        });
        let store = Arc::new(MemoryStore::new());
        let participant = Participant::new(config(), ledger.clone(), store.clone()).unwrap();

        // Both attempts fail; the pairs are kept but not counted
        assert!(matches!(participant.replenish_des().await, Err(Error::Ledger(_))));
        assert_eq!(store.unused_de_count().unwrap(), 0);
        assert_eq!(store.unpublished_des().unwrap().len(), 8);
        assert_eq!(ledger.inner.unused_des("validator-1"), 0);

        assert_eq!(participant.replenish_des().await.unwrap(), 8);
        assert_eq!(store.unused_de_count().unwrap(), 8);
        assert!(store.unpublished_des().unwrap().is_empty());
        assert_eq!(ledger.inner.unused_des("validator-1"), 8);

        assert_eq!(participant.replenish_des().await.unwrap(), 0);
        assert_eq!(ledger.inner.unused_des("validator-1"), 8);
    }

    #[test]
    fn test_busy_handler_does_not_hold_up_others() {
        let participant = Participant::new(
            config(),
            Arc::new(MemoryLedger::default()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let mut router = Router::new(participant.node.clone());
        let busy = TaskKey::Group(GroupId(1));
        let idle = TaskKey::Group(GroupId(2));
        let (busy_tx, mut busy_rx) = mpsc::channel(1);
        let (idle_tx, mut idle_rx) = mpsc::channel(1);
        router.queues.insert(busy, Queue::new(busy_tx));
        router.queues.insert(idle, Queue::new(idle_tx));

        for seq in 1..=3 {
            router.dispatch(round1_completed(seq, 1));
        }
        router.dispatch(round1_completed(4, 2));
        assert_eq!(router.queues[&busy].backlog.len(), 2);
        assert_eq!(qualified(idle_rx.try_recv().unwrap()), vec![MemberId(4)]);

        // Held events arrive in ledger order as the handler drains
        let mut delivered = Vec::new();
        while let Ok(event) = busy_rx.try_recv() {
            delivered.extend(qualified(event));
            router.flush_backlogs();
        }
        assert_eq!(delivered, vec![MemberId(1), MemberId(2), MemberId(3)]);
        assert!(!router.has_backlog());

        // A held terminal event keeps the queue until it is delivered
        router.dispatch(round1_completed(5, 2));
        router.dispatch(Sequenced {
            seq: 6,
            timestamp: Default::default(),
            event: LedgerEvent::GroupFailed {
                group_id: GroupId(2),
                reason: "expired".into(),
            },
        });
        assert!(router.queues.contains_key(&idle));
        assert!(idle_rx.try_recv().is_ok());
        router.flush_backlogs();
        assert!(!router.queues.contains_key(&idle));
        assert!(matches!(idle_rx.try_recv(), Ok(LedgerEvent::GroupFailed { .. })));
    }
}

//! Replicator: per-peer push/pull sync, inbound request handling,
//! consensus and resolve.
//!
//! Delivery is at-least-once. Every event carries a content hash and the
//! reputation store ignores hashes it has already applied, so redelivery
//! after a partition heals is harmless.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollgate_reputation::{
    ApplyOutcome, Clock, NodeId, ReputationError, ReputationEvent, ReputationStore, UserId,
};
use tracing::{debug, info, warn};

use crate::error::{ReplError, Result};
use crate::protocol::{Message, PullRequest, PulledEvents, PushAck, PushBatch, ResolveNotice};
use crate::registry::{NodeRegistry, PeerRecord};
use crate::sync_state::{SyncState, SyncStateStore, SyncStatus};
use crate::transport::{PeerHandler, PeerTransport};
use crate::views::{Consensus, NodeReputationView, ViewStore};

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Interval between sync cycles with one peer.
    pub sync_frequency_ms: u64,
    /// Consecutive failed cycles before a peer is marked failed.
    pub failure_threshold: u32,
    /// Timeout for one request to a peer.
    pub request_timeout_ms: u64,
    /// Ceiling on the retry delay after failures.
    pub max_backoff_ms: u64,
    /// Events per push or pull request.
    pub batch_size: usize,
    /// Requests per direction in one cycle.
    pub max_batches_per_cycle: usize,
    /// Spread between node views above which a user is in conflict.
    pub conflict_spread: f64,
    /// Also pull from peers, not just push to them.
    pub pull_enabled: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            sync_frequency_ms: 5_000,
            failure_threshold: 3,
            request_timeout_ms: 5_000,
            max_backoff_ms: 60_000,
            batch_size: 500,
            max_batches_per_cycle: 20,
            conflict_spread: 20.0,
            pull_enabled: true,
        }
    }
}

impl ReplicatorConfig {
    /// Check the settings for obvious mistakes.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.sync_frequency_ms == 0 {
            return Err("sync_frequency_ms must be positive".to_string());
        }
        if self.batch_size == 0 || self.max_batches_per_cycle == 0 {
            return Err("batch_size and max_batches_per_cycle must be positive".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if !(0.0..=100.0).contains(&self.conflict_spread) {
            return Err(format!("conflict_spread {} outside [0, 100]", self.conflict_spread));
        }
        Ok(())
    }
}

/// What one sync cycle with a peer moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// The peer.
    pub peer: NodeId,
    /// Events sent.
    pub pushed: u64,
    /// Sent events the peer had not seen.
    pub pushed_applied: u64,
    /// Sent events the peer already had.
    pub pushed_duplicates: u64,
    /// Events received by pulling.
    pub pulled: u64,
    /// Received events applied here for the first time.
    pub pulled_applied: u64,
    /// Received events already present here.
    pub pulled_duplicates: u64,
}

/// Result of a resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    /// The user.
    pub user_id: UserId,
    /// Score every view now holds.
    pub score: f64,
    /// Authoritative node kept, if any.
    pub authority: Option<NodeId>,
    /// Consensus before the resolve.
    pub before: Consensus,
    /// Peers that accepted the broadcast.
    pub notified: Vec<NodeId>,
    /// Peers that could not be reached.
    pub unreachable: Vec<NodeId>,
}

/// Replication statistics for admin surfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Events in the local log.
    pub total_events: usize,
    /// Replicable events not yet acknowledged by every peer.
    pub unsynced_events: usize,
    /// Events that never leave this node.
    pub local_only_events: usize,
    /// Registered peers.
    pub peers: usize,
    /// Peers per status.
    pub healthy_peers: usize,
    /// Peers with recent errors.
    pub degraded_peers: usize,
    /// Peers past the failure threshold.
    pub failed_peers: usize,
    /// Sum of pending events over all peers.
    pub pending_events: u64,
    /// Events sent since start.
    pub events_pushed: u64,
    /// Events applied from peers since start.
    pub events_received: u64,
    /// Duplicate deliveries ignored since start.
    pub duplicates_received: u64,
    /// Events refused for a bad hash since start.
    pub rejected_events: u64,
    /// Conflicts seen by the last conflict check.
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_pushed: AtomicU64,
    events_received: AtomicU64,
    duplicates_received: AtomicU64,
    rejected_events: AtomicU64,
    conflicts: AtomicU64,
}

/// Keeps this node's reputation log in sync with its peers.
pub struct Replicator {
    config: ReplicatorConfig,
    reputation: Arc<ReputationStore>,
    registry: NodeRegistry,
    states: SyncStateStore,
    views: ViewStore,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
    sync_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
    counters: Counters,
}

impl Replicator {
    /// Create a replicator over `reputation`, sharing its store for registry,
    /// sync state and views.
    pub fn new(
        config: ReplicatorConfig,
        reputation: Arc<ReputationStore>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let kv = reputation.kv().clone();
        Self {
            config,
            registry: NodeRegistry::new(reputation.node_id(), kv.clone()),
            states: SyncStateStore::new(kv.clone()),
            views: ViewStore::new(kv),
            reputation,
            transport,
            clock,
            sync_locks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        self.reputation.node_id()
    }

    /// Replication settings.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Peer registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Node views.
    pub fn views(&self) -> &ViewStore {
        &self.views
    }

    /// Register a peer. It starts healthy with every replicable event pending.
    pub fn register_peer(&self, node_id: &str, endpoint: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.registry.register(PeerRecord::new(node_id, endpoint, now))?;
        let mut state = SyncState::new(self.node_id(), node_id, self.config.sync_frequency_ms);
        state.pending_events = self.pending_for(node_id, 0)?;
        self.states.save(&state)
    }

    /// Unregister a peer and forget its sync state.
    pub fn unregister_peer(&self, node_id: &str) -> Result<PeerRecord> {
        let record = self.registry.unregister(node_id)?;
        self.states.remove(node_id)?;
        self.sync_locks.lock().remove(node_id);
        Ok(record)
    }

    /// Sync state of every peer.
    pub fn health(&self) -> Result<Vec<SyncState>> {
        self.states.all()
    }

    /// Sync state of one peer.
    pub fn sync_state(&self, node_id: &str) -> Result<Option<SyncState>> {
        self.states.load(node_id)
    }

    fn sync_lock(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sync_locks.lock().entry(node_id.to_string()).or_default().clone()
    }

    async fn timed<T>(&self, peer: &PeerRecord, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout_ms = self.config.request_timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| ReplError::Timeout {
                node_id: peer.node_id.clone(),
                timeout_ms,
            })?
    }

    /// Run one sync cycle with a peer: push our unsent events, then pull its.
    ///
    /// Cursor progress made before a failure is kept. The outcome is folded
    /// into the peer's [`SyncState`] either way.
    pub async fn sync_peer(&self, node_id: &str) -> Result<SyncReport> {
        let lock = self.sync_lock(node_id);
        let _guard = lock.lock().await;

        let peer = self.registry.require(node_id)?;
        let mut state = match self.states.load(node_id)? {
            Some(state) => state,
            None => SyncState::new(self.node_id(), node_id, self.config.sync_frequency_ms),
        };

        let result = self.run_cycle(&peer, &mut state).await;
        let now = self.clock.now_ms();
        let pending = self.pending_for(node_id, state.last_pushed_id)?;
        match &result {
            Ok(report) => {
                state.record_success(now, pending);
                self.registry.touch(node_id, now)?;
                debug!(
                    peer = %node_id,
                    pushed = report.pushed,
                    pulled = report.pulled,
                    pending,
                    "peer sync cycle complete"
                );
            }
            Err(e) => {
                warn!(peer = %node_id, error = %e, pending, "peer sync cycle failed");
                state.record_failure(&e.to_string(), pending, self.config.failure_threshold);
            }
        }
        self.states.save(&state)?;
        self.advance_synced(now)?;
        result
    }

    /// Sync every registered peer once, in id order.
    pub async fn sync_all(&self) -> Result<Vec<(NodeId, Result<SyncReport>)>> {
        let mut out = Vec::new();
        for peer in self.registry.peers()? {
            let result = self.sync_peer(&peer.node_id).await;
            out.push((peer.node_id, result));
        }
        Ok(out)
    }

    async fn run_cycle(&self, peer: &PeerRecord, state: &mut SyncState) -> Result<SyncReport> {
        let mut report = SyncReport {
            peer: peer.node_id.clone(),
            ..SyncReport::default()
        };

        for _ in 0..self.config.max_batches_per_cycle {
            let (events, scanned_to) = self.outbound_batch(&peer.node_id, state.last_pushed_id)?;
            if scanned_to == state.last_pushed_id {
                break;
            }
            if !events.is_empty() {
                let sent = events.len() as u64;
                let batch = PushBatch {
                    from: self.node_id().to_string(),
                    views: self.local_views(&events)?,
                    events,
                };
                let ack = self.timed(peer, self.transport.push(peer, batch)).await?;
                report.pushed += sent;
                report.pushed_applied += u64::from(ack.applied);
                report.pushed_duplicates += u64::from(ack.duplicates);
                self.counters.events_pushed.fetch_add(sent, Ordering::Relaxed);
            }
            state.last_pushed_id = scanned_to;
        }

        if self.config.pull_enabled {
            for _ in 0..self.config.max_batches_per_cycle {
                let request = PullRequest {
                    from: self.node_id().to_string(),
                    after_id: state.last_pulled_id,
                    limit: self.config.batch_size as u32,
                };
                let pulled = self.timed(peer, self.transport.pull(peer, request)).await?;
                if pulled.last_id <= state.last_pulled_id {
                    break;
                }
                report.pulled += pulled.events.len() as u64;
                let ack = self.apply_inbound(&peer.node_id, pulled.events, pulled.views)?;
                report.pulled_applied += u64::from(ack.applied);
                report.pulled_duplicates += u64::from(ack.duplicates);
                state.last_pulled_id = pulled.last_id;
            }
        }

        Ok(report)
    }

    /// Next batch of events to send to `peer` after `cursor`, and the highest
    /// id scanned.
    fn outbound_batch(&self, peer: &str, cursor: u64) -> Result<(Vec<ReputationEvent>, u64)> {
        let scanned = self.reputation.events_after(cursor, self.config.batch_size)?;
        let scanned_to = scanned.last().map_or(cursor, |e| e.id);
        let events = scanned.into_iter().filter(|e| replicable_to(e, peer)).collect();
        Ok((events, scanned_to))
    }

    /// Events still owed to `peer`, read one batch at a time from `cursor`.
    fn pending_for(&self, peer: &str, mut cursor: u64) -> Result<u64> {
        let mut pending = 0u64;
        loop {
            let (events, scanned_to) = self.outbound_batch(peer, cursor)?;
            if scanned_to == cursor {
                return Ok(pending);
            }
            pending += events.len() as u64;
            cursor = scanned_to;
        }
    }

    /// Stamp `synced_at` up to the slowest peer's push cursor.
    fn advance_synced(&self, now_ms: u64) -> Result<()> {
        let floor = self.states.all()?.iter().map(|s| s.last_pushed_id).min();
        if let Some(floor) = floor.filter(|f| *f > 0) {
            let marked = self.reputation.mark_synced(floor, now_ms)?;
            if marked > 0 {
                debug!(up_to = floor, marked, "events marked synced");
            }
        }
        Ok(())
    }

    /// Refresh this node's view of a user from the reputation store.
    pub fn refresh_view(&self, user_id: &str, now_ms: u64) -> Result<NodeReputationView> {
        let row = self.reputation.score(user_id, now_ms)?;
        self.views.record(user_id, self.node_id(), row.score, row.tier, now_ms)?;
        Ok(self
            .views
            .get(user_id, self.node_id())?
            .unwrap_or(NodeReputationView {
                user_id: user_id.to_string(),
                node_id: self.node_id().to_string(),
                score: row.score,
                tier: row.tier,
                is_authoritative: false,
                updated_at_ms: now_ms,
            }))
    }

    fn local_views(&self, events: &[ReputationEvent]) -> Result<Vec<NodeReputationView>> {
        let now = self.clock.now_ms();
        let users: BTreeSet<&str> = events.iter().map(|e| e.user_id.as_str()).collect();
        users.into_iter().map(|u| self.refresh_view(u, now)).collect()
    }

    fn apply_inbound(
        &self,
        from: &str,
        events: Vec<ReputationEvent>,
        views: Vec<NodeReputationView>,
    ) -> Result<PushAck> {
        let mut ack = PushAck::default();
        let mut touched = BTreeSet::new();
        for event in events {
            if event.local_only {
                ack.rejected += 1;
                continue;
            }
            let user_id = event.user_id.clone();
            match self.reputation.apply_remote(event) {
                Ok(ApplyOutcome::Applied { .. }) => {
                    ack.applied += 1;
                    touched.insert(user_id);
                }
                Ok(ApplyOutcome::Duplicate { .. }) => ack.duplicates += 1,
                Err(ReputationError::HashMismatch { expected, got }) => {
                    warn!(peer = %from, user = %user_id, %expected, %got, "rejected event with bad hash");
                    ack.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        for view in views.into_iter().filter(|v| v.node_id == from) {
            self.views
                .record(&view.user_id, &view.node_id, view.score, view.tier, view.updated_at_ms)?;
        }
        let now = self.clock.now_ms();
        for user in &touched {
            self.refresh_view(user, now)?;
        }

        self.counters
            .events_received
            .fetch_add(u64::from(ack.applied), Ordering::Relaxed);
        self.counters
            .duplicates_received
            .fetch_add(u64::from(ack.duplicates), Ordering::Relaxed);
        self.counters
            .rejected_events
            .fetch_add(u64::from(ack.rejected), Ordering::Relaxed);
        Ok(ack)
    }

    fn handle_push(&self, batch: PushBatch) -> Result<PushAck> {
        self.registry.require(&batch.from)?;
        self.registry.touch(&batch.from, self.clock.now_ms())?;
        let ack = self.apply_inbound(&batch.from, batch.events, batch.views)?;
        debug!(
            peer = %batch.from,
            applied = ack.applied,
            duplicates = ack.duplicates,
            rejected = ack.rejected,
            "push received"
        );
        Ok(ack)
    }

    fn handle_pull(&self, request: PullRequest) -> Result<PulledEvents> {
        self.registry.require(&request.from)?;
        self.registry.touch(&request.from, self.clock.now_ms())?;
        let limit = (request.limit as usize).clamp(1, self.config.batch_size.max(1));
        let scanned = self.reputation.events_after(request.after_id, limit)?;
        let last_id = scanned.last().map_or(request.after_id, |e| e.id);
        let events: Vec<ReputationEvent> = scanned
            .into_iter()
            .filter(|e| replicable_to(e, &request.from))
            .collect();
        let views = self.local_views(&events)?;
        Ok(PulledEvents { events, last_id, views })
    }

    fn handle_resolve(&self, notice: ResolveNotice) -> Result<()> {
        self.registry.require(&notice.from)?;
        let reason = format!("resolved by {}", notice.from);
        self.adopt(&notice.user_id, notice.score, notice.authority.as_deref(), &reason)?;
        info!(user = %notice.user_id, score = notice.score, from = %notice.from, "adopted resolved reputation");
        Ok(())
    }

    /// Move the local score to `score` and collapse every view onto it.
    ///
    /// The adjustment is local-only: each node closes its own gap.
    fn adopt(&self, user_id: &str, score: f64, authority: Option<&str>, reason: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let current = self.reputation.score(user_id, now)?;
        if (current.score - score).abs() > f64::EPSILON {
            self.reputation.set_score_local(user_id, score, reason, now)?;
        }
        self.refresh_view(user_id, now)?;
        let tier = self.reputation.tiers().tier_for(score);
        self.views.collapse(user_id, score, tier, authority, now)
    }

    /// Consensus across every node's view of a user.
    pub fn consensus(&self, user_id: &str) -> Result<Option<Consensus>> {
        self.refresh_view(user_id, self.clock.now_ms())?;
        self.views.consensus(user_id, self.config.conflict_spread)
    }

    /// Designate `node_id` as the only authoritative view of `user_id`.
    pub fn set_authoritative(&self, user_id: &str, node_id: &str) -> Result<bool> {
        if node_id == self.node_id() {
            self.refresh_view(user_id, self.clock.now_ms())?;
        }
        let set = self.views.set_authoritative(user_id, node_id)?;
        if set {
            info!(user = %user_id, node = %node_id, "authoritative view designated");
        }
        Ok(set)
    }

    /// Collapse every view of a user to the authoritative score (or the
    /// average when none is designated) and broadcast it to all peers.
    pub async fn resolve_user(&self, user_id: &str) -> Result<ResolveOutcome> {
        let before = match self.consensus(user_id)? {
            Some(c) => c,
            None => {
                return Err(ReplError::Protocol {
                    msg: format!("no views of user {}", user_id),
                })
            }
        };
        let score = tollgate_reputation::tier::clamp_score(before.consensus_score);
        let authority = before.authoritative.as_ref().map(|v| v.node_id.clone());
        self.adopt(user_id, score, authority.as_deref(), "resolved from node views")?;

        let notice = ResolveNotice {
            from: self.node_id().to_string(),
            user_id: user_id.to_string(),
            score,
            authority: authority.clone(),
            timestamp_ms: self.clock.now_ms(),
        };
        let mut notified = Vec::new();
        let mut unreachable = Vec::new();
        for peer in self.registry.peers()? {
            match self.timed(&peer, self.transport.resolve(&peer, notice.clone())).await {
                Ok(()) => notified.push(peer.node_id),
                Err(e) => {
                    warn!(peer = %peer.node_id, user = %user_id, error = %e, "resolve broadcast failed");
                    unreachable.push(peer.node_id);
                }
            }
        }
        info!(
            user = %user_id,
            score,
            spread = before.spread,
            notified = notified.len(),
            unreachable = unreachable.len(),
            "user reputation resolved"
        );
        Ok(ResolveOutcome {
            user_id: user_id.to_string(),
            score,
            authority,
            before,
            notified,
            unreachable,
        })
    }

    /// Users whose node views disagree beyond the configured spread.
    pub fn check_conflicts(&self) -> Result<Vec<Consensus>> {
        let mut conflicts = Vec::new();
        for user in self.views.users()? {
            if let Some(c) = self.views.consensus(&user, self.config.conflict_spread)? {
                if c.conflict {
                    let err = ReplError::ReplicationConflict {
                        user_id: user.clone(),
                        spread: c.spread,
                    };
                    warn!(user = %user, min = c.min, max = c.max, "{}", err);
                    conflicts.push(c);
                }
            }
        }
        self.counters
            .conflicts
            .store(conflicts.len() as u64, Ordering::Relaxed);
        Ok(conflicts)
    }

    /// Replication statistics.
    pub fn stats(&self) -> Result<ReplicationStats> {
        let log = self.reputation.log_stats()?;
        let states = self.states.all()?;
        let count = |status: SyncStatus| states.iter().filter(|s| s.status == status).count();
        Ok(ReplicationStats {
            total_events: log.total_events,
            unsynced_events: log.unsynced_events,
            local_only_events: log.local_only_events,
            peers: self.registry.len()?,
            healthy_peers: count(SyncStatus::Healthy),
            degraded_peers: count(SyncStatus::Degraded),
            failed_peers: count(SyncStatus::Failed),
            pending_events: states.iter().map(|s| s.pending_events).sum(),
            events_pushed: self.counters.events_pushed.load(Ordering::Relaxed),
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            duplicates_received: self.counters.duplicates_received.load(Ordering::Relaxed),
            rejected_events: self.counters.rejected_events.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        })
    }

    /// Delay before the next cycle after `consecutive_errors` failures.
    ///
    /// Doubles per error from the sync frequency up to the backoff ceiling,
    /// plus up to 50% random jitter (still capped).
    pub fn backoff_ms(&self, consecutive_errors: u32) -> u64 {
        let base = self.config.sync_frequency_ms;
        if consecutive_errors == 0 {
            return base;
        }
        let exp = consecutive_errors.saturating_sub(1).min(20);
        let max = self.config.max_backoff_ms.max(base);
        let delay = base.saturating_mul(1u64 << exp).min(max);
        let jitter = rand::thread_rng().gen_range(0..=delay / 2);
        delay.saturating_add(jitter).min(max)
    }

    /// Sync with one peer every `sync_frequency_ms` until `cancel` fires or
    /// the peer is unregistered. A cycle in progress always completes and
    /// persists its state before the worker exits.
    pub async fn run_peer(self: Arc<Self>, node_id: NodeId, cancel: CancellationToken) {
        info!(peer = %node_id, "sync worker started");
        let mut delay = Duration::from_millis(self.config.sync_frequency_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let errors = match self.sync_peer(&node_id).await {
                Ok(_) => 0,
                Err(ReplError::UnknownPeer { .. }) => {
                    info!(peer = %node_id, "peer unregistered");
                    break;
                }
                Err(_) => self
                    .states
                    .load(&node_id)
                    .ok()
                    .flatten()
                    .map_or(1, |s| s.sync_errors),
            };
            delay = Duration::from_millis(self.backoff_ms(errors));
        }
        info!(peer = %node_id, "sync worker stopped");
    }

    /// Spawn one sync worker per registered peer.
    pub fn spawn_workers(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        Ok(self
            .registry
            .peers()?
            .into_iter()
            .map(|peer| tokio::spawn(self.clone().run_peer(peer.node_id, cancel.child_token())))
            .collect())
    }
}

/// Events a peer should receive: replicable and not originated by it.
fn replicable_to(event: &ReputationEvent, peer: &str) -> bool {
    !event.local_only && event.source_node_id != peer
}

#[async_trait]
impl PeerHandler for Replicator {
    async fn handle(&self, message: Message) -> Message {
        let kind = message.kind();
        let result = match message {
            Message::Push(batch) => self.handle_push(batch).map(Message::Ack),
            Message::Pull(request) => self.handle_pull(request).map(Message::Events),
            Message::Resolve(notice) => self
                .handle_resolve(notice)
                .map(|()| Message::Ack(PushAck::default())),
            other => Err(ReplError::Protocol {
                msg: format!("unexpected {} request", other.kind()),
            }),
        };
        result.unwrap_or_else(|e| {
            warn!(request = kind, error = %e, "replication request failed");
            Message::Error { msg: e.to_string() }
        })
    }
}

//! A tollgate node: every component wired together behind one API.

use std::sync::Arc;

use tollgate_limits::admission::CleanupReport;
use tollgate_limits::throttle::{InFlight, ThrottleEvent, ThrottleStats};
use tollgate_limits::violation::ViolationStats;
use tollgate_limits::{
    AdmissionController, AdmissionParts, AdmissionRequest, AutoThrottle, BucketStore, Decision, Denial, LoadSample,
    QuotaDefinition, QuotaTracker, QuotaUsage, Rule, RuleSet, RuleSpec, Scope, ThrottleLevel, UsageReport, Violation,
    ViolationLog,
};
use tollgate_repl::{
    Consensus, PeerRecord, PeerTransport, ReplError, ReplicationStats, Replicator, ResolveOutcome, SyncReport,
    SyncState, TcpTransport,
};
use tollgate_reputation::{
    ApplyOutcome, Clock, DecayReport, DecayScheduler, KvStore, MemoryKvStore, ReputationEvent, ReputationStats,
    ReputationStore, SystemClock, TrendPoint, UserReputationView, VipAssignment, ViolationSummary,
};
use tracing::info;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Stored score next to the score rebuilt from the event log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyCheck {
    /// Score in the user row.
    pub stored: f64,
    /// Score from replaying the log.
    pub replayed: f64,
}

impl ConsistencyCheck {
    /// Returns true when both agree.
    pub fn is_consistent(&self) -> bool {
        (self.stored - self.replayed).abs() < 1e-6
    }
}

/// All components of one node.
pub struct Node {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    reputation: Arc<ReputationStore>,
    decay: DecayScheduler,
    rules: Arc<RuleSet>,
    quotas: Arc<QuotaTracker>,
    throttle: Arc<AutoThrottle>,
    violations: Arc<ViolationLog>,
    buckets: Arc<BucketStore>,
    in_flight: Arc<InFlight>,
    admission: AdmissionController,
    replicator: Arc<Replicator>,
}

impl Node {
    /// Build a node over `kv`, reaching peers through `transport`.
    ///
    /// Bootstrap rules, quotas and peers from the configuration are installed.
    pub fn new(
        config: NodeConfig,
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NodeError::Config { msg: e.to_string() })?;
        let now = clock.now_ms();

        let reputation = Arc::new(ReputationStore::open(
            config.node.node_id.clone(),
            kv,
            config.reputation.tiers.clone(),
        )?);
        let decay = DecayScheduler::new(reputation.clone(), config.reputation.decay.clone());

        let rules = Arc::new(RuleSet::new());
        let quotas = Arc::new(QuotaTracker::new());
        let throttle = Arc::new(AutoThrottle::new(config.throttle.clone()));
        let violations = Arc::new(ViolationLog::new());
        let buckets = Arc::new(BucketStore::new(config.admission.buckets.clone()));
        let in_flight = Arc::new(InFlight::new());
        let admission = AdmissionController::new(
            config.admission.controller.clone(),
            AdmissionParts {
                rules: rules.clone(),
                buckets: buckets.clone(),
                quotas: quotas.clone(),
                throttle: throttle.clone(),
                reputation: reputation.clone(),
                violations: violations.clone(),
                in_flight: in_flight.clone(),
            },
        );

        for spec in &config.rules {
            rules.create(spec.clone(), now)?;
        }
        for def in &config.quotas {
            quotas.define(def.clone())?;
        }

        let replicator = Arc::new(Replicator::new(
            config.replication.sync.clone(),
            reputation.clone(),
            transport,
            clock.clone(),
        ));
        for peer in &config.replication.peers {
            match replicator.register_peer(&peer.node_id, &peer.endpoint) {
                Ok(()) | Err(ReplError::AlreadyRegistered { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            node = %config.node.node_id,
            rules = config.rules.len(),
            quotas = config.quotas.len(),
            peers = config.replication.peers.len(),
            "node initialized"
        );

        Ok(Self {
            config,
            clock,
            reputation,
            decay,
            rules,
            quotas,
            throttle,
            violations,
            buckets,
            in_flight,
            admission,
            replicator,
        })
    }

    /// Build a node with an in-memory store, TCP transport and the system clock.
    pub fn from_config(config: NodeConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(TcpTransport::default()),
            Arc::new(SystemClock),
        )
    }

    /// Configuration in use.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    /// Current time per the node's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Replicator, also the handler for inbound peer requests.
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Auto-throttle controller.
    pub fn throttle(&self) -> &Arc<AutoThrottle> {
        &self.throttle
    }

    /// In-flight counter reported to the load sampler.
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    // Admission

    /// Check and count one request for a single identity.
    pub fn check_limit(&self, system: &str, scope: Scope, scope_value: &str, resource_type: Option<&str>) -> Decision {
        self.admission
            .check_limit(system, scope, scope_value, resource_type, self.now_ms())
    }

    /// Check and count one request carrying several identities.
    pub fn decide(&self, request: &AdmissionRequest) -> Decision {
        self.admission.decide(request, self.now_ms())
    }

    // Rules

    /// Create a rule.
    pub fn create_rule(&self, spec: RuleSpec) -> Result<Rule> {
        Ok(self.rules.create(spec, self.now_ms())?)
    }

    /// Replace a rule's fields.
    pub fn update_rule(&self, rule_id: u64, spec: RuleSpec) -> Result<Rule> {
        Ok(self.rules.update(rule_id, spec, self.now_ms())?)
    }

    /// Delete a rule. Unknown ids are a no-op.
    pub fn delete_rule(&self, rule_id: u64) -> bool {
        self.rules.delete(rule_id)
    }

    /// One rule.
    pub fn rule(&self, rule_id: u64) -> Option<Rule> {
        self.rules.get(rule_id)
    }

    /// Rules of `system` plus global rules, by priority.
    pub fn list_rules(&self, system: &str) -> Vec<Rule> {
        self.rules.list(system)
    }

    // Quotas

    /// Define a quota.
    pub fn define_quota(&self, def: QuotaDefinition) -> Result<QuotaDefinition> {
        Ok(self.quotas.define(def)?)
    }

    /// Remove a quota definition.
    pub fn remove_quota(&self, quota_id: u64) -> bool {
        self.quotas.remove(quota_id)
    }

    /// All quota definitions.
    pub fn quotas(&self) -> Vec<QuotaDefinition> {
        self.quotas.definitions()
    }

    /// Current-period quota state of a subject.
    pub fn quota_state(&self, system: &str, scope: Scope, scope_value: &str, resource_type: Option<&str>) -> Vec<QuotaUsage> {
        self.admission
            .quota_state(system, scope, scope_value, resource_type, self.now_ms())
    }

    /// Consume quota outside the request path.
    pub fn increment_quota(
        &self,
        system: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        amount: u64,
    ) -> std::result::Result<Vec<QuotaUsage>, Denial> {
        self.admission
            .increment_quota(system, scope, scope_value, resource_type, amount, self.now_ms())
    }

    /// Quotas and live windows of a subject.
    pub fn usage(&self, system: &str, scope: Scope, scope_value: &str) -> UsageReport {
        self.admission.usage(system, scope, scope_value, self.now_ms())
    }

    // Violations

    /// Violations of `system` (every system when `None`) since `since_ms`, newest first.
    pub fn violations(&self, system: Option<&str>, since_ms: u64, limit: usize) -> Vec<Violation> {
        self.violations.query(system, since_ms, limit)
    }

    /// Violation totals.
    pub fn violation_stats(&self, system: Option<&str>) -> ViolationStats {
        self.violations.stats(system)
    }

    // Reputation reads

    /// Score, tier, multiplier, VIP status and recent violations of a user.
    pub fn reputation(&self, user_id: &str) -> Result<UserReputationView> {
        Ok(self.reputation.view(user_id, self.now_ms())?)
    }

    /// Multiplier currently applied to a user's limits.
    pub fn multiplier(&self, user_id: &str) -> Result<f64> {
        Ok(self.reputation.multiplier(user_id, self.now_ms())?)
    }

    /// Most recent violation events of a user.
    pub fn recent_violations(&self, user_id: &str, limit: usize) -> Result<Vec<ViolationSummary>> {
        Ok(self.reputation.recent_violations(user_id, limit)?)
    }

    /// Events of a user since `since_ms`.
    pub fn history(&self, user_id: &str, since_ms: u64) -> Result<Vec<ReputationEvent>> {
        Ok(self.reputation.history(user_id, since_ms)?)
    }

    /// Per-day score movement over the last `days` days.
    pub fn trend(&self, user_id: &str, days: u32) -> Result<Vec<TrendPoint>> {
        Ok(self.reputation.trend(user_id, days, self.now_ms())?)
    }

    /// Population statistics.
    pub fn reputation_stats(&self) -> Result<ReputationStats> {
        Ok(self.reputation.stats(self.now_ms())?)
    }

    /// Compare a user's stored score with a replay of the event log.
    pub fn consistency_check(&self, user_id: &str) -> Result<ConsistencyCheck> {
        Ok(ConsistencyCheck {
            stored: self.reputation.score(user_id, self.now_ms())?.score,
            replayed: self.reputation.replay_user(user_id)?,
        })
    }

    // Admin overrides

    /// Set a user's score through a replicated `manual` event.
    pub fn set_score(&self, user_id: &str, score: f64, reason: &str) -> Result<ApplyOutcome> {
        let outcome = self.reputation.set_score(user_id, score, reason, self.now_ms())?;
        info!(user = %user_id, score, reason, "score set by operator");
        Ok(outcome)
    }

    /// Grant a VIP multiplier until `expires_at_ms`.
    pub fn assign_vip(&self, user_id: &str, tier: &str, multiplier: f64, expires_at_ms: u64, notes: &str) -> Result<()> {
        let now = self.now_ms();
        self.reputation.assign_vip(
            VipAssignment {
                user_id: user_id.to_string(),
                tier: tier.to_string(),
                multiplier,
                expires_at_ms,
                notes: notes.to_string(),
                assigned_at_ms: now,
            },
            now,
        )?;
        Ok(())
    }

    /// Revoke a VIP assignment.
    pub fn remove_vip(&self, user_id: &str) -> Result<bool> {
        Ok(self.reputation.remove_vip(user_id)?)
    }

    /// Decay users that are due.
    pub fn run_decay(&self) -> Result<DecayReport> {
        Ok(self.decay.run(self.now_ms())?)
    }

    /// Decay every user now, regardless of when they were last decayed.
    pub fn decay_all(&self) -> Result<DecayReport> {
        Ok(self.decay.run_all(self.now_ms())?)
    }

    /// Force a throttle level.
    pub fn set_throttle_level(&self, level: ThrottleLevel, reason: &str) -> ThrottleEvent {
        self.throttle.set_level(level, reason, self.now_ms())
    }

    /// Feed one load sample to the auto-throttle.
    pub fn observe_load(&self, sample: LoadSample) -> Option<ThrottleEvent> {
        self.throttle.observe(sample)
    }

    /// Throttle activity summary.
    pub fn throttle_stats(&self) -> ThrottleStats {
        self.throttle.stats()
    }

    /// Most recent throttle events, newest first.
    pub fn throttle_history(&self, limit: usize) -> Vec<ThrottleEvent> {
        self.throttle.history(limit)
    }

    // Node registry and replication

    /// Register a peer.
    pub fn register_peer(&self, node_id: &str, endpoint: &str) -> Result<()> {
        Ok(self.replicator.register_peer(node_id, endpoint)?)
    }

    /// Unregister a peer; its sync worker exits on its next cycle.
    pub fn unregister_peer(&self, node_id: &str) -> Result<PeerRecord> {
        Ok(self.replicator.unregister_peer(node_id)?)
    }

    /// Registered peers.
    pub fn peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.replicator.registry().peers()?)
    }

    /// Sync state of every peer.
    pub fn sync_health(&self) -> Result<Vec<SyncState>> {
        Ok(self.replicator.health()?)
    }

    /// Replication statistics.
    pub fn replication_stats(&self) -> Result<ReplicationStats> {
        Ok(self.replicator.stats()?)
    }

    /// Sync with every peer now.
    pub async fn sync_now(&self) -> Result<Vec<(String, std::result::Result<SyncReport, ReplError>)>> {
        Ok(self.replicator.sync_all().await?)
    }

    /// Consensus across node views of a user.
    pub fn consensus(&self, user_id: &str) -> Result<Option<Consensus>> {
        Ok(self.replicator.consensus(user_id)?)
    }

    /// Designate the authoritative node for a user.
    pub fn set_authoritative(&self, user_id: &str, node_id: &str) -> Result<bool> {
        Ok(self.replicator.set_authoritative(user_id, node_id)?)
    }

    /// Collapse divergent node views of a user and broadcast the result.
    pub async fn resolve_user(&self, user_id: &str) -> Result<ResolveOutcome> {
        Ok(self.replicator.resolve_user(user_id).await?)
    }

    /// Users whose node views disagree beyond the configured spread.
    pub fn check_conflicts(&self) -> Result<Vec<Consensus>> {
        Ok(self.replicator.check_conflicts()?)
    }

    // Cleanup

    /// Reclaim buckets past their grace period.
    pub fn sweep_buckets(&self) -> usize {
        self.buckets.sweep(self.now_ms())
    }

    /// Drop buckets, violations, quota rows and idempotency keys past retention.
    pub fn cleanup(&self) -> CleanupReport {
        let report = self
            .admission
            .cleanup(&self.config.retention.policy, self.now_ms());
        info!(
            buckets = report.buckets,
            violations = report.violations,
            quotas = report.quotas,
            idempotency_keys = report.idempotency_keys,
            idle_subjects = report.idle_subjects,
            "retention cleanup complete"
        );
        report
    }

    /// Remove events that share a hash, keeping the most recent id.
    pub fn purge_duplicate_events(&self) -> Result<usize> {
        Ok(self.reputation.purge_duplicate_events()?)
    }
}

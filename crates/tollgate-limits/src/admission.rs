//! Admission decisions: rule × reputation × throttle against buckets and quotas.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tollgate_reputation::{EventType, NewEvent, ReputationStore};
use tracing::{debug, warn};

use crate::bucket::{BucketRequest, BucketSnapshot, BucketStore, Committed};
use crate::error::Denial;
use crate::quota::{QuotaDefinition, QuotaTracker, QuotaUsage};
use crate::rule::{FailurePolicy, LimitType, Rule, RuleSet, Scope, ScopeCandidate};
use crate::throttle::{AutoThrottle, InFlight};
use crate::violation::{Violation, ViolationLog};

/// Absorbs float error so `100 × 0.3` floors to 30, not 29.
const LIMIT_EPSILON: f64 = 1e-9;

/// When a denial becomes a reputation strike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrikePolicy {
    /// Emit violation events at all.
    pub enabled: bool,
    /// Denials at or above this severity always strike.
    pub min_severity: u8,
    /// Otherwise every n-th denial of the same user strikes.
    pub every_n_denials: u32,
}

impl Default for StrikePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: 3,
            every_n_denials: 5,
        }
    }
}

/// Reputation credit for allowed requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanCredit {
    /// Allowed requests folded into one `clean_request` event; 0 disables credit.
    pub batch: u64,
    /// Score gained per allowed request.
    pub per_request: f64,
}

impl Default for CleanCredit {
    fn default() -> Self {
        Self {
            batch: 100,
            per_request: 0.01,
        }
    }
}

/// Last-resort rule installed when nothing else matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    /// Window length.
    pub limit_type: LimitType,
    /// Requests per window.
    pub limit_value: u64,
}

/// Admission configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Behavior when no rule matches or the bucket store is busy.
    pub failure_policy: FailurePolicy,
    /// How long a decision may wait on a bucket key.
    pub store_wait_ms: u64,
    /// How long a decision is replayed for a repeated idempotency key.
    pub idempotency_ttl_ms: u64,
    /// Reputation strikes.
    pub strikes: StrikePolicy,
    /// Reputation credit.
    pub clean_credit: CleanCredit,
    /// Generous global default rule; `None` disables it.
    pub fallback: Option<FallbackRule>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Closed,
            store_wait_ms: 50,
            idempotency_ttl_ms: 5 * 60 * 1_000,
            strikes: StrikePolicy::default(),
            clean_credit: CleanCredit::default(),
            fallback: Some(FallbackRule {
                limit_type: LimitType::PerMinute,
                limit_value: 10_000,
            }),
        }
    }
}

/// How long each kind of record is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Buckets are dropped this long after their window ends.
    pub bucket_retention_ms: u64,
    /// Violations older than this are dropped.
    pub violation_retention_ms: u64,
    /// Quota rows whose period ended longer ago than this are dropped.
    pub quota_retention_ms: u64,
    /// Per-user denial streaks and clean-request tallies idle this long are dropped.
    pub subject_idle_ms: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            bucket_retention_ms: 60 * 60 * 1_000,
            violation_retention_ms: 30 * 24 * 60 * 60 * 1_000,
            quota_retention_ms: 90 * 24 * 60 * 60 * 1_000,
            subject_idle_ms: 60 * 60 * 1_000,
        }
    }
}

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Buckets removed.
    pub buckets: usize,
    /// Violations removed.
    pub violations: usize,
    /// Quota rows removed.
    pub quotas: usize,
    /// Expired idempotency entries removed.
    pub idempotency_keys: usize,
    /// Idle per-user tallies removed.
    pub idle_subjects: usize,
}

/// An inbound operation to admit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Calling system.
    pub system: String,
    /// Identities of the caller.
    pub candidates: Vec<ScopeCandidate>,
    /// Resource type.
    pub resource_type: Option<String>,
    /// Reputation subject; defaults to the `user` candidate.
    pub user_id: Option<String>,
    /// Replays the earlier decision for the same key.
    pub idempotency_key: Option<String>,
}

impl AdmissionRequest {
    /// A request with no identities yet.
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            candidates: Vec::new(),
            resource_type: None,
            user_id: None,
            idempotency_key: None,
        }
    }

    /// Add a scope identity.
    pub fn with(mut self, scope: Scope, value: impl Into<String>) -> Self {
        let value = value.into();
        if scope == Scope::User && self.user_id.is_none() {
            self.user_id = Some(value.clone());
        }
        self.candidates.push(ScopeCandidate::new(scope, value));
        self
    }

    /// Set the resource type.
    pub fn resource(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Set the idempotency key.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn candidates_with_global(&self) -> Vec<ScopeCandidate> {
        let mut candidates = self.candidates.clone();
        if !candidates.iter().any(|c| c.scope == Scope::Global) {
            candidates.push(ScopeCandidate::new(Scope::Global, "default"));
        }
        candidates
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Requests left in the current window (and quota period).
    pub remaining: u64,
    /// When the limiting window or quota period resets.
    pub reset_at_ms: Option<u64>,
    /// Human-readable reason.
    pub reason: String,
    /// Typed denial.
    pub denial: Option<Denial>,
    /// Matched rule.
    pub rule_id: Option<u64>,
    /// Limit after multipliers.
    pub effective_limit: Option<u64>,
    /// Reputation multiplier applied.
    pub reputation_multiplier: f64,
    /// Throttle multiplier applied.
    pub throttle_multiplier: f64,
}

impl Decision {
    fn allow(remaining: u64, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at_ms: None,
            reason: reason.into(),
            denial: None,
            rule_id: None,
            effective_limit: None,
            reputation_multiplier: 1.0,
            throttle_multiplier: 1.0,
        }
    }

    fn deny(denial: Denial) -> Self {
        let reset_at_ms = match &denial {
            Denial::QuotaExceeded { resets_at_ms, .. } => Some(*resets_at_ms),
            _ => None,
        };
        Self {
            allowed: false,
            remaining: 0,
            reset_at_ms,
            reason: denial.to_string(),
            denial: Some(denial),
            rule_id: None,
            effective_limit: None,
            reputation_multiplier: 1.0,
            throttle_multiplier: 1.0,
        }
    }

    /// Time until a retry can succeed, if known.
    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        match &self.denial {
            Some(Denial::RateLimited { retry_after_ms, .. }) => Some(*retry_after_ms),
            Some(Denial::QuotaExceeded { resets_at_ms, .. }) => Some(resets_at_ms.saturating_sub(now_ms)),
            _ => None,
        }
    }
}

/// Live usage of one subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Current-period quota rows.
    pub quotas: Vec<QuotaUsage>,
    /// Live bucket windows.
    pub buckets: Vec<BucketSnapshot>,
}

/// Severity of a violation on a resource type.
pub fn severity_for(resource_type: Option<&str>) -> u8 {
    match resource_type {
        Some("login") => 3,
        Some("api_call") => 1,
        _ => 2,
    }
}

/// Score change of a strike, growing with the user's prior violations.
pub fn violation_delta(severity: u8, previous_violations: u64) -> f64 {
    let repeat_penalty = previous_violations.saturating_sub(2) as f64 * 2.0;
    -(f64::from(severity) * 5.0 + repeat_penalty)
}

/// Composes the rule, reputation, throttle, bucket, and quota layers.
pub struct AdmissionController {
    config: AdmissionConfig,
    rules: Arc<RuleSet>,
    buckets: Arc<BucketStore>,
    quotas: Arc<QuotaTracker>,
    throttle: Arc<AutoThrottle>,
    reputation: Arc<ReputationStore>,
    violations: Arc<ViolationLog>,
    in_flight: Arc<InFlight>,
    idempotency: DashMap<String, (Decision, u64)>,
    denial_streaks: DashMap<String, Tally>,
    clean_counters: DashMap<String, Tally>,
}

/// A per-user counter and when it last moved.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: u64,
    touched_ms: u64,
}

impl Tally {
    fn bump(&mut self, now_ms: u64) -> u64 {
        self.count += 1;
        self.touched_ms = self.touched_ms.max(now_ms);
        self.count
    }
}

/// The shared components an [`AdmissionController`] composes.
pub struct AdmissionParts {
    /// Rule table.
    pub rules: Arc<RuleSet>,
    /// Windowed counters.
    pub buckets: Arc<BucketStore>,
    /// Quotas.
    pub quotas: Arc<QuotaTracker>,
    /// Global throttle.
    pub throttle: Arc<AutoThrottle>,
    /// Reputation store.
    pub reputation: Arc<ReputationStore>,
    /// Violation log.
    pub violations: Arc<ViolationLog>,
    /// In-flight counter fed to the load sampler.
    pub in_flight: Arc<InFlight>,
}

impl AdmissionController {
    /// Create a controller and install the fallback rule.
    pub fn new(config: AdmissionConfig, parts: AdmissionParts) -> Self {
        parts
            .rules
            .set_fallback(config.fallback.as_ref().map(|f| (f.limit_type, f.limit_value)));
        Self {
            config,
            rules: parts.rules,
            buckets: parts.buckets,
            quotas: parts.quotas,
            throttle: parts.throttle,
            reputation: parts.reputation,
            violations: parts.violations,
            in_flight: parts.in_flight,
            idempotency: DashMap::new(),
            denial_streaks: DashMap::new(),
            clean_counters: DashMap::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Single-identity check.
    pub fn check_limit(
        &self,
        system: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now_ms: u64,
    ) -> Decision {
        let mut req = AdmissionRequest::new(system).with(scope, scope_value);
        req.resource_type = resource_type.map(str::to_string);
        self.decide(&req, now_ms)
    }

    /// Decide whether `req` may proceed. Never fails; denials are values.
    ///
    /// A request carrying an idempotency key holds that key's entry while it
    /// is evaluated, so concurrent retries wait and replay the first decision.
    pub fn decide(&self, req: &AdmissionRequest, now_ms: u64) -> Decision {
        let Some(key) = &req.idempotency_key else {
            return self.evaluate_counted(req, now_ms);
        };
        let expires_at_ms = now_ms.saturating_add(self.config.idempotency_ttl_ms);
        match self.idempotency.entry(key.clone()) {
            Entry::Occupied(mut cached) => {
                if cached.get().1 > now_ms {
                    debug!(key = %key, "idempotent decision replayed");
                    return cached.get().0.clone();
                }
                let decision = self.evaluate_counted(req, now_ms);
                cached.insert((decision.clone(), expires_at_ms));
                decision
            }
            Entry::Vacant(slot) => {
                let decision = self.evaluate_counted(req, now_ms);
                slot.insert((decision.clone(), expires_at_ms));
                decision
            }
        }
    }

    fn evaluate_counted(&self, req: &AdmissionRequest, now_ms: u64) -> Decision {
        let _in_flight = self.in_flight.enter();
        self.evaluate(req, now_ms)
    }

    fn evaluate(&self, req: &AdmissionRequest, now_ms: u64) -> Decision {
        let resource = req.resource_type.as_deref();
        let Some((rule, subject)) = self.rules.resolve(&req.system, &req.candidates_with_global(), resource) else {
            return match self.config.failure_policy {
                FailurePolicy::Open => Decision::allow(u64::MAX, "no matching rule (fail open)"),
                FailurePolicy::Closed => {
                    debug!(system = %req.system, "no rule matched, failing closed");
                    Decision::deny(Denial::RuleNotFound {
                        system: req.system.clone(),
                        resource_type: req.resource_type.clone(),
                    })
                }
            };
        };

        let reputation_multiplier = self.reputation_multiplier(req.user_id.as_deref(), now_ms);
        let throttle_multiplier = self.throttle.multiplier();
        let effective_limit = effective_limit(rule.limit_value, reputation_multiplier, throttle_multiplier);

        let mut decision = self.admit(req, &rule, &subject, effective_limit, now_ms);
        decision.rule_id = Some(rule.id);
        decision.effective_limit = Some(effective_limit);
        decision.reputation_multiplier = reputation_multiplier;
        decision.throttle_multiplier = throttle_multiplier;
        decision
    }

    fn admit(
        &self,
        req: &AdmissionRequest,
        rule: &Rule,
        subject: &ScopeCandidate,
        limit: u64,
        now_ms: u64,
    ) -> Decision {
        let resource = req.resource_type.as_deref();
        let (quotas, quota_subject) = self.quotas_for(req);
        if let Err(denial) = self.quotas.precheck(&quotas, &quota_subject.value, now_ms) {
            return self.on_denial(req, Some(rule), subject, denial, limit, 0, now_ms);
        }

        let bucket_req = BucketRequest {
            rule_id: rule.id,
            scope_value: &subject.value,
            resource_type: resource.unwrap_or_default(),
            window_ms: rule.window_ms(),
            limit,
        };
        let deadline = Instant::now() + Duration::from_millis(self.config.store_wait_ms);
        // Quota is consumed under the bucket key, so a quota refusal never
        // leaves a count behind in the window.
        let committed = self
            .buckets
            .try_check_and_commit(bucket_req, now_ms, deadline, || {
                self.quotas.consume(&quotas, &quota_subject.value, 1, now_ms)
            });
        let (outcome, quota_rows) = match committed {
            Ok(Committed::Counted(outcome, rows)) => (outcome, rows),
            Ok(Committed::Full(outcome)) => {
                let denial = Denial::RateLimited {
                    limit,
                    count: outcome.count,
                    retry_after_ms: outcome.reset_at_ms.saturating_sub(now_ms),
                };
                let mut decision = self.on_denial(req, Some(rule), subject, denial, limit, outcome.count, now_ms);
                decision.reset_at_ms = Some(outcome.reset_at_ms);
                return decision;
            }
            Ok(Committed::Refused(outcome, denial)) => {
                return self.on_denial(req, Some(rule), subject, denial, limit, outcome.count, now_ms);
            }
            Err(busy) => {
                let waited_ms = busy.waited.as_millis() as u64;
                warn!(rule_id = rule.id, subject = %subject.value, waited_ms, "bucket store busy");
                return match self.config.failure_policy {
                    FailurePolicy::Open => Decision::allow(0, "bucket store busy (fail open)"),
                    FailurePolicy::Closed => Decision::deny(Denial::StoreTimeout { waited_ms }),
                };
            }
        };

        if let Some(user) = req.user_id.as_deref() {
            self.credit_clean_request(user, now_ms);
        }

        let quota_remaining = quota_rows.iter().map(QuotaUsage::remaining).min().unwrap_or(u64::MAX);
        let mut decision = Decision::allow(outcome.remaining.min(quota_remaining), "allowed");
        decision.reset_at_ms = Some(outcome.reset_at_ms);
        decision
    }

    /// Quotas of the most specific identity that has any.
    fn quotas_for(&self, req: &AdmissionRequest) -> (Vec<QuotaDefinition>, ScopeCandidate) {
        let mut candidates = req.candidates_with_global();
        candidates.sort_by(|a, b| b.scope.specificity().cmp(&a.scope.specificity()));
        let resource = req.resource_type.as_deref();
        for candidate in &candidates {
            let defs = self.quotas.matching(&req.system, candidate.scope, &candidate.value, resource);
            if !defs.is_empty() {
                return (defs, candidate.clone());
            }
        }
        (Vec::new(), ScopeCandidate::new(Scope::Global, "default"))
    }

    fn reputation_multiplier(&self, user: Option<&str>, now_ms: u64) -> f64 {
        let Some(user) = user else {
            return 1.0;
        };
        match self.reputation.multiplier(user, now_ms) {
            Ok(m) => m,
            Err(e) => {
                warn!(user = %user, error = %e, "reputation lookup failed, using neutral multiplier");
                1.0
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_denial(
        &self,
        req: &AdmissionRequest,
        rule: Option<&Rule>,
        subject: &ScopeCandidate,
        denial: Denial,
        limit: u64,
        actual_count: u64,
        now_ms: u64,
    ) -> Decision {
        let severity = severity_for(req.resource_type.as_deref());
        self.violations.record(Violation {
            id: 0,
            system: req.system.clone(),
            rule_id: rule.map(|r| r.id),
            scope: subject.scope,
            scope_value: subject.value.clone(),
            resource_type: req.resource_type.clone(),
            limit,
            actual_count,
            kind: denial.kind().to_string(),
            severity,
            timestamp_ms: now_ms,
        });
        debug!(system = %req.system, subject = %subject.value, kind = denial.kind(), "request denied");

        if let Some(user) = req.user_id.as_deref() {
            self.maybe_strike(user, severity, &denial, now_ms);
        }
        Decision::deny(denial)
    }

    fn maybe_strike(&self, user: &str, severity: u8, denial: &Denial, now_ms: u64) {
        let policy = &self.config.strikes;
        if !policy.enabled {
            return;
        }
        let streak = self
            .denial_streaks
            .entry(user.to_string())
            .or_default()
            .bump(now_ms);
        let strike = severity >= policy.min_severity
            || (policy.every_n_denials > 0 && streak % u64::from(policy.every_n_denials) == 0);
        if !strike {
            return;
        }

        let previous = match self.reputation.score(user, now_ms) {
            Ok(row) => row.violation_count,
            Err(e) => {
                warn!(user = %user, error = %e, "reputation read failed, strike skipped");
                return;
            }
        };
        let event = NewEvent::new(user, EventType::Violation, violation_delta(severity, previous), now_ms)
            .with_severity(severity)
            .with_reason(denial.kind());
        if let Err(e) = self.reputation.record(event) {
            warn!(user = %user, error = %e, "failed to record violation event");
        }
    }

    fn credit_clean_request(&self, user: &str, now_ms: u64) {
        let credit = &self.config.clean_credit;
        if credit.batch == 0 {
            return;
        }
        let due = {
            let mut tally = self.clean_counters.entry(user.to_string()).or_default();
            if tally.bump(now_ms) >= credit.batch {
                tally.count = 0;
                true
            } else {
                false
            }
        };
        if due {
            let delta = credit.batch as f64 * credit.per_request;
            let event = NewEvent::new(user, EventType::CleanRequest, delta, now_ms)
                .with_reason(format!("{} clean requests", credit.batch));
            if let Err(e) = self.reputation.record(event) {
                warn!(user = %user, error = %e, "failed to record clean-request credit");
            }
        }
    }

    /// Quota state of a subject for the current periods.
    pub fn quota_state(
        &self,
        system: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now_ms: u64,
    ) -> Vec<QuotaUsage> {
        self.quotas
            .matching(system, scope, scope_value, resource_type)
            .iter()
            .map(|d: &QuotaDefinition| self.quotas.usage(d, scope_value, now_ms))
            .collect()
    }

    /// Consume quota outside the request path (batch jobs and the like).
    pub fn increment_quota(
        &self,
        system: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        amount: u64,
        now_ms: u64,
    ) -> Result<Vec<QuotaUsage>, Denial> {
        let defs = self.quotas.matching(system, scope, scope_value, resource_type);
        self.quotas.consume(&defs, scope_value, amount, now_ms)
    }

    /// Quotas and live windows of one subject.
    pub fn usage(&self, system: &str, scope: Scope, scope_value: &str, now_ms: u64) -> UsageReport {
        let rule_ids: Vec<u64> = self
            .rules
            .list(system)
            .iter()
            .map(|r| r.id)
            .chain(std::iter::once(0))
            .collect();
        UsageReport {
            quotas: self.quota_state(system, scope, scope_value, None, now_ms),
            buckets: self.buckets.snapshots_for(scope_value, Some(&rule_ids), now_ms),
        }
    }

    /// Delete buckets, violations, quota rows, and idempotency entries past retention.
    pub fn cleanup(&self, retention: &RetentionPolicy, now_ms: u64) -> CleanupReport {
        let buckets = self
            .buckets
            .purge_ended_before(now_ms.saturating_sub(retention.bucket_retention_ms.max(self.buckets.config().grace_ms)));
        let violations = self
            .violations
            .purge_before(now_ms.saturating_sub(retention.violation_retention_ms));
        let quotas = self
            .quotas
            .purge_before(now_ms.saturating_sub(retention.quota_retention_ms));
        let before = self.idempotency.len();
        self.idempotency.retain(|_, (_, expires)| *expires > now_ms);
        let idempotency_keys = before.saturating_sub(self.idempotency.len());
        let idle_before = now_ms.saturating_sub(retention.subject_idle_ms);
        let tallies = self.denial_streaks.len() + self.clean_counters.len();
        self.denial_streaks.retain(|_, t| t.touched_ms > idle_before);
        self.clean_counters.retain(|_, t| t.touched_ms > idle_before);
        let idle_subjects = tallies.saturating_sub(self.denial_streaks.len() + self.clean_counters.len());
        CleanupReport {
            buckets,
            violations,
            quotas,
            idempotency_keys,
            idle_subjects,
        }
    }
}

/// `floor(limit × reputation × throttle)`, at least 1.
pub fn effective_limit(limit: u64, reputation_multiplier: f64, throttle_multiplier: f64) -> u64 {
    let raw = limit as f64 * reputation_multiplier * throttle_multiplier;
    ((raw + LIMIT_EPSILON).floor() as u64).max(1)
}

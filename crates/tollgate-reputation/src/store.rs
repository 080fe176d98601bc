//! Event-sourced per-user reputation store.
//!
//! A user's score is the clamped running sum of every event applied to it.
//! Events are deduplicated by content hash, so applying the same event twice
//! (locally or through replication) is a no-op. Mutation happens only through
//! events; an operator "set score" becomes a `manual` event whose delta lands
//! on the requested value.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::DAY_MS;
use crate::error::{ReputationError, Result};
use crate::event::{tier_change_hash, EventType, NewEvent, ReputationEvent, UserId};
use crate::kvstore::{self, BatchOp, KvStore};
use crate::tier::{clamp_score, Tier, TierPolicy, MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE};

const USER_PREFIX: &[u8] = b"rep/user/";
const EVENT_PREFIX: &[u8] = b"rep/event/";
const HASH_PREFIX: &[u8] = b"rep/hash/";
const USER_EVENT_PREFIX: &[u8] = b"rep/uevt/";
const VIP_PREFIX: &[u8] = b"rep/vip/";
const SYNCED_THROUGH_KEY: &[u8] = b"rep/meta/synced_through";

const LOCK_STRIPES: usize = 64;

/// Scores below this are reported as flagged.
pub const FLAGGED_BELOW: f64 = 30.0;
/// Scores below this are reported as suspended.
pub const SUSPENDED_BELOW: f64 = 10.0;

fn user_key(user_id: &str) -> Vec<u8> {
    [USER_PREFIX, user_id.as_bytes()].concat()
}

fn event_key(id: u64) -> Vec<u8> {
    [EVENT_PREFIX, format!("{:020}", id).as_bytes()].concat()
}

fn hash_key(hash: &str) -> Vec<u8> {
    [HASH_PREFIX, hash.as_bytes()].concat()
}

fn user_event_prefix(user_id: &str) -> Vec<u8> {
    [USER_EVENT_PREFIX, user_id.as_bytes(), b"/"].concat()
}

fn user_event_key(user_id: &str, id: u64) -> Vec<u8> {
    [user_event_prefix(user_id), format!("{:020}", id).into_bytes()].concat()
}

fn vip_key(user_id: &str) -> Vec<u8> {
    [VIP_PREFIX, user_id.as_bytes()].concat()
}

fn day_of(ms: u64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .date_naive()
}

/// Persistent per-user reputation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationScore {
    /// The user.
    pub user_id: UserId,
    /// Current score in `[0, 100]`.
    pub score: f64,
    /// Tier derived from `score`.
    pub tier: Tier,
    /// Violations applied so far (reporting only).
    pub violation_count: u64,
    /// Clean-request credits applied so far (reporting only).
    pub clean_count: u64,
    /// Last time decay touched this user.
    pub last_decay_applied_ms: u64,
    /// Timestamp of the most recent violation.
    pub last_violation_ms: Option<u64>,
    /// Last mutation time.
    pub updated_at_ms: u64,
}

impl ReputationScore {
    /// A fresh neutral row.
    pub fn neutral(user_id: &str, now_ms: u64, tiers: &TierPolicy) -> Self {
        Self {
            user_id: user_id.to_string(),
            score: NEUTRAL_SCORE,
            tier: tiers.tier_for(NEUTRAL_SCORE),
            violation_count: 0,
            clean_count: 0,
            last_decay_applied_ms: now_ms,
            last_violation_ms: None,
            updated_at_ms: now_ms,
        }
    }
}

/// Manually granted multiplier override with an explicit expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VipAssignment {
    /// The user.
    pub user_id: UserId,
    /// Label such as `premium` or `enterprise`.
    pub tier: String,
    /// Multiplier applied instead of the tier multiplier.
    pub multiplier: f64,
    /// The override is ignored from this instant on.
    pub expires_at_ms: u64,
    /// Operator notes.
    pub notes: String,
    /// When the assignment was made.
    pub assigned_at_ms: u64,
}

impl VipAssignment {
    /// Returns true while `now < expires_at`.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The event was new and changed the log.
    Applied {
        /// Local id assigned to the event.
        event_id: u64,
        /// Score before the event.
        old_score: f64,
        /// Score after the event.
        new_score: f64,
        /// Tier transition caused by the event, if any.
        tier_change: Option<(Tier, Tier)>,
    },
    /// An event with the same hash was already applied.
    Duplicate {
        /// Current score (unchanged).
        score: f64,
    },
}

impl ApplyOutcome {
    /// Score after the apply call.
    pub fn score(&self) -> f64 {
        match self {
            ApplyOutcome::Applied { new_score, .. } => *new_score,
            ApplyOutcome::Duplicate { score } => *score,
        }
    }

    /// Returns true if the event was a duplicate.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApplyOutcome::Duplicate { .. })
    }
}

/// Recent violation as shown on user-facing surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationSummary {
    /// Local event id.
    pub event_id: u64,
    /// When it happened.
    pub timestamp_ms: u64,
    /// 1 to 3.
    pub severity: u8,
    /// `minor`, `moderate` or `severe`.
    pub severity_label: String,
    /// Recorded reason.
    pub reason: String,
    /// Points lost.
    pub reputation_lost: f64,
}

/// Active VIP override as reported to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VipStatus {
    /// VIP label.
    pub tier: String,
    /// Multiplier in effect.
    pub multiplier: f64,
    /// Expiry.
    pub expires_at_ms: u64,
    /// Whole days until expiry.
    pub days_remaining: u64,
}

/// Complete reputation picture of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReputationView {
    /// The user.
    pub user_id: UserId,
    /// Current score.
    pub score: f64,
    /// Current tier.
    pub tier: Tier,
    /// Multiplier currently applied to the user's limits.
    pub multiplier: f64,
    /// Active VIP override.
    pub vip: Option<VipStatus>,
    /// Next tier up, if any.
    pub next_tier: Option<Tier>,
    /// Points needed to reach `next_tier`.
    pub next_tier_distance: Option<f64>,
    /// Total violations.
    pub violation_count: u64,
    /// Total clean-request credits.
    pub clean_count: u64,
    /// Most recent violations, newest first.
    pub recent_violations: Vec<ViolationSummary>,
}

/// Score movement on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// The day.
    pub date: NaiveDate,
    /// Sum of deltas applied that day.
    pub score_delta: f64,
    /// Number of events that day.
    pub events: usize,
}

/// Population-wide reputation statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationStats {
    /// Users with a stored row.
    pub total_users: usize,
    /// Mean score over those users.
    pub average_score: f64,
    /// Users below [`FLAGGED_BELOW`].
    pub flagged: usize,
    /// Users below [`SUSPENDED_BELOW`].
    pub suspended: usize,
    /// Users per tier.
    pub tier_counts: BTreeMap<Tier, usize>,
    /// Violation events stamped today (UTC).
    pub violations_today: usize,
}

/// Counts over the local event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    /// All events.
    pub total_events: usize,
    /// Replicable events not yet acknowledged by every peer.
    pub unsynced_events: usize,
    /// Events that never leave this node.
    pub local_only_events: usize,
    /// Highest local id.
    pub last_event_id: u64,
}

/// Event-sourced reputation store for one node.
pub struct ReputationStore {
    node_id: String,
    kv: Arc<dyn KvStore>,
    tiers: TierPolicy,
    next_id: AtomicU64,
    stripes: Vec<Mutex<()>>,
    /// Every replicable event at or below this id carries `synced_at`.
    synced_through: Mutex<u64>,
}

impl ReputationStore {
    /// Open the store on top of `kv`, resuming the local id sequence.
    pub fn open(node_id: impl Into<String>, kv: Arc<dyn KvStore>, tiers: TierPolicy) -> Result<Self> {
        let last_id = kv
            .scan_prefix(EVENT_PREFIX)?
            .last()
            .map(|(_, v)| kvstore::decode::<ReputationEvent>(v))
            .transpose()?
            .map(|e| e.id)
            .unwrap_or(0);
        let synced_through = kvstore::get_record::<u64>(kv.as_ref(), SYNCED_THROUGH_KEY)?.unwrap_or(0);

        Ok(Self {
            node_id: node_id.into(),
            kv,
            tiers,
            next_id: AtomicU64::new(last_id + 1),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            synced_through: Mutex::new(synced_through),
        })
    }

    /// The node this store records events for.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Tier policy in use.
    pub fn tiers(&self) -> &TierPolicy {
        &self.tiers
    }

    /// Underlying store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn stripe(&self, user_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Record a locally generated event.
    pub fn record(&self, event: NewEvent) -> Result<ApplyOutcome> {
        let event = event.into_event(0, &self.node_id);
        self.apply_event(event)
    }

    /// Apply an event received from a peer. Idempotent by hash.
    pub fn apply_remote(&self, mut event: ReputationEvent) -> Result<ApplyOutcome> {
        let expected =
            crate::event::event_hash(&event.user_id, event.event_type, event.score_delta, event.timestamp_ms);
        if expected != event.event_hash {
            return Err(ReputationError::HashMismatch {
                expected,
                got: event.event_hash,
            });
        }
        event.synced_at_ms = None;
        self.apply_event(event)
    }

    fn apply_event(&self, event: ReputationEvent) -> Result<ApplyOutcome> {
        let _guard = self.stripe(&event.user_id).lock();
        self.apply_locked(event)
    }

    /// Apply one decay step computed from the score as it stands under the
    /// user's lock.
    ///
    /// `step` maps the current score to a delta, or `None` when the user needs
    /// no event; the user is then only marked as checked at `now_ms`.
    pub fn apply_decay<F>(&self, user_id: &str, stamp_ms: u64, now_ms: u64, step: F) -> Result<Option<ApplyOutcome>>
    where
        F: FnOnce(f64) -> Option<f64>,
    {
        let _guard = self.stripe(user_id).lock();
        let row = self.current_score(user_id, now_ms)?;
        match step(row.score) {
            Some(delta) => {
                let event = NewEvent::new(user_id, EventType::Decay, delta, stamp_ms)
                    .with_reason(format!("decay toward {}", NEUTRAL_SCORE))
                    .into_event(0, &self.node_id);
                self.apply_locked(event).map(Some)
            }
            None => {
                self.mark_decay_checked_locked(user_id, now_ms)?;
                Ok(None)
            }
        }
    }

    /// Caller holds the user's stripe.
    fn apply_locked(&self, mut event: ReputationEvent) -> Result<ApplyOutcome> {
        if self.kv.get(&hash_key(&event.event_hash))?.is_some() {
            let score = self.current_score(&event.user_id, event.timestamp_ms)?;
            debug!(user = %event.user_id, hash = %event.event_hash, "duplicate reputation event skipped");
            return Ok(ApplyOutcome::Duplicate { score: score.score });
        }

        let mut row = self.current_score(&event.user_id, event.timestamp_ms)?;
        let old_score = row.score;
        let old_tier = row.tier;

        row.score = clamp_score(row.score + event.score_delta);
        row.tier = self.tiers.tier_for(row.score);
        row.updated_at_ms = row.updated_at_ms.max(event.timestamp_ms);
        match event.event_type {
            EventType::Violation => {
                row.violation_count += 1;
                row.last_violation_ms = Some(row.last_violation_ms.unwrap_or(0).max(event.timestamp_ms));
            }
            EventType::CleanRequest => row.clean_count += 1,
            EventType::Decay => {
                row.last_decay_applied_ms = row.last_decay_applied_ms.max(event.timestamp_ms);
            }
            EventType::Manual | EventType::TierChange => {}
        }

        event.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut ops = self.event_ops(&event)?;

        let tier_change = (old_tier != row.tier).then_some((old_tier, row.tier));
        if let Some((from, to)) = tier_change {
            if event.event_type != EventType::TierChange {
                let marker_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut marker = NewEvent::new(event.user_id.clone(), EventType::TierChange, 0.0, event.timestamp_ms)
                    .with_reason(format!("{} -> {}", from, to))
                    .local()
                    .into_event(marker_id, &self.node_id);
                marker.event_hash = tier_change_hash(&marker.user_id, from, to, marker_id, marker.timestamp_ms);
                if self.kv.get(&hash_key(&marker.event_hash))?.is_none() {
                    ops.extend(self.event_ops(&marker)?);
                }
            }
            info!(user = %event.user_id, from = %from, to = %to, score = row.score, "reputation tier changed");
        }

        ops.push(BatchOp::put_record(user_key(&row.user_id), &row)?);
        self.kv.write_batch(ops)?;

        debug!(
            user = %event.user_id,
            kind = %event.event_type,
            delta = event.score_delta,
            score = row.score,
            source = %event.source_node_id,
            "reputation event applied"
        );

        Ok(ApplyOutcome::Applied {
            event_id: event.id,
            old_score,
            new_score: row.score,
            tier_change,
        })
    }

    fn event_ops(&self, event: &ReputationEvent) -> Result<Vec<BatchOp>> {
        Ok(vec![
            BatchOp::put_record(event_key(event.id), event)?,
            BatchOp::put_record(hash_key(&event.event_hash), &event.id)?,
            BatchOp::Put {
                key: user_event_key(&event.user_id, event.id),
                value: Vec::new(),
            },
        ])
    }

    fn current_score(&self, user_id: &str, now_ms: u64) -> Result<ReputationScore> {
        Ok(self
            .get(user_id)?
            .unwrap_or_else(|| ReputationScore::neutral(user_id, now_ms, &self.tiers)))
    }

    /// Stored row for a user, if any event has touched them.
    pub fn get(&self, user_id: &str) -> Result<Option<ReputationScore>> {
        kvstore::get_record(self.kv.as_ref(), &user_key(user_id))
    }

    /// Current row, or a neutral one for unknown users.
    pub fn score(&self, user_id: &str, now_ms: u64) -> Result<ReputationScore> {
        self.current_score(user_id, now_ms)
    }

    /// Returns true if an event with this hash has been applied.
    pub fn contains_hash(&self, hash: &str) -> Result<bool> {
        Ok(self.kv.get(&hash_key(hash))?.is_some())
    }

    /// Record that decay looked at a neutral user without emitting an event.
    fn mark_decay_checked_locked(&self, user_id: &str, now_ms: u64) -> Result<()> {
        if let Some(mut row) = self.get(user_id)? {
            row.last_decay_applied_ms = row.last_decay_applied_ms.max(now_ms);
            kvstore::put_record(self.kv.as_ref(), user_key(user_id), &row)?;
        }
        Ok(())
    }

    /// Operator override: move the score to `target` through a `manual` event.
    pub fn set_score(&self, user_id: &str, target: f64, reason: &str, now_ms: u64) -> Result<ApplyOutcome> {
        if !(MIN_SCORE..=MAX_SCORE).contains(&target) {
            return Err(ReputationError::InvalidScore { score: target });
        }
        self.move_score(user_id, target, now_ms, |delta| {
            NewEvent::new(user_id, EventType::Manual, delta, now_ms).with_reason(reason)
        })
    }

    /// Like [`set_score`](Self::set_score) but never replicated.
    pub fn set_score_local(&self, user_id: &str, target: f64, reason: &str, now_ms: u64) -> Result<ApplyOutcome> {
        if !(MIN_SCORE..=MAX_SCORE).contains(&target) {
            return Err(ReputationError::InvalidScore { score: target });
        }
        self.move_score(user_id, target, now_ms, |delta| {
            NewEvent::new(user_id, EventType::Manual, delta, now_ms)
                .with_reason(reason)
                .local()
        })
    }

    /// Apply the event `build` makes from the delta that lands on `target`,
    /// reading the score under the user's lock.
    fn move_score<F>(&self, user_id: &str, target: f64, now_ms: u64, build: F) -> Result<ApplyOutcome>
    where
        F: FnOnce(f64) -> NewEvent,
    {
        let _guard = self.stripe(user_id).lock();
        let current = self.current_score(user_id, now_ms)?;
        self.apply_locked(build(target - current.score).into_event(0, &self.node_id))
    }

    /// Grant or replace a VIP override.
    pub fn assign_vip(&self, vip: VipAssignment, now_ms: u64) -> Result<()> {
        if vip.multiplier <= 0.0 || !vip.multiplier.is_finite() {
            return Err(ReputationError::InvalidVip {
                user_id: vip.user_id,
                msg: "multiplier must be positive".to_string(),
            });
        }
        if vip.expires_at_ms <= now_ms {
            return Err(ReputationError::InvalidVip {
                user_id: vip.user_id,
                msg: "expiry must be in the future".to_string(),
            });
        }
        info!(user = %vip.user_id, tier = %vip.tier, multiplier = vip.multiplier, expires_at_ms = vip.expires_at_ms, "VIP assigned");
        kvstore::put_record(self.kv.as_ref(), vip_key(&vip.user_id), &vip)
    }

    /// Remove a VIP override. Returns true if one existed.
    pub fn remove_vip(&self, user_id: &str) -> Result<bool> {
        let existed = self.kv.get(&vip_key(user_id))?.is_some();
        self.kv.delete(&vip_key(user_id))?;
        if existed {
            info!(user = %user_id, "VIP removed");
        }
        Ok(existed)
    }

    /// Stored VIP assignment, active or not.
    pub fn vip(&self, user_id: &str) -> Result<Option<VipAssignment>> {
        kvstore::get_record(self.kv.as_ref(), &vip_key(user_id))
    }

    /// VIP assignment only while it is active.
    pub fn active_vip(&self, user_id: &str, now_ms: u64) -> Result<Option<VipAssignment>> {
        Ok(self.vip(user_id)?.filter(|v| v.is_active(now_ms)))
    }

    /// Multiplier to apply to the user's limits right now.
    ///
    /// An active VIP override wins; an expired one is ignored on this read.
    pub fn multiplier(&self, user_id: &str, now_ms: u64) -> Result<f64> {
        if let Some(vip) = self.active_vip(user_id, now_ms)? {
            return Ok(vip.multiplier);
        }
        let row = self.current_score(user_id, now_ms)?;
        Ok(self.tiers.multiplier(row.tier))
    }

    /// Every stored user row.
    pub fn users(&self) -> Result<Vec<ReputationScore>> {
        kvstore::scan_records(self.kv.as_ref(), USER_PREFIX)
    }

    /// All events of one user, in application order.
    pub fn events_for(&self, user_id: &str) -> Result<Vec<ReputationEvent>> {
        let mut events = Vec::new();
        for (key, _) in self.kv.scan_prefix(&user_event_prefix(user_id))? {
            let id_part = &key[key.len().saturating_sub(20)..];
            let id = std::str::from_utf8(id_part)
                .ok()
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(id) = id {
                if let Some(event) = self.event(id)? {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    /// One event by local id.
    pub fn event(&self, id: u64) -> Result<Option<ReputationEvent>> {
        kvstore::get_record(self.kv.as_ref(), &event_key(id))
    }

    /// Events with id greater than `after_id`, oldest first, at most `limit`.
    pub fn events_after(&self, after_id: u64, limit: usize) -> Result<Vec<ReputationEvent>> {
        let start = event_key(after_id.saturating_add(1));
        let end = [EVENT_PREFIX, b"~"].concat();
        self.kv
            .scan_range(&start, &end)?
            .into_iter()
            .take(limit)
            .map(|(_, v)| kvstore::decode(&v))
            .collect()
    }

    /// Highest local id handed out so far.
    pub fn last_event_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Stamp `synced_at` on every replicable event up to `up_to_id`.
    ///
    /// Only ids above the stored watermark are read; the watermark moves in
    /// the same batch as the stamps.
    pub fn mark_synced(&self, up_to_id: u64, now_ms: u64) -> Result<usize> {
        let mut through = self.synced_through.lock();
        if up_to_id <= *through {
            return Ok(0);
        }
        let start = event_key(through.saturating_add(1));
        let end = event_key(up_to_id.saturating_add(1));
        let mut ops = Vec::new();
        for (key, value) in self.kv.scan_range(&start, &end)? {
            let mut event: ReputationEvent = kvstore::decode(&value)?;
            if event.local_only || event.synced_at_ms.is_some() {
                continue;
            }
            event.synced_at_ms = Some(now_ms);
            ops.push(BatchOp::put_record(key, &event)?);
        }
        let marked = ops.len();
        ops.push(BatchOp::put_record(SYNCED_THROUGH_KEY.to_vec(), &up_to_id)?);
        self.kv.write_batch(ops)?;
        *through = up_to_id;
        Ok(marked)
    }

    /// Highest id covered by [`mark_synced`](Self::mark_synced).
    pub fn synced_through(&self) -> u64 {
        *self.synced_through.lock()
    }

    /// Counts over the event log.
    pub fn log_stats(&self) -> Result<LogStats> {
        let mut stats = LogStats {
            last_event_id: self.last_event_id(),
            ..LogStats::default()
        };
        for (_, value) in self.kv.scan_prefix(EVENT_PREFIX)? {
            let event: ReputationEvent = kvstore::decode(&value)?;
            stats.total_events += 1;
            if event.local_only {
                stats.local_only_events += 1;
            } else if event.synced_at_ms.is_none() {
                stats.unsynced_events += 1;
            }
        }
        Ok(stats)
    }

    /// Rebuild a user's score from the event log alone.
    pub fn replay_user(&self, user_id: &str) -> Result<f64> {
        Ok(self
            .events_for(user_id)?
            .iter()
            .fold(NEUTRAL_SCORE, |score, e| clamp_score(score + e.score_delta)))
    }

    /// Most recent violations, newest first.
    pub fn recent_violations(&self, user_id: &str, limit: usize) -> Result<Vec<ViolationSummary>> {
        let mut events = self.events_for(user_id)?;
        events.retain(|e| e.event_type == EventType::Violation);
        events.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(b.id.cmp(&a.id)));
        Ok(events
            .into_iter()
            .take(limit)
            .map(|e| ViolationSummary {
                event_id: e.id,
                timestamp_ms: e.timestamp_ms,
                severity: e.severity,
                severity_label: e.severity_label().to_string(),
                reputation_lost: -e.score_delta,
                reason: e.reason,
            })
            .collect())
    }

    /// Events of a user stamped at or after `since_ms`, newest first.
    pub fn history(&self, user_id: &str, since_ms: u64) -> Result<Vec<ReputationEvent>> {
        let mut events = self.events_for(user_id)?;
        events.retain(|e| e.timestamp_ms >= since_ms);
        events.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(b.id.cmp(&a.id)));
        Ok(events)
    }

    /// Per-day deltas for the last `days` UTC days, oldest first.
    pub fn trend(&self, user_id: &str, days: u32, now_ms: u64) -> Result<Vec<TrendPoint>> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let today = day_of(now_ms);
        let first = today - ChronoDuration::days(i64::from(days) - 1);

        let mut points: BTreeMap<NaiveDate, TrendPoint> = (0..days)
            .map(|i| {
                let date = first + ChronoDuration::days(i64::from(i));
                (
                    date,
                    TrendPoint {
                        date,
                        score_delta: 0.0,
                        events: 0,
                    },
                )
            })
            .collect();

        for event in self.events_for(user_id)? {
            if let Some(point) = points.get_mut(&day_of(event.timestamp_ms)) {
                point.score_delta += event.score_delta;
                point.events += 1;
            }
        }
        Ok(points.into_values().collect())
    }

    /// Full user-facing view.
    pub fn view(&self, user_id: &str, now_ms: u64) -> Result<UserReputationView> {
        let row = self.current_score(user_id, now_ms)?;
        let vip = self.active_vip(user_id, now_ms)?.map(|v| VipStatus {
            days_remaining: v.expires_at_ms.saturating_sub(now_ms) / DAY_MS,
            tier: v.tier,
            multiplier: v.multiplier,
            expires_at_ms: v.expires_at_ms,
        });
        let multiplier = vip
            .as_ref()
            .map(|v| v.multiplier)
            .unwrap_or_else(|| self.tiers.multiplier(row.tier));
        let next_tier = row.tier.next();
        let next_tier_distance = next_tier.map(|t| (self.tiers.lower_bound(t) - row.score).max(0.0));

        Ok(UserReputationView {
            user_id: user_id.to_string(),
            score: row.score,
            tier: row.tier,
            multiplier,
            vip,
            next_tier,
            next_tier_distance,
            violation_count: row.violation_count,
            clean_count: row.clean_count,
            recent_violations: self.recent_violations(user_id, 10)?,
        })
    }

    /// Population statistics.
    pub fn stats(&self, now_ms: u64) -> Result<ReputationStats> {
        let users = self.users()?;
        let mut stats = ReputationStats {
            total_users: users.len(),
            ..ReputationStats::default()
        };
        if !users.is_empty() {
            stats.average_score = users.iter().map(|u| u.score).sum::<f64>() / users.len() as f64;
        }
        for user in &users {
            *stats.tier_counts.entry(user.tier).or_default() += 1;
            if user.score < FLAGGED_BELOW {
                stats.flagged += 1;
            }
            if user.score < SUSPENDED_BELOW {
                stats.suspended += 1;
            }
        }

        let today = day_of(now_ms);
        for (_, value) in self.kv.scan_prefix(EVENT_PREFIX)? {
            let event: ReputationEvent = kvstore::decode(&value)?;
            if event.event_type == EventType::Violation && day_of(event.timestamp_ms) == today {
                stats.violations_today += 1;
            }
        }
        Ok(stats)
    }

    /// Drop events that share a hash, keeping the highest id of each group.
    pub fn purge_duplicate_events(&self) -> Result<usize> {
        let mut newest: BTreeMap<String, u64> = BTreeMap::new();
        let mut all = Vec::new();
        for (_, value) in self.kv.scan_prefix(EVENT_PREFIX)? {
            let event: ReputationEvent = kvstore::decode(&value)?;
            let keep = newest.entry(event.event_hash.clone()).or_insert(event.id);
            *keep = (*keep).max(event.id);
            all.push(event);
        }

        let mut ops = Vec::new();
        for event in &all {
            if newest.get(&event.event_hash) != Some(&event.id) {
                ops.push(BatchOp::Delete {
                    key: event_key(event.id),
                });
                ops.push(BatchOp::Delete {
                    key: user_event_key(&event.user_id, event.id),
                });
            }
        }
        let purged = ops.len() / 2;
        if purged > 0 {
            for (hash, id) in &newest {
                ops.push(BatchOp::put_record(hash_key(hash), id)?);
            }
            self.kv.write_batch(ops)?;
            info!(purged, "duplicate reputation events purged");
        }
        Ok(purged)
    }
}

//! Periodic relaxation of reputation scores toward neutral.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::DAY_MS;
use crate::error::{ReputationError, Result};
use crate::store::{ApplyOutcome, ReputationScore, ReputationStore};
use crate::tier::NEUTRAL_SCORE;

/// Deltas smaller than this are treated as "already neutral".
const MIN_DELTA: f64 = 1e-9;

/// How often and how strongly scores decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayPolicy {
    /// Minimum time between two decays of the same user.
    pub interval_ms: u64,
    /// Fraction of the distance to neutral that is kept per interval, in `[0, 1]`.
    pub rate: f64,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DAY_MS,
            rate: 0.9,
        }
    }
}

impl DecayPolicy {
    /// Check the policy values.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 || !(0.0..=1.0).contains(&self.rate) {
            return Err(ReputationError::Store {
                msg: format!(
                    "invalid decay policy: interval {}ms, rate {}",
                    self.interval_ms, self.rate
                ),
            });
        }
        Ok(())
    }

    /// Delta that moves `score` toward neutral by one step.
    pub fn delta_for(&self, score: f64) -> f64 {
        (NEUTRAL_SCORE - score) * (1.0 - self.rate)
    }
}

/// Summary of one decay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Users looked at.
    pub examined: usize,
    /// Users that received a decay event.
    pub decayed: usize,
    /// Users already at neutral, marked without an event.
    pub unchanged: usize,
    /// Users not yet due.
    pub not_due: usize,
    /// Decay events already present (another node got there first).
    pub duplicates: usize,
    /// Users whose decay failed.
    pub errors: usize,
}

/// Emits `decay` events for users whose last decay is older than the interval.
pub struct DecayScheduler {
    store: Arc<ReputationStore>,
    policy: DecayPolicy,
}

impl DecayScheduler {
    /// Create a scheduler over `store`.
    pub fn new(store: Arc<ReputationStore>, policy: DecayPolicy) -> Self {
        Self { store, policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &DecayPolicy {
        &self.policy
    }

    /// Decay every user that is due at `now_ms`.
    ///
    /// The event timestamp is aligned to the interval boundary so nodes that
    /// decay the same unchanged score in the same interval produce the same
    /// hash.
    pub fn run(&self, now_ms: u64) -> Result<DecayReport> {
        let stamp = now_ms - now_ms % self.policy.interval_ms;
        self.pass(now_ms, stamp, false)
    }

    /// Decay every user regardless of when they were last decayed.
    pub fn run_all(&self, now_ms: u64) -> Result<DecayReport> {
        self.pass(now_ms, now_ms, true)
    }

    fn pass(&self, now_ms: u64, stamp_ms: u64, force: bool) -> Result<DecayReport> {
        let mut report = DecayReport::default();
        for row in self.store.users()? {
            report.examined += 1;
            if !force && !self.is_due(&row, now_ms) {
                report.not_due += 1;
                continue;
            }
            match self.decay_user(&row, now_ms, stamp_ms) {
                Ok(Some(outcome)) if outcome.is_duplicate() => report.duplicates += 1,
                Ok(Some(_)) => report.decayed += 1,
                Ok(None) => report.unchanged += 1,
                Err(e) => {
                    warn!(user = %row.user_id, error = %e, "decay failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            examined = report.examined,
            decayed = report.decayed,
            unchanged = report.unchanged,
            duplicates = report.duplicates,
            errors = report.errors,
            "decay pass complete"
        );
        Ok(report)
    }

    fn is_due(&self, row: &ReputationScore, now_ms: u64) -> bool {
        row.last_decay_applied_ms.saturating_add(self.policy.interval_ms) <= now_ms
    }

    fn decay_user(&self, row: &ReputationScore, now_ms: u64, stamp_ms: u64) -> Result<Option<ApplyOutcome>> {
        self.store.apply_decay(&row.user_id, stamp_ms, now_ms, |score| {
            let delta = self.policy.delta_for(score);
            (delta.abs() >= MIN_DELTA).then_some(delta)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, NewEvent};
    use crate::kvstore::MemoryKvStore;
    use crate::tier::TierPolicy;

    fn setup(policy: DecayPolicy) -> (Arc<ReputationStore>, DecayScheduler) {
        let store = Arc::new(
            ReputationStore::open("node-a", Arc::new(MemoryKvStore::new()), TierPolicy::default()).unwrap(),
        );
        (store.clone(), DecayScheduler::new(store, policy))
    }

    #[test]
    fn test_delta_pulls_toward_neutral() {
        let p = DecayPolicy::default();
        assert!((p.delta_for(20.0) - 3.0).abs() < 1e-9);
        assert!((p.delta_for(80.0) + 3.0).abs() < 1e-9);
        assert_eq!(p.delta_for(50.0), 0.0);
    }

    #[test]
    fn test_validate() {
        assert!(DecayPolicy::default().validate().is_ok());
        let bad = DecayPolicy {
            rate: 1.5,
            ..DecayPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_run_decays_due_users_once_per_interval() {
        let (store, sched) = setup(DecayPolicy::default());
        store.set_score("u1", 20.0, "", 1_000).unwrap();

        let report = sched.run(DAY_MS + 1_000).unwrap();
        assert_eq!(report.decayed, 1);
        assert!((store.score("u1", 0).unwrap().score - 23.0).abs() < 1e-9);

        let again = sched.run(DAY_MS + 2_000).unwrap();
        assert_eq!(again.decayed, 0);
        assert_eq!(again.not_due, 1);
    }

    #[test]
    fn test_not_due_users_are_skipped() {
        let (store, sched) = setup(DecayPolicy::default());
        store.set_score("u1", 20.0, "", 1_000).unwrap();
        let report = sched.run(5_000).unwrap();
        assert_eq!(report.not_due, 1);
        assert_eq!(store.score("u1", 0).unwrap().score, 20.0);
    }

    #[test]
    fn test_neutral_user_marked_without_event() {
        let (store, sched) = setup(DecayPolicy::default());
        store
            .record(NewEvent::new("u1", EventType::CleanRequest, 0.0, 10))
            .unwrap();
        let before = store.events_for("u1").unwrap().len();
        let report = sched.run(DAY_MS + 10).unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.events_for("u1").unwrap().len(), before);
        assert_eq!(store.get("u1").unwrap().unwrap().last_decay_applied_ms, DAY_MS + 10);
    }

    #[test]
    fn test_decay_uses_score_written_after_snapshot() {
        let (store, sched) = setup(DecayPolicy::default());
        store.set_score("u1", 20.0, "", 1_000).unwrap();
        let stale = store.get("u1").unwrap().unwrap();
        store.set_score("u1", 55.0, "", 2_000).unwrap();

        let out = sched.decay_user(&stale, DAY_MS + 2_000, DAY_MS).unwrap().unwrap();
        assert!((out.score() - 54.5).abs() < 1e-9);
        assert!((store.replay_user("u1").unwrap() - 54.5).abs() < 1e-9);
    }

    #[test]
    fn test_run_all_ignores_interval() {
        let (store, sched) = setup(DecayPolicy::default());
        store.set_score("u1", 90.0, "", 1_000).unwrap();
        let report = sched.run_all(2_000).unwrap();
        assert_eq!(report.decayed, 1);
        assert!((store.score("u1", 0).unwrap().score - 86.0).abs() < 1e-9);
    }
}

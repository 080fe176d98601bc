//! Property-based tests for tollgate-reputation using proptest.
//!
//! Covers decay monotonicity, idempotent event application, tier purity,
//! and replay equivalence.

use std::sync::Arc;

use proptest::prelude::*;
use tollgate_reputation::{
    tier::clamp_score, DecayPolicy, EventType, MemoryKvStore, NewEvent, ReputationStore, Tier, TierPolicy,
    NEUTRAL_SCORE,
};

fn open_store(node: &str) -> ReputationStore {
    ReputationStore::open(node, Arc::new(MemoryKvStore::new()), TierPolicy::default()).unwrap()
}

/// Generator for event types that carry a score delta.
fn any_delta_type() -> impl Strategy<Value = EventType> {
    prop_oneof![
        Just(EventType::Violation),
        Just(EventType::CleanRequest),
        Just(EventType::Decay),
        Just(EventType::Manual),
    ]
}

/// Generator for (type, delta, timestamp) triples.
fn any_events() -> impl Strategy<Value = Vec<(EventType, f64, u64)>> {
    proptest::collection::vec((any_delta_type(), -40.0f64..40.0, 0u64..1_000_000), 1..40)
}

proptest! {
    /// Test: a decay step moves the score toward 50 and never past it.
    #[test]
    fn test_decay_is_monotonic(score in 0.0f64..=100.0, rate in 0.0f64..=1.0) {
        let policy = DecayPolicy { rate, ..DecayPolicy::default() };
        let after = clamp_score(score + policy.delta_for(score));
        let before_dist = (score - NEUTRAL_SCORE).abs();
        let after_dist = (after - NEUTRAL_SCORE).abs();
        prop_assert!(after_dist <= before_dist + 1e-9);
        if score < NEUTRAL_SCORE {
            prop_assert!(after <= NEUTRAL_SCORE + 1e-9);
        } else {
            prop_assert!(after >= NEUTRAL_SCORE - 1e-9);
        }
    }

    /// Test: the tier is a pure function of the score.
    #[test]
    fn test_tier_is_pure(score in -10.0f64..110.0) {
        let a = TierPolicy::default();
        let b = TierPolicy::default();
        prop_assert_eq!(a.tier_for(score), b.tier_for(score));
        let tier = a.tier_for(score);
        let clamped = clamp_score(score);
        prop_assert!(clamped >= a.lower_bound(tier));
        if let Some(next) = tier.next() {
            prop_assert!(clamped < a.lower_bound(next));
        } else {
            prop_assert_eq!(tier, Tier::Excellent);
        }
    }

    /// Test: applying an event twice yields the same score as applying it once.
    #[test]
    fn test_apply_is_idempotent(events in any_events()) {
        let once = open_store("a");
        let twice = open_store("b");
        for (kind, delta, ts) in &events {
            once.record(NewEvent::new("u", *kind, *delta, *ts)).unwrap();
            let e = NewEvent::new("u", *kind, *delta, *ts).into_event(0, "x");
            twice.apply_remote(e.clone()).unwrap();
            twice.apply_remote(e).unwrap();
        }
        let s1 = once.score("u", 0).unwrap().score;
        let s2 = twice.score("u", 0).unwrap().score;
        prop_assert!((s1 - s2).abs() < 1e-9);
    }

    /// Test: replaying the log reproduces the stored score.
    #[test]
    fn test_replay_matches_stored_score(events in any_events()) {
        let store = open_store("a");
        for (kind, delta, ts) in events {
            store.record(NewEvent::new("u", kind, delta, ts)).unwrap();
        }
        let stored = store.score("u", 0).unwrap().score;
        let replayed = store.replay_user("u").unwrap();
        prop_assert!((stored - replayed).abs() < 1e-9);
        prop_assert!((0.0..=100.0).contains(&stored));
    }
}

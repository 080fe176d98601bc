//! Property-based tests for tollgate-limits using proptest.
//!
//! These exercise the counter invariants under concurrent callers and at the
//! quota boundary.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tollgate_limits::bucket::{BucketConfig, BucketRequest, BucketStore};
use tollgate_limits::throttle::InFlight;
use tollgate_limits::{
    effective_limit, AdmissionConfig, AdmissionController, AdmissionParts, AdmissionRequest, AutoThrottle, LimitType,
    QuotaDefinition, QuotaPeriod, QuotaTracker, RuleSet, RuleSpec, Scope, ThrottleConfig, ViolationLog,
};
use tollgate_reputation::{MemoryKvStore, ReputationStore, TierPolicy};

const NOW: u64 = 1_709_726_400_000;

fn quota(limit: u64) -> QuotaDefinition {
    QuotaDefinition {
        id: 0,
        system: "s".to_string(),
        scope: Scope::User,
        scope_value: None,
        resource_type: None,
        period: QuotaPeriod::Daily,
        limit,
    }
}

/// Controller with one per-minute IP rule and an optional daily IP quota.
fn controller(rate_limit: u64, daily_quota: Option<(Option<&str>, u64)>) -> AdmissionController {
    let rules = Arc::new(RuleSet::new());
    rules
        .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, rate_limit), NOW)
        .unwrap();
    let quotas = Arc::new(QuotaTracker::new());
    if let Some((resource_type, limit)) = daily_quota {
        quotas
            .define(QuotaDefinition {
                scope: Scope::Ip,
                resource_type: resource_type.map(str::to_string),
                ..quota(limit)
            })
            .unwrap();
    }
    let reputation = ReputationStore::open("n", Arc::new(MemoryKvStore::new()), TierPolicy::default()).unwrap();
    AdmissionController::new(
        AdmissionConfig {
            store_wait_ms: 5_000,
            ..AdmissionConfig::default()
        },
        AdmissionParts {
            rules,
            buckets: Arc::new(BucketStore::new(BucketConfig::default())),
            quotas,
            throttle: Arc::new(AutoThrottle::new(ThrottleConfig::default())),
            reputation: Arc::new(reputation),
            violations: Arc::new(ViolationLog::new()),
            in_flight: Arc::new(InFlight::new()),
        },
    )
}

/// Admit `per_thread` requests from each of `threads` threads and count the allowed ones.
fn admit_concurrently(
    controller: &AdmissionController,
    threads: usize,
    per_thread: usize,
    request: impl Fn(usize, usize) -> AdmissionRequest + Sync,
) -> u64 {
    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let request = &request;
                s.spawn(move || {
                    (0..per_thread)
                        .filter(|i| controller.decide(&request(t, *i), NOW).allowed)
                        .count() as u64
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
}

fn window_count(controller: &AdmissionController) -> u64 {
    controller
        .usage("s", Scope::Ip, "10.0.0.1", NOW)
        .buckets
        .iter()
        .map(|b| b.count)
        .sum()
}

#[test]
fn test_concurrent_admit_counts_only_admitted() {
    let controller = controller(20, Some((None, 5)));
    let allowed = admit_concurrently(&controller, 16, 4, |_, _| {
        AdmissionRequest::new("s").with(Scope::Ip, "10.0.0.1")
    });
    assert_eq!(allowed, 5);
    assert_eq!(window_count(&controller), allowed);
}

#[test]
fn test_concurrent_retries_counted_once() {
    let controller = controller(20, None);
    let allowed = admit_concurrently(&controller, 16, 4, |_, _| {
        AdmissionRequest::new("s")
            .with(Scope::Ip, "10.0.0.1")
            .idempotency_key("order-42")
    });
    assert_eq!(allowed, 64);
    assert_eq!(window_count(&controller), 1);
}

#[test]
fn test_any_resource_quota_across_resources() {
    let controller = controller(100, Some((None, 6)));
    let resources = ["read", "write", "list"];
    let allowed = admit_concurrently(&controller, 6, 5, |t, _| {
        AdmissionRequest::new("s")
            .with(Scope::Ip, "10.0.0.1")
            .resource(resources[t % resources.len()])
    });
    assert_eq!(allowed, 6);
    assert_eq!(window_count(&controller), 6);
    let state = controller.quota_state("s", Scope::Ip, "10.0.0.1", Some("read"), NOW);
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].used, 6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Test: N threads hammering one window never admit more than the limit,
    /// and admit exactly the limit when demand exceeds it.
    #[test]
    fn test_concurrent_increments_never_exceed_limit(
        limit in 1u64..200,
        threads in 2usize..8,
        per_thread in 1usize..80,
    ) {
        let store = Arc::new(BucketStore::new(BucketConfig::default()));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut admitted = 0u64;
                    for _ in 0..per_thread {
                        let req = BucketRequest {
                            rule_id: 7,
                            scope_value: "10.0.0.1",
                            resource_type: "",
                            window_ms: 60_000,
                            limit,
                        };
                        if store.check_and_increment(req, NOW).allowed {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let demand = (threads * per_thread) as u64;
        prop_assert!(total <= limit);
        prop_assert_eq!(total, demand.min(limit));
    }

    /// Test: at used == limit - 1 exactly one more unit fits.
    #[test]
    fn test_quota_boundary(limit in 1u64..1_000) {
        let tracker = QuotaTracker::new();
        let defs = vec![tracker.define(quota(limit)).unwrap()];
        if limit > 1 {
            tracker.consume(&defs, "u", limit - 1, NOW).unwrap();
        }
        prop_assert!(tracker.precheck(&defs, "u", NOW).is_ok());
        let rows = tracker.consume(&defs, "u", 1, NOW).unwrap();
        prop_assert_eq!(rows[0].used, limit);
        prop_assert!(tracker.precheck(&defs, "u", NOW).is_err());
        prop_assert!(tracker.consume(&defs, "u", 1, NOW).is_err());
        prop_assert_eq!(tracker.usage(&defs[0], "u", NOW).used, limit);
    }

    /// Test: the effective limit never drops below one nor exceeds the scaled value.
    #[test]
    fn test_effective_limit_bounds(
        limit in 1u64..100_000,
        rep in prop_oneof![Just(0.5f64), Just(0.8), Just(1.0), Just(1.5), Just(2.0)],
        thr in prop_oneof![Just(0.3f64), Just(0.5), Just(0.7), Just(0.9), Just(1.0)],
    ) {
        let eff = effective_limit(limit, rep, thr);
        prop_assert!(eff >= 1);
        prop_assert!(eff as f64 <= (limit as f64 * rep * thr).max(1.0) + 1e-6);
    }

    /// Test: under concurrent admission the allowed count always equals the
    /// window count, and neither exceeds the tighter of rate limit and quota.
    #[test]
    fn test_concurrent_admit_matches_window_count(
        rate_limit in 1u64..40,
        daily in 1u64..40,
        threads in 2usize..8,
        per_thread in 1usize..12,
    ) {
        let controller = controller(rate_limit, Some((None, daily)));
        let allowed = admit_concurrently(&controller, threads, per_thread, |_, _| {
            AdmissionRequest::new("s").with(Scope::Ip, "10.0.0.1")
        });
        let demand = (threads * per_thread) as u64;
        prop_assert_eq!(allowed, window_count(&controller));
        prop_assert_eq!(allowed, demand.min(rate_limit).min(daily));
    }
}

//! End-to-end admission, reputation and replication scenarios.

mod common;

use common::{single_node, TestCluster, NOW};
use tollgate_limits::{AdmissionRequest, Denial, LimitType, LoadSample, RuleSpec, Scope, ThrottleLevel};
use tollgate_reputation::clock::{HOUR_MS, MINUTE_MS};
use tollgate_reputation::Tier;

fn load(cpu_pct: f64, taken_at_ms: u64) -> LoadSample {
    LoadSample {
        cpu_pct,
        memory_pct: 10.0,
        workers: 0,
        taken_at_ms,
    }
}

mod admission {
    use super::*;

    #[test]
    fn test_ip_rule_denies_sixth_request() {
        let (node, _clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::Ip, LimitType::PerMinute, 5))
            .unwrap();

        for i in 0..5 {
            let d = node.check_limit("api", Scope::Ip, "1.2.3.4", None);
            assert!(d.allowed, "request {} denied", i + 1);
            assert_eq!(d.remaining, 4 - i);
        }

        let d = node.check_limit("api", Scope::Ip, "1.2.3.4", None);
        assert!(!d.allowed);
        assert!(matches!(d.denial, Some(Denial::RateLimited { .. })));
        let reset_at = d.reset_at_ms.unwrap();
        assert!(reset_at > NOW && reset_at <= NOW + MINUTE_MS);

        let other = node.check_limit("api", Scope::Ip, "5.6.7.8", None);
        assert!(other.allowed);

        let violations = node.violations(Some("api"), 0, 10);
        assert_eq!(violations.len(), 1);
        assert_eq!(node.violation_stats(None).total, 1);
    }

    #[test]
    fn test_window_resets_next_minute() {
        let (node, clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::Ip, LimitType::PerMinute, 1))
            .unwrap();
        assert!(node.check_limit("api", Scope::Ip, "a", None).allowed);
        assert!(!node.check_limit("api", Scope::Ip, "a", None).allowed);
        clock.advance(MINUTE_MS);
        assert!(node.check_limit("api", Scope::Ip, "a", None).allowed);
    }

    #[test]
    fn test_most_specific_identity_wins() {
        let (node, _clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::Ip, LimitType::PerMinute, 100))
            .unwrap();
        node.create_rule(RuleSpec::new("api", Scope::User, LimitType::PerMinute, 2))
            .unwrap();
        let req = AdmissionRequest::new("api")
            .with(Scope::Ip, "1.2.3.4")
            .with(Scope::User, "alice");
        assert!(node.decide(&req).allowed);
        assert!(node.decide(&req).allowed);
        assert!(!node.decide(&req).allowed);
    }

    #[test]
    fn test_caution_user_gets_reduced_limit() {
        let (node, _clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::User, LimitType::PerMinute, 100))
            .unwrap();
        node.set_score("u1", 30.0, "abuse report").unwrap();
        assert_eq!(node.reputation("u1").unwrap().tier, Tier::Caution);

        for _ in 0..80 {
            let d = node.check_limit("api", Scope::User, "u1", None);
            assert!(d.allowed);
            assert_eq!(d.effective_limit, Some(80));
            assert!((d.reputation_multiplier - 0.8).abs() < 1e-9);
        }
        let d = node.check_limit("api", Scope::User, "u1", None);
        assert!(!d.allowed);
        assert_eq!(d.effective_limit, Some(80));
    }

    #[test]
    fn test_cleanup_drops_expired_violations() {
        let (node, clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::Ip, LimitType::PerMinute, 1))
            .unwrap();
        node.check_limit("api", Scope::Ip, "a", None);
        node.check_limit("api", Scope::Ip, "a", None);
        assert_eq!(node.violations(None, 0, 10).len(), 1);

        clock.advance(31 * 24 * HOUR_MS);
        let report = node.cleanup();
        assert_eq!(report.violations, 1);
        assert!(node.violations(None, 0, 10).is_empty());
    }
}

mod throttle {
    use super::*;

    #[test]
    fn test_critical_load_caps_admissions() {
        let (node, clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::User, LimitType::PerMinute, 100))
            .unwrap();

        let event = node.observe_load(load(96.0, NOW)).unwrap();
        assert_eq!(event.to, ThrottleLevel::Critical);

        for _ in 0..30 {
            let d = node.check_limit("api", Scope::User, "bob", None);
            assert!(d.allowed);
            assert_eq!(d.effective_limit, Some(30));
        }
        assert!(!node.check_limit("api", Scope::User, "bob", None).allowed);

        // One calm sample is not enough to step down.
        assert!(node.observe_load(load(10.0, NOW + 1)).is_none());
        assert_eq!(node.throttle().level(), ThrottleLevel::Critical);
        let event = node.observe_load(load(10.0, NOW + 2)).unwrap();
        assert_eq!(event.to, ThrottleLevel::None);

        clock.advance(MINUTE_MS);
        let d = node.check_limit("api", Scope::User, "bob", None);
        assert_eq!(d.effective_limit, Some(100));
        assert_eq!(node.throttle_stats().total_transitions, 2);
    }

    #[test]
    fn test_manual_override() {
        let (node, _clock) = single_node();
        let event = node.set_throttle_level(ThrottleLevel::High, "maintenance");
        assert_eq!(event.to, ThrottleLevel::High);
        assert!(event.manual);
        assert_eq!(node.throttle_history(10).len(), 1);
    }
}

mod reputation {
    use super::*;

    #[test]
    fn test_expired_vip_falls_back_to_tier() {
        let (node, clock) = single_node();
        node.create_rule(RuleSpec::new("api", Scope::User, LimitType::PerMinute, 10))
            .unwrap();
        node.assign_vip("carol", "partner", 3.0, NOW + HOUR_MS, "launch week")
            .unwrap();
        assert!((node.multiplier("carol").unwrap() - 3.0).abs() < 1e-9);
        let d = node.check_limit("api", Scope::User, "carol", None);
        assert_eq!(d.effective_limit, Some(30));

        clock.advance(2 * HOUR_MS);
        assert!((node.multiplier("carol").unwrap() - 1.0).abs() < 1e-9);
        let d = node.check_limit("api", Scope::User, "carol", None);
        assert_eq!(d.effective_limit, Some(10));
    }

    #[test]
    fn test_vip_in_past_rejected() {
        let (node, _clock) = single_node();
        assert!(node.assign_vip("dave", "partner", 2.0, NOW - 1, "").is_err());
    }

    #[test]
    fn test_login_denial_strikes_user() {
        let (node, _clock) = single_node();
        node.create_rule(RuleSpec::new("auth", Scope::User, LimitType::PerMinute, 1).with_resource("login"))
            .unwrap();
        assert!(node.check_limit("auth", Scope::User, "eve", Some("login")).allowed);
        assert!(!node.check_limit("auth", Scope::User, "eve", Some("login")).allowed);

        let view = node.reputation("eve").unwrap();
        assert!((view.score - 35.0).abs() < 1e-9);
        assert_eq!(view.violation_count, 1);
        assert_eq!(node.recent_violations("eve", 10).unwrap().len(), 1);
        assert!(node.consistency_check("eve").unwrap().is_consistent());
    }

    #[test]
    fn test_decay_moves_toward_neutral() {
        let (node, clock) = single_node();
        node.set_score("frank", 10.0, "test").unwrap();
        clock.advance(8 * 24 * HOUR_MS);
        let report = node.decay_all().unwrap();
        assert!(report.decayed >= 1);
        let score = node.reputation("frank").unwrap().score;
        assert!(score > 10.0 && score <= 50.0);
        assert!(node.consistency_check("frank").unwrap().is_consistent());
    }
}

mod replication {
    use super::*;

    fn strike(cluster: &TestCluster, i: usize, user: &str) {
        let node = cluster.node(i);
        node.create_rule(RuleSpec::new("auth", Scope::User, LimitType::PerMinute, 1).with_resource("login"))
            .unwrap();
        node.check_limit("auth", Scope::User, user, Some("login"));
        assert!(!node.check_limit("auth", Scope::User, user, Some("login")).allowed);
    }

    #[tokio::test]
    async fn test_same_violation_applied_once() {
        let cluster = TestCluster::new(2);
        strike(&cluster, 0, "u1");
        strike(&cluster, 1, "u1");

        let results = cluster.node(0).sync_now().await.unwrap();
        assert_eq!(results.len(), 1);
        let report = results[0].1.as_ref().unwrap();
        assert_eq!(report.pushed_duplicates, 1);
        assert_eq!(report.pulled_duplicates, 1);
        cluster.sync_all().await;

        for node in &cluster.nodes {
            let view = node.reputation("u1").unwrap();
            assert!((view.score - 35.0).abs() < 1e-9, "{} has {}", node.node_id(), view.score);
            assert!(node.consistency_check("u1").unwrap().is_consistent());
        }
    }

    #[tokio::test]
    async fn test_events_reach_every_node() {
        let cluster = TestCluster::new(3);
        cluster.node(0).set_score("u2", 80.0, "trusted").unwrap();
        cluster.sync_all().await;
        for node in &cluster.nodes {
            assert_eq!(node.reputation("u2").unwrap().tier, Tier::Good);
        }
        let stats = cluster.node(0).replication_stats().unwrap();
        assert_eq!(stats.peers, 2);
        assert_eq!(stats.healthy_peers, 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_marks_degraded() {
        let cluster = TestCluster::new(2);
        cluster.net.set_reachable("node-2", false);
        cluster.node(0).set_score("u3", 20.0, "test").unwrap();
        let results = cluster.node(0).sync_now().await.unwrap();
        assert!(results[0].1.is_err());
        let health = cluster.node(0).sync_health().unwrap();
        assert_eq!(health[0].sync_errors, 1);

        cluster.net.set_reachable("node-2", true);
        cluster.sync_all().await;
        assert_eq!(cluster.node(0).sync_health().unwrap()[0].sync_errors, 0);
        assert!((cluster.node(1).reputation("u3").unwrap().score - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let cluster = TestCluster::new(2);
        let node = cluster.node(0);
        assert_eq!(node.peers().unwrap().len(), 1);
        assert!(node.register_peer("node-2", "node-2").is_err());
        let removed = node.unregister_peer("node-2").unwrap();
        assert_eq!(removed.node_id, "node-2");
        assert!(node.peers().unwrap().is_empty());
        assert!(node.sync_now().await.unwrap().is_empty());
    }
}

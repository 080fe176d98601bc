//! Per-node reputation views and cross-node consensus.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tollgate_reputation::kvstore::{self, BatchOp, KvStore};
use tollgate_reputation::{NodeId, Tier, UserId};

use crate::error::Result;

const VIEW_PREFIX: &[u8] = b"repl/view/";

fn user_prefix(user_id: &str) -> Vec<u8> {
    [VIEW_PREFIX, user_id.as_bytes(), b"\0"].concat()
}

fn view_key(user_id: &str, node_id: &str) -> Vec<u8> {
    [user_prefix(user_id).as_slice(), node_id.as_bytes()].concat()
}

/// One node's cached opinion of a user's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReputationView {
    /// The user.
    pub user_id: UserId,
    /// The node holding this score.
    pub node_id: NodeId,
    /// Score on that node.
    pub score: f64,
    /// Tier on that node.
    pub tier: Tier,
    /// Designated ground truth for the user.
    pub is_authoritative: bool,
    /// When the view was last refreshed.
    pub updated_at_ms: u64,
}

/// Agreement statistics across every node's view of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    /// The user.
    pub user_id: UserId,
    /// Number of views.
    pub node_count: usize,
    /// Mean score.
    pub average: f64,
    /// Lowest score.
    pub min: f64,
    /// Highest score.
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
    /// `max - min`.
    pub spread: f64,
    /// The authoritative view, if one is designated.
    pub authoritative: Option<NodeReputationView>,
    /// Authoritative score when present, else the average.
    pub consensus_score: f64,
    /// 1.0 when every node agrees, falling to 0.0 at a spread of 100.
    pub confidence: f64,
    /// Spread exceeds the configured threshold.
    pub conflict: bool,
}

impl Consensus {
    /// Compute consensus over `views`. Returns `None` when there are none.
    pub fn compute(views: &[NodeReputationView], conflict_spread: f64) -> Option<Self> {
        let first = views.first()?;
        let n = views.len() as f64;
        let average = views.iter().map(|v| v.score).sum::<f64>() / n;
        let min = views.iter().map(|v| v.score).fold(f64::INFINITY, f64::min);
        let max = views.iter().map(|v| v.score).fold(f64::NEG_INFINITY, f64::max);
        let variance = views.iter().map(|v| (v.score - average).powi(2)).sum::<f64>() / n;
        let spread = max - min;
        let authoritative = views
            .iter()
            .filter(|v| v.is_authoritative)
            .max_by_key(|v| v.updated_at_ms)
            .cloned();
        let consensus_score = authoritative.as_ref().map_or(average, |v| v.score);
        Some(Self {
            user_id: first.user_id.clone(),
            node_count: views.len(),
            average,
            min,
            max,
            stddev: variance.sqrt(),
            spread,
            authoritative,
            consensus_score,
            confidence: (1.0 - spread / 100.0).clamp(0.0, 1.0),
            conflict: spread > conflict_spread,
        })
    }
}

/// Durable table of node views.
pub struct ViewStore {
    kv: Arc<dyn KvStore>,
}

impl ViewStore {
    /// Create a table over `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// One view.
    pub fn get(&self, user_id: &str, node_id: &str) -> Result<Option<NodeReputationView>> {
        Ok(kvstore::get_record(self.kv.as_ref(), &view_key(user_id, node_id))?)
    }

    /// Refresh a node's score for a user, keeping its authoritative flag.
    ///
    /// Older updates than the stored one are ignored.
    pub fn record(&self, user_id: &str, node_id: &str, score: f64, tier: Tier, now_ms: u64) -> Result<()> {
        let existing = self.get(user_id, node_id)?;
        if existing.as_ref().map_or(false, |v| v.updated_at_ms > now_ms) {
            return Ok(());
        }
        let view = NodeReputationView {
            user_id: user_id.to_string(),
            node_id: node_id.to_string(),
            score,
            tier,
            is_authoritative: existing.map_or(false, |v| v.is_authoritative),
            updated_at_ms: now_ms,
        };
        kvstore::put_record(self.kv.as_ref(), view_key(user_id, node_id), &view)?;
        Ok(())
    }

    /// Every node's view of a user, ordered by node id.
    pub fn views_for(&self, user_id: &str) -> Result<Vec<NodeReputationView>> {
        Ok(kvstore::scan_records(self.kv.as_ref(), &user_prefix(user_id))?)
    }

    /// Users with at least one view.
    pub fn users(&self) -> Result<Vec<UserId>> {
        let views: Vec<NodeReputationView> = kvstore::scan_records(self.kv.as_ref(), VIEW_PREFIX)?;
        let users: BTreeSet<UserId> = views.into_iter().map(|v| v.user_id).collect();
        Ok(users.into_iter().collect())
    }

    /// Consensus for one user.
    pub fn consensus(&self, user_id: &str, conflict_spread: f64) -> Result<Option<Consensus>> {
        Ok(Consensus::compute(&self.views_for(user_id)?, conflict_spread))
    }

    /// Make `node_id` the only authoritative view of `user_id`.
    ///
    /// Returns false when that node has no view of the user.
    pub fn set_authoritative(&self, user_id: &str, node_id: &str) -> Result<bool> {
        let views = self.views_for(user_id)?;
        if !views.iter().any(|v| v.node_id == node_id) {
            return Ok(false);
        }
        let mut ops = Vec::new();
        for mut view in views {
            let flag = view.node_id == node_id;
            if view.is_authoritative != flag {
                view.is_authoritative = flag;
                ops.push(BatchOp::put_record(view_key(user_id, &view.node_id), &view)?);
            }
        }
        if !ops.is_empty() {
            self.kv.write_batch(ops)?;
        }
        Ok(true)
    }

    /// Set every view of a user to `score`, leaving at most one authoritative
    /// row: `authority` if given, else none.
    pub fn collapse(&self, user_id: &str, score: f64, tier: Tier, authority: Option<&str>, now_ms: u64) -> Result<()> {
        let mut ops = Vec::new();
        for mut view in self.views_for(user_id)? {
            view.score = score;
            view.tier = tier;
            view.is_authoritative = authority == Some(view.node_id.as_str());
            view.updated_at_ms = view.updated_at_ms.max(now_ms);
            ops.push(BatchOp::put_record(view_key(user_id, &view.node_id), &view)?);
        }
        if !ops.is_empty() {
            self.kv.write_batch(ops)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_reputation::MemoryKvStore;

    fn store() -> ViewStore {
        ViewStore::new(Arc::new(MemoryKvStore::new()))
    }

    mod consensus {
        use super::*;

        #[test]
        fn test_statistics() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            s.record("u", "b", 60.0, Tier::Neutral, 1).unwrap();
            let c = s.consensus("u", 25.0).unwrap().unwrap();
            assert_eq!(c.node_count, 2);
            assert!((c.average - 50.0).abs() < 1e-9);
            assert!((c.stddev - 10.0).abs() < 1e-9);
            assert!((c.spread - 20.0).abs() < 1e-9);
            assert!((c.confidence - 0.8).abs() < 1e-9);
            assert!(!c.conflict);
            assert!(c.authoritative.is_none());
            assert!((c.consensus_score - 50.0).abs() < 1e-9);
        }

        #[test]
        fn test_conflict_above_spread() {
            let s = store();
            s.record("u", "a", 10.0, Tier::Restricted, 1).unwrap();
            s.record("u", "b", 80.0, Tier::Good, 1).unwrap();
            assert!(s.consensus("u", 25.0).unwrap().unwrap().conflict);
        }

        #[test]
        fn test_authoritative_is_ground_truth() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            s.record("u", "b", 70.0, Tier::Neutral, 1).unwrap();
            assert!(s.set_authoritative("u", "b").unwrap());
            let c = s.consensus("u", 25.0).unwrap().unwrap();
            assert_eq!(c.authoritative.unwrap().node_id, "b");
            assert!((c.consensus_score - 70.0).abs() < 1e-9);
        }

        #[test]
        fn test_no_views() {
            assert!(store().consensus("nobody", 25.0).unwrap().is_none());
        }
    }

    mod authority {
        use super::*;

        #[test]
        fn test_set_authoritative_clears_others() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            s.record("u", "b", 70.0, Tier::Neutral, 1).unwrap();
            s.set_authoritative("u", "a").unwrap();
            s.set_authoritative("u", "b").unwrap();
            let flags: Vec<bool> = s.views_for("u").unwrap().iter().map(|v| v.is_authoritative).collect();
            assert_eq!(flags, vec![false, true]);
        }

        #[test]
        fn test_set_authoritative_unknown_node() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            assert!(!s.set_authoritative("u", "zzz").unwrap());
        }

        #[test]
        fn test_record_keeps_flag() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            s.set_authoritative("u", "a").unwrap();
            s.record("u", "a", 45.0, Tier::Caution, 2).unwrap();
            assert!(s.get("u", "a").unwrap().unwrap().is_authoritative);
        }

        #[test]
        fn test_stale_record_ignored() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 10).unwrap();
            s.record("u", "a", 90.0, Tier::Excellent, 5).unwrap();
            assert!((s.get("u", "a").unwrap().unwrap().score - 40.0).abs() < 1e-9);
        }

        #[test]
        fn test_collapse() {
            let s = store();
            s.record("u", "a", 40.0, Tier::Caution, 1).unwrap();
            s.record("u", "b", 70.0, Tier::Neutral, 1).unwrap();
            s.collapse("u", 55.0, Tier::Neutral, Some("a"), 5).unwrap();
            let c = s.consensus("u", 25.0).unwrap().unwrap();
            assert!((c.spread).abs() < 1e-9);
            assert_eq!(c.authoritative.unwrap().node_id, "a");
            assert_eq!(s.users().unwrap(), vec!["u".to_string()]);
        }
    }
}

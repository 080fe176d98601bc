//! Per-peer sync state machine.
//!
//! One [`SyncState`] row exists per (local node, remote node) pair and is
//! written only by that pair's sync worker.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tollgate_reputation::kvstore::{self, KvStore};
use tollgate_reputation::NodeId;
use tracing::{info, warn};

use crate::error::Result;

const SYNC_PREFIX: &[u8] = b"repl/sync/";

fn sync_key(remote: &str) -> Vec<u8> {
    [SYNC_PREFIX, remote.as_bytes()].concat()
}

/// Health of the link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Last cycle succeeded.
    Healthy,
    /// At least one consecutive error, below the failure threshold.
    Degraded,
    /// Consecutive errors reached the failure threshold.
    Failed,
}

impl SyncStatus {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Healthy => "healthy",
            SyncStatus::Degraded => "degraded",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync bookkeeping for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// This node.
    pub local_node_id: NodeId,
    /// The peer.
    pub remote_node_id: NodeId,
    /// End of the last successful cycle.
    pub last_sync_time_ms: Option<u64>,
    /// Highest local event id the peer has acknowledged.
    pub last_pushed_id: u64,
    /// Highest peer event id pulled from it.
    pub last_pulled_id: u64,
    /// Replicable local events the peer has not acknowledged.
    pub pending_events: u64,
    /// Consecutive failed cycles.
    pub sync_errors: u32,
    /// Failed cycles over the lifetime of the link.
    pub total_errors: u64,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Current status.
    pub status: SyncStatus,
    /// Configured interval between cycles.
    pub sync_frequency_ms: u64,
}

impl SyncState {
    /// Fresh, healthy state for a newly registered peer.
    pub fn new(local: impl Into<NodeId>, remote: impl Into<NodeId>, sync_frequency_ms: u64) -> Self {
        Self {
            local_node_id: local.into(),
            remote_node_id: remote.into(),
            last_sync_time_ms: None,
            last_pushed_id: 0,
            last_pulled_id: 0,
            pending_events: 0,
            sync_errors: 0,
            total_errors: 0,
            last_error: None,
            status: SyncStatus::Healthy,
            sync_frequency_ms,
        }
    }

    /// Record a successful cycle. Any status returns to healthy.
    pub fn record_success(&mut self, now_ms: u64, pending_events: u64) {
        if self.status != SyncStatus::Healthy {
            info!(peer = %self.remote_node_id, was = %self.status, "peer sync recovered");
        }
        self.last_sync_time_ms = Some(now_ms);
        self.pending_events = pending_events;
        self.sync_errors = 0;
        self.last_error = None;
        self.status = SyncStatus::Healthy;
    }

    /// Record a failed cycle.
    ///
    /// The first error degrades the link; reaching `failure_threshold`
    /// consecutive errors fails it.
    pub fn record_failure(&mut self, error: &str, pending_events: u64, failure_threshold: u32) {
        self.sync_errors = self.sync_errors.saturating_add(1);
        self.total_errors += 1;
        self.pending_events = pending_events;
        self.last_error = Some(error.to_string());
        let next = if self.sync_errors >= failure_threshold.max(1) {
            SyncStatus::Failed
        } else {
            SyncStatus::Degraded
        };
        if next != self.status {
            warn!(
                peer = %self.remote_node_id,
                from = %self.status,
                to = %next,
                errors = self.sync_errors,
                "peer sync status changed"
            );
        }
        self.status = next;
    }
}

/// Durable table of [`SyncState`] rows.
pub struct SyncStateStore {
    kv: Arc<dyn KvStore>,
}

impl SyncStateStore {
    /// Create a table over `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Load the row for `remote`.
    pub fn load(&self, remote: &str) -> Result<Option<SyncState>> {
        Ok(kvstore::get_record(self.kv.as_ref(), &sync_key(remote))?)
    }

    /// Persist a row.
    pub fn save(&self, state: &SyncState) -> Result<()> {
        kvstore::put_record(self.kv.as_ref(), sync_key(&state.remote_node_id), state)?;
        Ok(())
    }

    /// Delete the row for `remote`.
    pub fn remove(&self, remote: &str) -> Result<()> {
        self.kv.delete(&sync_key(remote))?;
        Ok(())
    }

    /// Every row, ordered by peer id.
    pub fn all(&self) -> Result<Vec<SyncState>> {
        Ok(kvstore::scan_records(self.kv.as_ref(), SYNC_PREFIX)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_reputation::MemoryKvStore;

    #[test]
    fn test_first_error_degrades() {
        let mut s = SyncState::new("a", "b", 1000);
        s.record_failure("connection refused", 4, 3);
        assert_eq!(s.status, SyncStatus::Degraded);
        assert_eq!(s.sync_errors, 1);
        assert_eq!(s.pending_events, 4);
    }

    #[test]
    fn test_threshold_fails() {
        let mut s = SyncState::new("a", "b", 1000);
        for _ in 0..3 {
            s.record_failure("timeout", 0, 3);
        }
        assert_eq!(s.status, SyncStatus::Failed);
        s.record_failure("timeout", 0, 3);
        assert_eq!(s.status, SyncStatus::Failed);
        assert_eq!(s.total_errors, 4);
    }

    #[test]
    fn test_success_restores_healthy() {
        let mut s = SyncState::new("a", "b", 1000);
        for _ in 0..5 {
            s.record_failure("timeout", 7, 3);
        }
        s.record_success(99, 0);
        assert_eq!(s.status, SyncStatus::Healthy);
        assert_eq!(s.sync_errors, 0);
        assert_eq!(s.total_errors, 5);
        assert_eq!(s.last_sync_time_ms, Some(99));
        assert!(s.last_error.is_none());
    }

    #[test]
    fn test_store_roundtrip_and_list() {
        let store = SyncStateStore::new(Arc::new(MemoryKvStore::new()));
        let mut s = SyncState::new("a", "c", 1000);
        s.last_pushed_id = 12;
        store.save(&s).unwrap();
        store.save(&SyncState::new("a", "b", 1000)).unwrap();
        assert_eq!(store.load("c").unwrap().unwrap().last_pushed_id, 12);
        let all = store.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].remote_node_id, "b");
        store.remove("c").unwrap();
        assert!(store.load("c").unwrap().is_none());
    }
}

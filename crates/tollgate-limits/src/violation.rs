//! Record of denied requests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::rule::Scope;

/// One denied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Sequence number.
    pub id: u64,
    /// System the request belonged to.
    pub system: String,
    /// Rule that denied it; 0 for the fallback rule, `None` for quota-only or no-rule denials.
    pub rule_id: Option<u64>,
    /// Scope of the counted subject.
    pub scope: Scope,
    /// Counted subject.
    pub scope_value: String,
    /// Resource type.
    pub resource_type: Option<String>,
    /// Limit in effect.
    pub limit: u64,
    /// Count observed when denied.
    pub actual_count: u64,
    /// Denial label (`rate_limited`, `quota_exceeded`, ...).
    pub kind: String,
    /// 1 (minor) to 3 (severe).
    pub severity: u8,
    /// When it happened.
    pub timestamp_ms: u64,
}

/// Aggregate view of the violation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationStats {
    /// All violations in the log.
    pub total: u64,
    /// Count per scope.
    pub by_scope: BTreeMap<Scope, u64>,
    /// Count per denial kind.
    pub by_kind: BTreeMap<String, u64>,
}

/// Append-only in-memory violation log with retention.
#[derive(Default)]
pub struct ViolationLog {
    entries: RwLock<VecDeque<Violation>>,
    next_id: AtomicU64,
}

impl ViolationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a violation, assigning its id.
    pub fn record(&self, mut violation: Violation) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        violation.id = id;
        self.entries.write().push_back(violation);
        id
    }

    /// Violations of `system` (all systems when `None`) since `since_ms`, newest first.
    pub fn query(&self, system: Option<&str>, since_ms: u64, limit: usize) -> Vec<Violation> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|v| v.timestamp_ms >= since_ms)
            .filter(|v| system.map_or(true, |s| v.system == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Violations of one subject since `since_ms`.
    pub fn count_for(&self, scope_value: &str, since_ms: u64) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|v| v.scope_value == scope_value && v.timestamp_ms >= since_ms)
            .count()
    }

    /// Totals for `system` (all systems when `None`).
    pub fn stats(&self, system: Option<&str>) -> ViolationStats {
        let mut stats = ViolationStats::default();
        for v in self
            .entries
            .read()
            .iter()
            .filter(|v| system.map_or(true, |s| v.system == s))
        {
            stats.total += 1;
            *stats.by_scope.entry(v.scope).or_default() += 1;
            *stats.by_kind.entry(v.kind.clone()).or_default() += 1;
        }
        stats
    }

    /// Drop violations older than `cutoff_ms`.
    pub fn purge_before(&self, cutoff_ms: u64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|v| v.timestamp_ms >= cutoff_ms);
        before - entries.len()
    }

    /// Number of stored violations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

//! Fixed-window request counters with atomic check-and-increment.
//!
//! Each (rule, scope value, resource, window start) key owns one cell in a
//! sharded map. The shard lock held by a map entry serializes every
//! read-compare-increment on that key, so concurrent callers can never push a
//! window past its limit.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identifies one window of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Rule the counter belongs to.
    pub rule_id: u64,
    /// Scope value being counted.
    pub scope_value: String,
    /// Resource type, empty when the request carried none.
    pub resource_type: String,
    /// Window start in ms since epoch.
    pub window_start_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct BucketCell {
    count: u64,
    denied: u64,
    window_end_ms: u64,
}

/// One counter check.
#[derive(Debug, Clone, Copy)]
pub struct BucketRequest<'a> {
    /// Matched rule.
    pub rule_id: u64,
    /// Scope value.
    pub scope_value: &'a str,
    /// Resource type.
    pub resource_type: &'a str,
    /// Window length.
    pub window_ms: u64,
    /// Effective limit for this call, at least 1.
    pub limit: u64,
}

/// Result of a check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the request was counted.
    pub allowed: bool,
    /// Admitted requests in the current window after this call.
    pub count: u64,
    /// Requests still admissible in this window.
    pub remaining: u64,
    /// End of the current window.
    pub reset_at_ms: u64,
}

/// Result of a check whose increment also depends on a caller-supplied commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed<T, E> {
    /// The window was full; the commit did not run.
    Full(BucketOutcome),
    /// The commit succeeded and the request was counted.
    Counted(BucketOutcome, T),
    /// The commit refused; the request was not counted.
    Refused(BucketOutcome, E),
}

impl<T, E> Committed<T, E> {
    /// The bucket side of the result.
    pub fn outcome(&self) -> BucketOutcome {
        match self {
            Committed::Full(o) | Committed::Counted(o, _) | Committed::Refused(o, _) => *o,
        }
    }
}

/// Live counter as reported by usage queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Key of the counter.
    pub key: BucketKey,
    /// Admitted requests.
    pub count: u64,
    /// Denied attempts.
    pub denied: u64,
    /// Window end.
    pub window_end_ms: u64,
}

/// The shard lock could not be taken before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketBusy {
    /// How long the caller waited.
    pub waited: Duration,
}

/// Bucket store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Extra lifetime of a bucket past its window end before the sweep reclaims it.
    pub grace_ms: u64,
    /// Blend the trailing part of the previous window into the count.
    pub sliding_blend: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            grace_ms: 60_000,
            sliding_blend: false,
        }
    }
}

/// Sharded map of windowed counters.
pub struct BucketStore {
    config: BucketConfig,
    cells: DashMap<BucketKey, BucketCell>,
}

impl BucketStore {
    /// Create an empty store.
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    /// Store configuration.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if no cells exist.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn key_for(req: &BucketRequest<'_>, window_start_ms: u64) -> BucketKey {
        BucketKey {
            rule_id: req.rule_id,
            scope_value: req.scope_value.to_string(),
            resource_type: req.resource_type.to_string(),
            window_start_ms,
        }
    }

    /// Weighted count carried over from the previous window.
    fn carried_over(&self, req: &BucketRequest<'_>, window_start_ms: u64, now_ms: u64) -> f64 {
        if !self.config.sliding_blend || window_start_ms < req.window_ms {
            return 0.0;
        }
        let prev_key = Self::key_for(req, window_start_ms - req.window_ms);
        let prev = self.cells.get(&prev_key).map(|c| c.count).unwrap_or(0);
        let elapsed = now_ms - window_start_ms;
        let weight = (req.window_ms - elapsed) as f64 / req.window_ms as f64;
        prev as f64 * weight
    }

    /// Atomically compare the window's count to `limit` and count the request if it fits.
    pub fn check_and_increment(&self, req: BucketRequest<'_>, now_ms: u64) -> BucketOutcome {
        let window_ms = req.window_ms.max(1);
        let window_start_ms = now_ms - now_ms % window_ms;
        let reset_at_ms = window_start_ms + window_ms;
        let limit = req.limit.max(1);
        let carried = self.carried_over(&req, window_start_ms, now_ms);

        let mut cell = self.cells.entry(Self::key_for(&req, window_start_ms)).or_insert(BucketCell {
            count: 0,
            denied: 0,
            window_end_ms: reset_at_ms,
        });
        Self::apply(&mut cell, limit, carried, reset_at_ms, || Ok::<(), Infallible>(())).outcome()
    }

    /// Like [`check_and_increment`](Self::check_and_increment) but gives up once
    /// `deadline` passes while the key's shard is held by someone else.
    pub fn try_check_and_increment(
        &self,
        req: BucketRequest<'_>,
        now_ms: u64,
        deadline: Instant,
    ) -> Result<BucketOutcome, BucketBusy> {
        self.try_check_and_commit(req, now_ms, deadline, || Ok::<(), Infallible>(()))
            .map(|c| c.outcome())
    }

    /// Check the window and, if the request fits, run `commit` while the key
    /// is still held. The request is counted only if `commit` succeeds.
    ///
    /// `commit` must not touch this store.
    pub fn try_check_and_commit<T, E, F>(
        &self,
        req: BucketRequest<'_>,
        now_ms: u64,
        deadline: Instant,
        commit: F,
    ) -> Result<Committed<T, E>, BucketBusy>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let started = Instant::now();
        let window_ms = req.window_ms.max(1);
        let window_start_ms = now_ms - now_ms % window_ms;
        let reset_at_ms = window_start_ms + window_ms;
        let limit = req.limit.max(1);
        let carried = self.carried_over(&req, window_start_ms, now_ms);
        let key = Self::key_for(&req, window_start_ms);

        loop {
            if let Some(entry) = self.cells.try_entry(key.clone()) {
                let mut cell = entry.or_insert(BucketCell {
                    count: 0,
                    denied: 0,
                    window_end_ms: reset_at_ms,
                });
                return Ok(Self::apply(&mut cell, limit, carried, reset_at_ms, commit));
            }
            if Instant::now() >= deadline {
                return Err(BucketBusy {
                    waited: started.elapsed(),
                });
            }
            std::thread::yield_now();
        }
    }

    fn apply<T, E>(
        cell: &mut BucketCell,
        limit: u64,
        carried: f64,
        reset_at_ms: u64,
        commit: impl FnOnce() -> Result<T, E>,
    ) -> Committed<T, E> {
        let estimated = carried + cell.count as f64;
        let fits = cell.count < limit && estimated + 1.0 <= limit as f64;
        if !fits {
            cell.denied += 1;
            debug!(count = cell.count, limit, "bucket full");
            return Committed::Full(Self::outcome(cell, false, limit, carried, reset_at_ms));
        }
        match commit() {
            Ok(value) => {
                cell.count += 1;
                Committed::Counted(Self::outcome(cell, true, limit, carried, reset_at_ms), value)
            }
            Err(e) => Committed::Refused(Self::outcome(cell, false, limit, carried, reset_at_ms), e),
        }
    }

    fn outcome(cell: &BucketCell, allowed: bool, limit: u64, carried: f64, reset_at_ms: u64) -> BucketOutcome {
        let used = (carried + cell.count as f64).ceil() as u64;
        BucketOutcome {
            allowed,
            count: cell.count,
            remaining: limit.saturating_sub(used),
            reset_at_ms,
        }
    }

    /// Current count of a window without touching it.
    pub fn peek(&self, key: &BucketKey) -> Option<BucketSnapshot> {
        self.cells.get(key).map(|c| BucketSnapshot {
            key: key.clone(),
            count: c.count,
            denied: c.denied,
            window_end_ms: c.window_end_ms,
        })
    }

    /// Live windows for one scope value, optionally restricted to a set of rules.
    pub fn snapshots_for(&self, scope_value: &str, rule_ids: Option<&[u64]>, now_ms: u64) -> Vec<BucketSnapshot> {
        let mut out: Vec<BucketSnapshot> = self
            .cells
            .iter()
            .filter(|e| e.key().scope_value == scope_value)
            .filter(|e| rule_ids.map_or(true, |ids| ids.contains(&e.key().rule_id)))
            .filter(|e| e.value().window_end_ms > now_ms)
            .map(|e| BucketSnapshot {
                key: e.key().clone(),
                count: e.value().count,
                denied: e.value().denied,
                window_end_ms: e.value().window_end_ms,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Reclaim buckets whose window ended more than the grace period ago.
    ///
    /// Removal takes the same shard lock as increments, so a bucket is never
    /// dropped while a caller is counting into it.
    pub fn sweep(&self, now_ms: u64) -> usize {
        self.purge_ended_before(now_ms.saturating_sub(self.config.grace_ms))
    }

    /// Reclaim every bucket whose window ended before `cutoff_ms`.
    pub fn purge_ended_before(&self, cutoff_ms: u64) -> usize {
        let before = self.cells.len();
        self.cells.retain(|_, cell| cell.window_end_ms > cutoff_ms);
        let removed = before.saturating_sub(self.cells.len());
        if removed > 0 {
            debug!(removed, "expired buckets reclaimed");
        }
        removed
    }
}

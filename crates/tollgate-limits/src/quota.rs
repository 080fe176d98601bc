//! Longer-horizon quotas with calendar-aligned periods.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Denial, LimitsError, Result};
use crate::rule::{Scope, GLOBAL_SYSTEM};

const CONSUME_STRIPES: usize = 64;

/// Length of a quota period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// UTC calendar day.
    Daily,
    /// ISO week starting Monday 00:00 UTC.
    Weekly,
    /// UTC calendar month.
    Monthly,
}

impl QuotaPeriod {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Weekly => "weekly",
            QuotaPeriod::Monthly => "monthly",
        }
    }

    /// `[start, end)` of the period containing `now_ms`, in ms.
    pub fn bounds(&self, now_ms: u64) -> (u64, u64) {
        let now = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();
        let today = now.date_naive();
        let (start, end) = match self {
            QuotaPeriod::Daily => (today, today + ChronoDuration::days(1)),
            QuotaPeriod::Weekly => {
                let monday = today - ChronoDuration::days(i64::from(today.weekday().num_days_from_monday()));
                (monday, monday + ChronoDuration::days(7))
            }
            QuotaPeriod::Monthly => {
                let first = today.with_day(1).unwrap_or(today);
                let next = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
                }
                .unwrap_or(first + ChronoDuration::days(31));
                (first, next)
            }
        };
        (midnight_ms(start), midnight_ms(end))
    }
}

fn midnight_ms(date: NaiveDate) -> u64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis().max(0) as u64)
        .unwrap_or(0)
}

impl std::fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDefinition {
    /// Assigned on creation.
    #[serde(default)]
    pub id: u64,
    /// Owning system, or `global`.
    pub system: String,
    /// Scope the quota applies to.
    pub scope: Scope,
    /// Specific value; `None` applies to every value of the scope.
    #[serde(default)]
    pub scope_value: Option<String>,
    /// Resource filter; `None` matches any resource.
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Period length.
    pub period: QuotaPeriod,
    /// Units per period.
    pub limit: u64,
}

impl QuotaDefinition {
    fn matches(&self, system: &str, scope: Scope, value: &str, resource_type: Option<&str>) -> bool {
        (self.system == system || self.system == GLOBAL_SYSTEM)
            && self.scope == scope
            && self.scope_value.as_deref().map_or(true, |v| v == value)
            && self
                .resource_type
                .as_deref()
                .map_or(true, |r| Some(r) == resource_type)
    }

    fn specificity(&self) -> u8 {
        u8::from(self.scope_value.is_some()) * 2 + u8::from(self.resource_type.is_some())
    }
}

/// Usage row key: one per subject per period instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    /// Definition the row counts against.
    pub quota_id: u64,
    /// Scope value being counted.
    pub scope_value: String,
    /// Resource filter of the definition, empty when it counts every resource.
    pub resource_type: String,
    /// Start of the period instance.
    pub period_start_ms: u64,
}

/// Usage of one quota in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Definition id.
    pub quota_id: u64,
    /// Scope.
    pub scope: Scope,
    /// Scope value.
    pub scope_value: String,
    /// Resource type.
    pub resource_type: String,
    /// Period.
    pub period: QuotaPeriod,
    /// Period start.
    pub period_start_ms: u64,
    /// Period end (exclusive).
    pub period_end_ms: u64,
    /// Units used.
    pub used: u64,
    /// Units allowed.
    pub limit: u64,
}

impl QuotaUsage {
    /// Units left in this period.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    fn exceeded(&self) -> Denial {
        Denial::QuotaExceeded {
            period: self.period,
            used: self.used,
            limit: self.limit,
            resets_at_ms: self.period_end_ms,
        }
    }
}

/// Quota definitions plus per-period usage rows.
///
/// Every write to a subject's rows goes through that subject's stripe, so a
/// multi-quota consume checks all rows before touching any of them.
pub struct QuotaTracker {
    definitions: RwLock<Vec<QuotaDefinition>>,
    next_id: AtomicU64,
    usage: DashMap<QuotaKey, QuotaUsage>,
    stripes: Vec<Mutex<()>>,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            usage: DashMap::new(),
            stripes: (0..CONSUME_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, value: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Add a quota definition.
    pub fn define(&self, mut def: QuotaDefinition) -> Result<QuotaDefinition> {
        if def.limit == 0 {
            return Err(LimitsError::InvalidQuota {
                msg: "limit must be positive".to_string(),
            });
        }
        if def.system.trim().is_empty() {
            return Err(LimitsError::InvalidQuota {
                msg: "system must not be empty".to_string(),
            });
        }
        def.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(quota_id = def.id, system = %def.system, scope = %def.scope, period = %def.period, limit = def.limit, "quota defined");
        self.definitions.write().push(def.clone());
        Ok(def)
    }

    /// Remove a definition. Its usage rows stay until purged.
    pub fn remove(&self, quota_id: u64) -> bool {
        let mut defs = self.definitions.write();
        let before = defs.len();
        defs.retain(|d| d.id != quota_id);
        defs.len() != before
    }

    /// All definitions.
    pub fn definitions(&self) -> Vec<QuotaDefinition> {
        self.definitions.read().clone()
    }

    /// The most specific definition per period that applies to a subject.
    pub fn matching(
        &self,
        system: &str,
        scope: Scope,
        value: &str,
        resource_type: Option<&str>,
    ) -> Vec<QuotaDefinition> {
        let defs = self.definitions.read();
        let mut best: Vec<QuotaDefinition> = Vec::new();
        for def in defs.iter().filter(|d| d.matches(system, scope, value, resource_type)) {
            match best.iter_mut().find(|b| b.period == def.period) {
                Some(b) if def.specificity() > b.specificity() => *b = def.clone(),
                Some(_) => {}
                None => best.push(def.clone()),
            }
        }
        best.sort_by_key(|d| d.period);
        best
    }

    fn key(def: &QuotaDefinition, value: &str, now_ms: u64) -> (QuotaKey, u64) {
        let (start, end) = def.period.bounds(now_ms);
        (
            QuotaKey {
                quota_id: def.id,
                scope_value: value.to_string(),
                resource_type: def.resource_type.clone().unwrap_or_default(),
                period_start_ms: start,
            },
            end,
        )
    }

    fn fresh_row(def: &QuotaDefinition, key: &QuotaKey, end_ms: u64) -> QuotaUsage {
        QuotaUsage {
            quota_id: def.id,
            scope: def.scope,
            scope_value: key.scope_value.clone(),
            resource_type: key.resource_type.clone(),
            period: def.period,
            period_start_ms: key.period_start_ms,
            period_end_ms: end_ms,
            used: 0,
            limit: def.limit,
        }
    }

    /// Current-period usage of one definition (zero when nothing was used yet).
    pub fn usage(&self, def: &QuotaDefinition, value: &str, now_ms: u64) -> QuotaUsage {
        let (key, end) = Self::key(def, value, now_ms);
        self.usage
            .get(&key)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Self::fresh_row(def, &key, end))
    }

    /// Deny if any applicable quota is already exhausted.
    pub fn precheck(&self, defs: &[QuotaDefinition], value: &str, now_ms: u64) -> std::result::Result<(), Denial> {
        for def in defs {
            let row = self.usage(def, value, now_ms);
            if row.used >= row.limit {
                return Err(row.exceeded());
            }
        }
        Ok(())
    }

    /// Add `amount` to every definition, all or nothing.
    ///
    /// Every row is checked for `used + amount <= limit` before any row is
    /// incremented, so a refused consume leaves no trace, even transiently.
    pub fn consume(
        &self,
        defs: &[QuotaDefinition],
        value: &str,
        amount: u64,
        now_ms: u64,
    ) -> std::result::Result<Vec<QuotaUsage>, Denial> {
        let _guard = self.stripe(value).lock();
        let keys: Vec<(QuotaKey, u64)> = defs.iter().map(|def| Self::key(def, value, now_ms)).collect();

        for (def, (key, end)) in defs.iter().zip(&keys) {
            let row = self
                .usage
                .get(key)
                .map(|r| r.value().clone())
                .unwrap_or_else(|| Self::fresh_row(def, key, *end));
            if row.used.saturating_add(amount) > row.limit {
                let denial = row.exceeded();
                debug!(value, kind = denial.kind(), "quota refused");
                return Err(denial);
            }
        }

        let mut rows = Vec::with_capacity(defs.len());
        for (def, (key, end)) in defs.iter().zip(keys) {
            let mut row = self
                .usage
                .entry(key.clone())
                .or_insert_with(|| Self::fresh_row(def, &key, end));
            row.used += amount;
            rows.push(row.value().clone());
        }
        Ok(rows)
    }

    /// Every stored usage row, including past periods kept for audit.
    pub fn rows(&self) -> Vec<QuotaUsage> {
        let mut rows: Vec<QuotaUsage> = self.usage.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| {
            a.quota_id
                .cmp(&b.quota_id)
                .then(a.scope_value.cmp(&b.scope_value))
                .then(a.period_start_ms.cmp(&b.period_start_ms))
        });
        rows
    }

    /// Drop usage rows whose period ended before `cutoff_ms`.
    pub fn purge_before(&self, cutoff_ms: u64) -> usize {
        let before = self.usage.len();
        self.usage.retain(|_, row| row.period_end_ms >= cutoff_ms);
        before.saturating_sub(self.usage.len())
    }
}

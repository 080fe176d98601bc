//! Rate-limit rules, their CRUD surface, and resolution.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tollgate_reputation::clock::{DAY_MS, HOUR_MS, MINUTE_MS, SECOND_MS};
use tracing::info;

use crate::error::{LimitsError, Result};

/// System name whose rules apply to every system.
pub const GLOBAL_SYSTEM: &str = "global";

/// Dimension a rule or quota applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Everyone.
    Global,
    /// Client address.
    Ip,
    /// Session token.
    Session,
    /// Authenticated user.
    User,
    /// API key.
    ApiKey,
}

impl Scope {
    /// Candidate scopes from most to least specific.
    pub const BY_SPECIFICITY: [Scope; 5] = [Scope::ApiKey, Scope::User, Scope::Session, Scope::Ip, Scope::Global];

    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        match self {
            Scope::ApiKey => 4,
            Scope::User => 3,
            Scope::Session => 2,
            Scope::Ip => 1,
            Scope::Global => 0,
        }
    }

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::Session => "session",
            Scope::User => "user",
            Scope::ApiKey => "api_key",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window length of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// One-second windows.
    PerSecond,
    /// One-minute windows.
    PerMinute,
    /// One-hour windows.
    PerHour,
    /// One-day windows.
    PerDay,
}

impl LimitType {
    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        match self {
            LimitType::PerSecond => SECOND_MS,
            LimitType::PerMinute => MINUTE_MS,
            LimitType::PerHour => HOUR_MS,
            LimitType::PerDay => DAY_MS,
        }
    }

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::PerSecond => "per_second",
            LimitType::PerMinute => "per_minute",
            LimitType::PerHour => "per_hour",
            LimitType::PerDay => "per_day",
        }
    }
}

/// What to do when no rule matches or the bucket store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request.
    Open,
    /// Deny the request.
    #[default]
    Closed,
}

/// Operator-supplied rule fields, used for create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Owning system, or [`GLOBAL_SYSTEM`].
    pub system: String,
    /// Display name; generated when empty.
    #[serde(default)]
    pub name: String,
    /// Scope the rule applies to.
    pub scope: Scope,
    /// Specific scope value; `None` is the scope default.
    #[serde(default)]
    pub scope_value: Option<String>,
    /// Resource filter; `None` matches any resource.
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Window length.
    pub limit_type: LimitType,
    /// Requests allowed per window before multipliers.
    pub limit_value: u64,
    /// Lower is evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules never match.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl RuleSpec {
    /// A minimal enabled spec.
    pub fn new(system: impl Into<String>, scope: Scope, limit_type: LimitType, limit_value: u64) -> Self {
        Self {
            system: system.into(),
            name: String::new(),
            scope,
            scope_value: None,
            resource_type: None,
            limit_type,
            limit_value,
            priority: 0,
            enabled: true,
        }
    }

    /// Restrict to one scope value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.scope_value = Some(value.into());
        self
    }

    /// Restrict to one resource type.
    pub fn with_resource(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.system.trim().is_empty() {
            return Err(LimitsError::InvalidRule {
                msg: "system must not be empty".to_string(),
            });
        }
        if self.limit_value == 0 {
            return Err(LimitsError::InvalidRule {
                msg: "limit must be positive".to_string(),
            });
        }
        if self.scope == Scope::Global && self.scope_value.is_some() {
            return Err(LimitsError::InvalidRule {
                msg: "global rules cannot carry a scope value".to_string(),
            });
        }
        Ok(())
    }
}

/// A stored rate-limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id; 0 is reserved for the fallback rule.
    pub id: u64,
    /// Owning system.
    pub system: String,
    /// Display name.
    pub name: String,
    /// Scope.
    pub scope: Scope,
    /// Specific scope value, or `None` for the scope default.
    pub scope_value: Option<String>,
    /// Resource filter.
    pub resource_type: Option<String>,
    /// Window length.
    pub limit_type: LimitType,
    /// Base limit per window.
    pub limit_value: u64,
    /// Lower is evaluated first.
    pub priority: i32,
    /// Disabled rules never match.
    pub enabled: bool,
    /// Creation time.
    pub created_at_ms: u64,
    /// Last edit time.
    pub updated_at_ms: u64,
}

impl Rule {
    fn from_spec(id: u64, name: String, spec: RuleSpec, now_ms: u64) -> Self {
        Self {
            id,
            system: spec.system,
            name,
            scope: spec.scope,
            scope_value: spec.scope_value,
            resource_type: spec.resource_type,
            limit_type: spec.limit_type,
            limit_value: spec.limit_value,
            priority: spec.priority,
            enabled: spec.enabled,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.limit_type.window_ms()
    }

    fn applies_to_system(&self, system: &str) -> bool {
        self.system == system || self.system == GLOBAL_SYSTEM
    }

    fn matches(&self, system: &str, candidate: &ScopeCandidate, resource_type: Option<&str>) -> bool {
        self.enabled
            && self.applies_to_system(system)
            && self.scope == candidate.scope
            && self
                .resource_type
                .as_deref()
                .map_or(true, |r| Some(r) == resource_type)
            && self
                .scope_value
                .as_deref()
                .map_or(true, |v| v == candidate.value)
    }
}

/// One (scope, value) pair identifying the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeCandidate {
    /// Scope.
    pub scope: Scope,
    /// Value within the scope (an IP, a user id, ...).
    pub value: String,
}

impl ScopeCandidate {
    /// Build a candidate.
    pub fn new(scope: Scope, value: impl Into<String>) -> Self {
        Self {
            scope,
            value: value.into(),
        }
    }
}

/// In-memory rule table with resolution.
pub struct RuleSet {
    rules: RwLock<BTreeMap<u64, Rule>>,
    next_id: AtomicU64,
    fallback: RwLock<Option<Rule>>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    /// Create an empty rule set with no fallback.
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            fallback: RwLock::new(None),
        }
    }

    /// Install the last-resort global rule, or remove it with `None`.
    pub fn set_fallback(&self, limit: Option<(LimitType, u64)>) {
        *self.fallback.write() = limit.map(|(limit_type, limit_value)| Rule {
            id: 0,
            system: GLOBAL_SYSTEM.to_string(),
            name: "global_default".to_string(),
            scope: Scope::Global,
            scope_value: None,
            resource_type: None,
            limit_type,
            limit_value,
            priority: i32::MAX,
            enabled: true,
            created_at_ms: 0,
            updated_at_ms: 0,
        });
    }

    /// The fallback rule, if installed.
    pub fn fallback(&self) -> Option<Rule> {
        self.fallback.read().clone()
    }

    /// Create a rule. An empty name becomes `{system}_{scope}_{limit}_{n}`.
    pub fn create(&self, spec: RuleSpec, now_ms: u64) -> Result<Rule> {
        spec.validate()?;
        let mut rules = self.rules.write();
        let name = if spec.name.trim().is_empty() {
            let n = rules.values().filter(|r| r.system == spec.system).count() + 1;
            format!("{}_{}_{}_{}", spec.system, spec.scope, spec.limit_value, n)
        } else {
            spec.name.clone()
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rule = Rule::from_spec(id, name, spec, now_ms);
        info!(rule_id = id, system = %rule.system, name = %rule.name, scope = %rule.scope, limit = rule.limit_value, "rule created");
        rules.insert(id, rule.clone());
        Ok(rule)
    }

    /// Replace a rule's fields. Takes effect on the next evaluation.
    pub fn update(&self, rule_id: u64, spec: RuleSpec, now_ms: u64) -> Result<Rule> {
        spec.validate()?;
        let mut rules = self.rules.write();
        let existing = rules.get_mut(&rule_id).ok_or(LimitsError::UnknownRule { rule_id })?;
        let name = if spec.name.trim().is_empty() {
            existing.name.clone()
        } else {
            spec.name.clone()
        };
        let mut updated = Rule::from_spec(rule_id, name, spec, now_ms);
        updated.created_at_ms = existing.created_at_ms;
        *existing = updated.clone();
        info!(rule_id, "rule updated");
        Ok(updated)
    }

    /// Delete a rule. Unknown ids are a no-op returning false.
    pub fn delete(&self, rule_id: u64) -> bool {
        let removed = self.rules.write().remove(&rule_id).is_some();
        if removed {
            info!(rule_id, "rule deleted");
        }
        removed
    }

    /// One rule by id.
    pub fn get(&self, rule_id: u64) -> Option<Rule> {
        if rule_id == 0 {
            return self.fallback();
        }
        self.rules.read().get(&rule_id).cloned()
    }

    /// Rules of `system` plus global rules, by priority then id.
    pub fn list(&self, system: &str) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.applies_to_system(system))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        rules
    }

    /// Number of stored rules (fallback excluded).
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Returns true if no rules are stored.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Find the rule that governs a request.
    ///
    /// Candidates are tried most specific scope first. Within a scope the
    /// lowest priority wins, then a rule for the exact value over the scope
    /// default, then the older rule. Falls back to the global default rule.
    pub fn resolve(
        &self,
        system: &str,
        candidates: &[ScopeCandidate],
        resource_type: Option<&str>,
    ) -> Option<(Rule, ScopeCandidate)> {
        let mut ordered: Vec<&ScopeCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| b.scope.specificity().cmp(&a.scope.specificity()));

        let rules = self.rules.read();
        for candidate in ordered {
            let best = rules
                .values()
                .filter(|r| r.matches(system, candidate, resource_type))
                .min_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(b.scope_value.is_some().cmp(&a.scope_value.is_some()))
                        .then(a.id.cmp(&b.id))
                });
            if let Some(rule) = best {
                return Some((rule.clone(), candidate.clone()));
            }
        }
        drop(rules);

        self.fallback()
            .map(|rule| (rule, ScopeCandidate::new(Scope::Global, "default")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(v: &str) -> ScopeCandidate {
        ScopeCandidate::new(Scope::Ip, v)
    }

    fn user(v: &str) -> ScopeCandidate {
        ScopeCandidate::new(Scope::User, v)
    }

    mod crud {
        use super::*;

        #[test]
        fn test_create_generates_name() {
            let set = RuleSet::new();
            let r1 = set
                .create(RuleSpec::new("billing", Scope::Ip, LimitType::PerMinute, 5), 1)
                .unwrap();
            let r2 = set
                .create(RuleSpec::new("billing", Scope::User, LimitType::PerHour, 100), 1)
                .unwrap();
            assert_eq!(r1.name, "billing_ip_5_1");
            assert_eq!(r2.name, "billing_user_100_2");
        }

        #[test]
        fn test_create_validates() {
            let set = RuleSet::new();
            assert!(set
                .create(RuleSpec::new("", Scope::Ip, LimitType::PerMinute, 5), 1)
                .is_err());
            assert!(set
                .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 0), 1)
                .is_err());
            assert!(set
                .create(RuleSpec::new("s", Scope::Global, LimitType::PerMinute, 1).with_value("x"), 1)
                .is_err());
        }

        #[test]
        fn test_update_keeps_created_at() {
            let set = RuleSet::new();
            let r = set
                .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 5), 10)
                .unwrap();
            let u = set
                .update(r.id, RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 50), 20)
                .unwrap();
            assert_eq!(u.limit_value, 50);
            assert_eq!(u.created_at_ms, 10);
            assert_eq!(u.updated_at_ms, 20);
            assert_eq!(u.name, r.name);
        }

        #[test]
        fn test_update_unknown_fails() {
            let set = RuleSet::new();
            assert!(matches!(
                set.update(9, RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 5), 1),
                Err(LimitsError::UnknownRule { rule_id: 9 })
            ));
        }

        #[test]
        fn test_delete_unknown_is_noop() {
            let set = RuleSet::new();
            assert!(!set.delete(42));
        }

        #[test]
        fn test_list_includes_global_rules() {
            let set = RuleSet::new();
            set.create(RuleSpec::new("a", Scope::Ip, LimitType::PerMinute, 5).with_priority(5), 1)
                .unwrap();
            set.create(RuleSpec::new(GLOBAL_SYSTEM, Scope::Ip, LimitType::PerMinute, 9).with_priority(1), 1)
                .unwrap();
            set.create(RuleSpec::new("b", Scope::Ip, LimitType::PerMinute, 7), 1)
                .unwrap();
            let listed = set.list("a");
            assert_eq!(listed.len(), 2);
            assert_eq!(listed[0].system, GLOBAL_SYSTEM);
        }
    }

    mod resolve {
        use super::*;

        #[test]
        fn test_most_specific_scope_wins() {
            let set = RuleSet::new();
            set.create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 5), 1)
                .unwrap();
            let u = set
                .create(RuleSpec::new("s", Scope::User, LimitType::PerMinute, 100).with_priority(50), 1)
                .unwrap();
            let (rule, cand) = set.resolve("s", &[ip("1.2.3.4"), user("u1")], None).unwrap();
            assert_eq!(rule.id, u.id);
            assert_eq!(cand.scope, Scope::User);
        }

        #[test]
        fn test_priority_then_specific_value() {
            let set = RuleSet::new();
            let default = set
                .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 5), 1)
                .unwrap();
            let exact = set
                .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 50).with_value("10.0.0.1"), 1)
                .unwrap();
            let (rule, _) = set.resolve("s", &[ip("10.0.0.1")], None).unwrap();
            assert_eq!(rule.id, exact.id);
            let (rule, _) = set.resolve("s", &[ip("10.0.0.2")], None).unwrap();
            assert_eq!(rule.id, default.id);

            let urgent = set
                .create(RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 1).with_priority(-1), 1)
                .unwrap();
            let (rule, _) = set.resolve("s", &[ip("10.0.0.1")], None).unwrap();
            assert_eq!(rule.id, urgent.id);
        }

        #[test]
        fn test_resource_filter_and_disabled() {
            let set = RuleSet::new();
            let mut spec = RuleSpec::new("s", Scope::Ip, LimitType::PerMinute, 5).with_resource("login");
            let login = set.create(spec.clone(), 1).unwrap();
            assert!(set.resolve("s", &[ip("a")], Some("search")).is_none());
            assert_eq!(set.resolve("s", &[ip("a")], Some("login")).unwrap().0.id, login.id);

            spec.enabled = false;
            set.update(login.id, spec, 2).unwrap();
            assert!(set.resolve("s", &[ip("a")], Some("login")).is_none());
        }

        #[test]
        fn test_global_system_rules_apply_everywhere() {
            let set = RuleSet::new();
            let g = set
                .create(RuleSpec::new(GLOBAL_SYSTEM, Scope::Ip, LimitType::PerMinute, 5), 1)
                .unwrap();
            assert_eq!(set.resolve("anything", &[ip("a")], None).unwrap().0.id, g.id);
        }

        #[test]
        fn test_fallback_rule() {
            let set = RuleSet::new();
            assert!(set.resolve("s", &[ip("a")], None).is_none());
            set.set_fallback(Some((LimitType::PerMinute, 10_000)));
            let (rule, cand) = set.resolve("s", &[ip("a")], None).unwrap();
            assert_eq!(rule.id, 0);
            assert_eq!(cand.scope, Scope::Global);
        }
    }
}

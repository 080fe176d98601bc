#![warn(missing_docs)]

//! Tollgate limits subsystem: rule matching, windowed buckets, quotas, auto-throttle, admission decisions

pub mod admission;
pub mod bucket;
pub mod error;
pub mod quota;
pub mod rule;
pub mod throttle;
pub mod violation;

pub use admission::{
    effective_limit, AdmissionConfig, AdmissionController, AdmissionParts, AdmissionRequest, Decision,
    RetentionPolicy, UsageReport,
};
pub use bucket::{BucketConfig, BucketStore, Committed};
pub use error::{Denial, LimitsError, Result};
pub use quota::{QuotaDefinition, QuotaPeriod, QuotaTracker, QuotaUsage};
pub use rule::{FailurePolicy, LimitType, Rule, RuleSet, RuleSpec, Scope, ScopeCandidate};
pub use throttle::{AutoThrottle, LoadSample, LoadSampler, ThrottleConfig, ThrottleLevel};
pub use violation::{Violation, ViolationLog};

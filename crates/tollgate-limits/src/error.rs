//! Error and denial types for the limits subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_reputation::ReputationError;

use crate::quota::QuotaPeriod;

/// Errors returned by rule, quota, and admission management calls.
///
/// Request-path denials are not errors; see [`Denial`].
#[derive(Debug, Error)]
pub enum LimitsError {
    /// A rule definition was rejected.
    #[error("invalid rule: {msg}")]
    InvalidRule {
        /// Why the rule was rejected.
        msg: String,
    },

    /// No rule with this id exists.
    #[error("rule {rule_id} not found")]
    UnknownRule {
        /// The id that was looked up.
        rule_id: u64,
    },

    /// A quota definition was rejected.
    #[error("invalid quota: {msg}")]
    InvalidQuota {
        /// Why the quota was rejected.
        msg: String,
    },

    /// The reputation store failed.
    #[error("reputation error: {0}")]
    Reputation(#[from] ReputationError),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, LimitsError>;

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Denial {
    /// No rule matched and the deployment fails closed.
    #[error("no rate-limit rule matches system {system} resource {resource_type:?}")]
    RuleNotFound {
        /// System the request belonged to.
        system: String,
        /// Resource type of the request.
        resource_type: Option<String>,
    },

    /// A longer-horizon quota is exhausted.
    #[error("{period} quota exhausted ({used}/{limit}), resets at {resets_at_ms}")]
    QuotaExceeded {
        /// Quota period.
        period: QuotaPeriod,
        /// Units used in the current period.
        used: u64,
        /// Units allowed in the current period.
        limit: u64,
        /// Start of the next period.
        resets_at_ms: u64,
    },

    /// The windowed bucket is full.
    #[error("rate limited: {count}/{limit}, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Effective limit applied.
        limit: u64,
        /// Admitted requests in the window.
        count: u64,
        /// Time until the window resets.
        retry_after_ms: u64,
    },

    /// The bucket store could not be reached in time and the deployment fails closed.
    #[error("bucket store busy after {waited_ms}ms")]
    StoreTimeout {
        /// How long the decision waited.
        waited_ms: u64,
    },
}

impl Denial {
    /// Short label used in violation records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Denial::RuleNotFound { .. } => "rule_not_found",
            Denial::QuotaExceeded { .. } => "quota_exceeded",
            Denial::RateLimited { .. } => "rate_limited",
            Denial::StoreTimeout { .. } => "store_timeout",
        }
    }
}

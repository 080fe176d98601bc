//! Error type for node-level operations.

use thiserror::Error;
use tollgate_limits::LimitsError;
use tollgate_repl::ReplError;
use tollgate_reputation::ReputationError;

/// Errors returned by the node's management API.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The reputation store failed.
    #[error("reputation: {0}")]
    Reputation(#[from] ReputationError),

    /// A rule or quota operation failed.
    #[error("limits: {0}")]
    Limits(#[from] LimitsError),

    /// A replication operation failed.
    #[error("replication: {0}")]
    Replication(#[from] ReplError),

    /// The configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What is wrong.
        msg: String,
    },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, NodeError>;

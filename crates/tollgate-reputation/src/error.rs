//! Error types for the reputation subsystem.

use thiserror::Error;

/// Errors that can occur in the reputation subsystem.
#[derive(Debug, Error)]
pub enum ReputationError {
    /// Backing key-value store failure.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the issue.
        msg: String,
    },

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// An event carried a hash that does not match its content.
    #[error("event hash mismatch: expected {expected}, got {got}")]
    HashMismatch {
        /// Hash recomputed from the event content.
        expected: String,
        /// Hash carried by the event.
        got: String,
    },

    /// A score outside of the valid range was requested.
    #[error("invalid score {score}: must be within [0, 100]")]
    InvalidScore {
        /// The rejected score.
        score: f64,
    },

    /// A VIP assignment was rejected.
    #[error("invalid VIP assignment for user {user_id}: {msg}")]
    InvalidVip {
        /// The user the assignment targeted.
        user_id: String,
        /// Why it was rejected.
        msg: String,
    },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ReputationError>;

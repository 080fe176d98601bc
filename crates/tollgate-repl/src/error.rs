//! Error types for the replication subsystem.

use thiserror::Error;
use tollgate_reputation::ReputationError;

/// Errors that can occur in the replication subsystem.
///
/// None of these reach the admission path; they surface in sync state,
/// health reports, and logs.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Node views of a user disagree by more than the configured spread.
    #[error("replication conflict for user {user_id}: spread {spread:.2}")]
    ReplicationConflict {
        /// The user with divergent views.
        user_id: String,
        /// max - min across node views.
        spread: f64,
    },

    /// A peer could not be reached or answered with an error.
    #[error("peer {node_id} unreachable: {msg}")]
    SyncUnreachable {
        /// The peer.
        node_id: String,
        /// What went wrong.
        msg: String,
    },

    /// A peer did not answer in time.
    #[error("peer {node_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The peer.
        node_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer is not registered.
    #[error("unknown peer: {node_id}")]
    UnknownPeer {
        /// The id that was looked up.
        node_id: String,
    },

    /// The peer is already registered.
    #[error("peer {node_id} is already registered")]
    AlreadyRegistered {
        /// The duplicate id.
        node_id: String,
    },

    /// A frame violated the wire protocol.
    #[error("protocol error: {msg}")]
    Protocol {
        /// What was wrong.
        msg: String,
    },

    /// Frame encoding or decoding failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// Socket I/O failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The local reputation store failed.
    #[error("reputation error: {0}")]
    Reputation(#[from] ReputationError),

    /// The replicator was shut down.
    #[error("replicator shut down")]
    Shutdown,
}

impl ReplError {
    /// Returns true for errors that count against a peer's sync health.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            ReplError::SyncUnreachable { .. }
                | ReplError::Timeout { .. }
                | ReplError::Protocol { .. }
                | ReplError::Io(_)
                | ReplError::Serialization(_)
        )
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

//! Append-only reputation events and their content hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tier::Tier;

/// Identifier of a user whose reputation is tracked.
pub type UserId = String;

/// Identifier of a tollgate node.
pub type NodeId = String;

/// What kind of change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A rate-limit strike.
    Violation,
    /// Credit for a batch of allowed requests.
    CleanRequest,
    /// Periodic pull toward the neutral score.
    Decay,
    /// Operator adjustment or conflict resolution.
    Manual,
    /// Informational record of a tier transition.
    TierChange,
}

impl EventType {
    /// Stable lowercase label, also used in the event hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Violation => "violation",
            EventType::CleanRequest => "clean_request",
            EventType::Decay => "decay",
            EventType::Manual => "manual",
            EventType::TierChange => "tier_change",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the deduplication hash of an event's content.
///
/// The hash covers the user, event type, delta, and originating timestamp.
/// The recording node is not part of it, so the same logical event recorded
/// twice (for example after a retried delivery) collapses to one.
pub fn event_hash(user_id: &str, event_type: EventType, score_delta: f64, timestamp_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}:{}:{:.6}:{}",
            user_id,
            event_type.as_str(),
            score_delta,
            timestamp_ms
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Content hash of a local tier-change marker.
///
/// Markers carry no delta, so the transition and the marker's local id are
/// hashed in to keep two changes within one millisecond apart.
pub fn tier_change_hash(user_id: &str, from: Tier, to: Tier, id: u64, timestamp_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}:{}:{}->{}:{}:{}",
            user_id,
            EventType::TierChange.as_str(),
            from,
            to,
            id,
            timestamp_ms
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// A reputation-changing event, as stored in a node's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    /// Local log sequence number (assigned by the node that stores it).
    pub id: u64,
    /// Affected user.
    pub user_id: UserId,
    /// Kind of change.
    pub event_type: EventType,
    /// Signed change applied to the score.
    pub score_delta: f64,
    /// Severity, 1 (minor) to 3 (severe).
    pub severity: u8,
    /// Free-form reason code or description.
    pub reason: String,
    /// Node that originally recorded the event.
    pub source_node_id: NodeId,
    /// Content hash, globally unique.
    pub event_hash: String,
    /// Originating timestamp (ms since epoch).
    pub timestamp_ms: u64,
    /// When every known peer acknowledged the event; None until then.
    pub synced_at_ms: Option<u64>,
    /// Never replicated when true.
    pub local_only: bool,
}

impl ReputationEvent {
    /// Returns true if the carried hash matches the content.
    pub fn hash_is_valid(&self) -> bool {
        self.event_hash
            == event_hash(
                &self.user_id,
                self.event_type,
                self.score_delta,
                self.timestamp_ms,
            )
    }

    /// Human-readable severity label.
    pub fn severity_label(&self) -> &'static str {
        severity_label(self.severity)
    }
}

/// Human-readable label of a severity value.
pub fn severity_label(severity: u8) -> &'static str {
    match severity {
        0 | 1 => "minor",
        2 => "moderate",
        _ => "severe",
    }
}

/// A locally generated event before it is assigned an id and hash.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Affected user.
    pub user_id: UserId,
    /// Kind of change.
    pub event_type: EventType,
    /// Signed change applied to the score.
    pub score_delta: f64,
    /// Severity, 1 (minor) to 3 (severe).
    pub severity: u8,
    /// Free-form reason.
    pub reason: String,
    /// Originating timestamp (ms since epoch).
    pub timestamp_ms: u64,
    /// Keep this event on the recording node only.
    pub local_only: bool,
}

impl NewEvent {
    /// Create a replicated event with severity 1 and no reason.
    pub fn new(user_id: impl Into<UserId>, event_type: EventType, score_delta: f64, timestamp_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            event_type,
            score_delta,
            severity: 1,
            reason: String::new(),
            timestamp_ms,
            local_only: false,
        }
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Mark the event as node-local.
    pub fn local(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Content hash this event will carry.
    pub fn hash(&self) -> String {
        event_hash(&self.user_id, self.event_type, self.score_delta, self.timestamp_ms)
    }

    /// Materialize into a stored event.
    pub fn into_event(self, id: u64, source_node_id: &str) -> ReputationEvent {
        let event_hash = self.hash();
        ReputationEvent {
            id,
            user_id: self.user_id,
            event_type: self.event_type,
            score_delta: self.score_delta,
            severity: self.severity,
            reason: self.reason,
            source_node_id: source_node_id.to_string(),
            event_hash,
            timestamp_ms: self.timestamp_ms,
            synced_at_ms: None,
            local_only: self.local_only,
        }
    }
}

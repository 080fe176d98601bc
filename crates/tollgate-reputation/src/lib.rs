#![warn(missing_docs)]

//! Tollgate reputation subsystem: event-sourced user scores, tiers, VIP overrides, decay

pub mod clock;
pub mod decay;
pub mod error;
pub mod event;
pub mod kvstore;
pub mod store;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decay::{DecayPolicy, DecayReport, DecayScheduler};
pub use error::{ReputationError, Result};
pub use event::{event_hash, EventType, NewEvent, NodeId, ReputationEvent, UserId};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use store::{
    ApplyOutcome, LogStats, ReputationScore, ReputationStats, ReputationStore, TrendPoint, UserReputationView,
    VipAssignment, ViolationSummary,
};
pub use tier::{Tier, TierPolicy, NEUTRAL_SCORE};

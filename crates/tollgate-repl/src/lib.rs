#![warn(missing_docs)]

//! Tollgate replication subsystem: peer registry, sync state, node views and consensus, push/pull sync workers

pub mod error;
pub mod protocol;
pub mod registry;
pub mod replicator;
pub mod sync_state;
pub mod transport;
pub mod views;

pub use error::{ReplError, Result};
pub use protocol::{Message, PullRequest, PulledEvents, PushAck, PushBatch, ResolveNotice};
pub use registry::{NodeRegistry, PeerRecord};
pub use replicator::{ReplicationStats, Replicator, ReplicatorConfig, ResolveOutcome, SyncReport};
pub use sync_state::{SyncState, SyncStateStore, SyncStatus};
pub use transport::{serve, LoopbackTransport, PeerHandler, PeerTransport, TcpTransport, TcpTransportConfig};
pub use views::{Consensus, NodeReputationView, ViewStore};

//! Registry of remote peer nodes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tollgate_reputation::kvstore::{self, KvStore};
use tollgate_reputation::NodeId;
use tracing::info;

use crate::error::{ReplError, Result};

const PEER_PREFIX: &[u8] = b"repl/peer/";

fn peer_key(node_id: &str) -> Vec<u8> {
    [PEER_PREFIX, node_id.as_bytes()].concat()
}

/// Record of a known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Address the peer's replication listener is reachable at.
    pub endpoint: String,
    /// When the peer was registered (ms since epoch).
    pub added_at_ms: u64,
    /// Last time the peer talked to us (ms since epoch).
    pub last_seen_ms: u64,
}

impl PeerRecord {
    /// Create a record for a newly registered peer.
    pub fn new(node_id: impl Into<NodeId>, endpoint: impl Into<String>, now_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            added_at_ms: now_ms,
            last_seen_ms: now_ms,
        }
    }
}

/// Registry of peers, persisted in the shared store.
pub struct NodeRegistry {
    local_node_id: NodeId,
    kv: Arc<dyn KvStore>,
}

impl NodeRegistry {
    /// Create a registry for `local_node_id` over `kv`.
    pub fn new(local_node_id: impl Into<NodeId>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            kv,
        }
    }

    /// This node's id.
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Register a new peer. Fails if the id is taken or is this node.
    pub fn register(&self, record: PeerRecord) -> Result<()> {
        if record.node_id == self.local_node_id {
            return Err(ReplError::Protocol {
                msg: "a node cannot register itself as a peer".to_string(),
            });
        }
        if self.kv.get(&peer_key(&record.node_id))?.is_some() {
            return Err(ReplError::AlreadyRegistered {
                node_id: record.node_id,
            });
        }
        info!(peer = %record.node_id, endpoint = %record.endpoint, "peer registered");
        kvstore::put_record(self.kv.as_ref(), peer_key(&record.node_id), &record)?;
        Ok(())
    }

    /// Unregister a peer. Returns the removed record.
    pub fn unregister(&self, node_id: &str) -> Result<PeerRecord> {
        let record = self.lookup(node_id)?.ok_or_else(|| ReplError::UnknownPeer {
            node_id: node_id.to_string(),
        })?;
        self.kv.delete(&peer_key(node_id))?;
        info!(peer = %node_id, "peer unregistered");
        Ok(record)
    }

    /// Look up a peer.
    pub fn lookup(&self, node_id: &str) -> Result<Option<PeerRecord>> {
        Ok(kvstore::get_record(self.kv.as_ref(), &peer_key(node_id))?)
    }

    /// Look up a peer that must exist.
    pub fn require(&self, node_id: &str) -> Result<PeerRecord> {
        self.lookup(node_id)?.ok_or_else(|| ReplError::UnknownPeer {
            node_id: node_id.to_string(),
        })
    }

    /// Record activity from a peer. Unknown peers are ignored.
    pub fn touch(&self, node_id: &str, now_ms: u64) -> Result<()> {
        if let Some(mut record) = self.lookup(node_id)? {
            record.last_seen_ms = record.last_seen_ms.max(now_ms);
            kvstore::put_record(self.kv.as_ref(), peer_key(node_id), &record)?;
        }
        Ok(())
    }

    /// All peers, ordered by id.
    pub fn peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(kvstore::scan_records(self.kv.as_ref(), PEER_PREFIX)?)
    }

    /// Number of registered peers.
    pub fn len(&self) -> Result<usize> {
        Ok(self.kv.scan_prefix(PEER_PREFIX)?.len())
    }
}

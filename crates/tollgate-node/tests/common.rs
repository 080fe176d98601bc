//! Shared helpers for node integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tollgate_node::{Node, NodeConfig};
use tollgate_repl::{LoopbackTransport, PeerHandler};
use tollgate_reputation::{ManualClock, MemoryKvStore};

/// Minute-aligned start time for every test.
pub const NOW: u64 = 1_709_726_400_000;

/// Config with no listener and no load sampling.
pub fn test_config(node_id: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.node_id = node_id.to_string();
    config.node.listen_addr = None;
    config.node.load_sampling = false;
    config
}

/// One node on a manual clock.
pub fn single_node() -> (Arc<Node>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(NOW));
    let node = Node::new(
        test_config("node-1"),
        Arc::new(MemoryKvStore::new()),
        Arc::new(LoopbackTransport::new()),
        clock.clone(),
    )
    .expect("node");
    (Arc::new(node), clock)
}

/// Nodes sharing one clock and one in-process network.
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub net: Arc<LoopbackTransport>,
    pub nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    /// Build `n` nodes named `node-1..=node-n`, each registered with every other.
    pub fn new(n: usize) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let net = Arc::new(LoopbackTransport::new());
        let ids: Vec<String> = (1..=n).map(|i| format!("node-{}", i)).collect();

        let nodes: Vec<Arc<Node>> = ids
            .iter()
            .map(|id| {
                let node = Node::new(
                    test_config(id),
                    Arc::new(MemoryKvStore::new()),
                    net.clone(),
                    clock.clone(),
                )
                .expect("node");
                Arc::new(node)
            })
            .collect();

        for node in &nodes {
            let handler: Arc<dyn PeerHandler> = node.replicator().clone();
            net.attach(node.node_id(), &handler);
            for peer in &ids {
                if peer != node.node_id() {
                    node.register_peer(peer, peer).expect("register peer");
                }
            }
        }

        Self { clock, net, nodes }
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// Run one sync round on every node, in order.
    pub async fn sync_all(&self) {
        for node in &self.nodes {
            for (peer, result) in node.sync_now().await.expect("sync") {
                result.unwrap_or_else(|e| panic!("{} -> {} failed: {}", node.node_id(), peer, e));
            }
        }
    }
}

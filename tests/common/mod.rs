#![allow(dead_code)]

use std::sync::Arc;

use tokio::time::{sleep, Duration, Instant};

use kadstore::sim::{MemoryNetwork, NetworkRegistry};
use kadstore::{Contact, DhtConfig, DhtNode, NodeId};

pub use kadstore::sim::RpcStats;

pub struct TestNode {
    pub node: DhtNode<MemoryNetwork>,
    pub network: MemoryNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize, alpha: usize) -> Self {
        Self::with_config(registry, index, test_config(k, alpha)).await
    }

    pub async fn with_config(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        let (node, network) = registry
            .spawn_node(make_contact(index), config)
            .await
            .expect("node config is valid");
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// Default config with short timeouts so failure paths finish quickly.
pub fn test_config(k: usize, alpha: usize) -> DhtConfig {
    DhtConfig {
        rpc_timeout_ms: 250,
        ping_timeout_ms: 100,
        ..DhtConfig::with_params(k, alpha)
    }
}

/// Make two nodes aware of each other.
pub async fn connect(a: &TestNode, b: &TestNode) {
    a.node.observe_contact(b.contact()).await;
    b.node.observe_contact(a.contact()).await;
}

/// Poll `condition` until it holds or a second passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), format!("node-{index}"))
}

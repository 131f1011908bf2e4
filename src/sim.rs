//! In-process network for simulations and tests.
//!
//! Every node gets its own [`MemoryNetwork`] handle onto a shared
//! [`NetworkRegistry`]. An RPC to a registered peer calls straight into that
//! peer's `handle_*` method; an RPC to an unknown or injected-failure peer
//! returns an error, as an unreachable host would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::config::DhtConfig;
use crate::core::{derive_node_id, Contact, Key, NodeId};
use crate::network::{DhtNetwork, FindValueResponse};
use crate::node::DhtNode;

/// Directory of live simulated nodes.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, DhtNode<MemoryNetwork>>>,
}

impl NetworkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: &DhtNode<MemoryNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.node_id(), node.clone());
    }

    /// Take a node offline. Later RPCs to it fail.
    pub async fn unregister(&self, id: &NodeId) -> Option<DhtNode<MemoryNetwork>> {
        let mut peers = self.peers.write().await;
        peers.remove(id)
    }

    pub async fn get(&self, id: &NodeId) -> Option<DhtNode<MemoryNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Create a node for `contact`, wired to this registry, and register it.
    pub async fn spawn_node(
        self: &Arc<Self>,
        contact: Contact,
        config: DhtConfig,
    ) -> crate::error::Result<(DhtNode<MemoryNetwork>, MemoryNetwork)> {
        let network = MemoryNetwork::new(self.clone(), contact.clone());
        let node = DhtNode::new(contact, network.clone(), config)?;
        self.register(&node).await;
        Ok((node, network))
    }
}

/// Per-RPC call counts seen by one [`MemoryNetwork`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub find_node: usize,
    pub find_value: usize,
    pub store: usize,
    pub ping: usize,
}

impl RpcStats {
    pub fn total(&self) -> usize {
        self.find_node + self.find_value + self.store + self.ping
    }
}

#[derive(Default)]
struct RpcCounters {
    find_node: AtomicUsize,
    find_value: AtomicUsize,
    store: AtomicUsize,
    ping: AtomicUsize,
}

/// Outbound side of one simulated node.
#[derive(Clone)]
pub struct MemoryNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    stores: Arc<Mutex<Vec<(Contact, Key, usize)>>>,
    counters: Arc<RpcCounters>,
}

impl MemoryNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(RpcCounters::default()),
        }
    }

    /// Delay every RPC this node sends to `node`.
    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node, latency);
    }

    /// Make every RPC this node sends to `node` fail (or stop failing).
    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Every STORE this node sent: target, key and value length.
    pub async fn store_calls(&self) -> Vec<(Contact, Key, usize)> {
        let stores = self.stores.lock().await;
        stores.clone()
    }

    /// RPCs attempted so far, including failed ones.
    pub fn rpc_stats(&self) -> RpcStats {
        RpcStats {
            find_node: self.counters.find_node.load(Ordering::Relaxed),
            find_value: self.counters.find_value.load(Ordering::Relaxed),
            store: self.counters.store.load(Ordering::Relaxed),
            ping: self.counters.ping.load(Ordering::Relaxed),
        }
    }

    async fn reach(&self, to: &Contact) -> Result<DhtNode<MemoryNetwork>> {
        let failing = self.failures.lock().await.contains(&to.id);
        if failing {
            return Err(anyhow!("injected network failure"));
        }
        let latency = self.latencies.lock().await.get(&to.id).copied();
        if let Some(delay) = latency {
            sleep(delay).await;
        }
        self.registry
            .get(&to.id)
            .await
            .ok_or_else(|| anyhow!("peer {to} not reachable"))
    }
}

#[async_trait]
impl DhtNetwork for MemoryNetwork {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        self.counters.find_node.fetch_add(1, Ordering::Relaxed);
        let peer = self.reach(to).await?;
        Ok(peer
            .handle_find_node_request(&self.self_contact, target)
            .await)
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResponse> {
        self.counters.find_value.fetch_add(1, Ordering::Relaxed);
        let peer = self.reach(to).await?;
        Ok(peer
            .handle_find_value_request(&self.self_contact, key)
            .await)
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        self.counters.store.fetch_add(1, Ordering::Relaxed);
        let peer = self.reach(to).await?;
        {
            let mut stores = self.stores.lock().await;
            stores.push((to.clone(), key, value.len()));
        }
        peer.handle_store_request(&self.self_contact, key, value)
            .await?;
        Ok(())
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        self.counters.ping.fetch_add(1, Ordering::Relaxed);
        let peer = self.reach(to).await?;
        peer.handle_ping(&self.self_contact).await;
        Ok(())
    }
}

/// Contact for the `index`-th simulated node, with its ID derived from its name.
pub fn sim_contact(index: usize) -> Contact {
    let name = format!("node{index}");
    Contact::new(derive_node_id(name.as_bytes()), name)
}

/// Spin up `size` nodes on `registry` and bootstrap each through node 0.
pub async fn build_cluster(
    registry: &Arc<NetworkRegistry>,
    size: usize,
    config: &DhtConfig,
) -> crate::error::Result<Vec<DhtNode<MemoryNetwork>>> {
    let mut nodes = Vec::with_capacity(size);
    for index in 0..size {
        let (node, _) = registry
            .spawn_node(sim_contact(index), config.clone())
            .await?;
        nodes.push(node);
    }

    if let Some((first, rest)) = nodes.split_first() {
        let seed = first.contact();
        for node in rest {
            node.bootstrap(vec![seed.clone()]).await?;
        }
    }

    info!(nodes = nodes.len(), "cluster ready");
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash_content;

    #[tokio::test]
    async fn rpc_to_unregistered_peer_fails() {
        let registry = NetworkRegistry::new();
        let network = MemoryNetwork::new(registry.clone(), sim_contact(0));

        let err = network.ping(&sim_contact(1)).await.unwrap_err();
        assert!(err.to_string().contains("not reachable"));
        assert_eq!(network.rpc_stats().ping, 1);
    }

    #[tokio::test]
    async fn injected_failure_blocks_only_the_flagged_peer() {
        let registry = NetworkRegistry::new();
        let (_a, net_a) = registry
            .spawn_node(sim_contact(0), DhtConfig::default())
            .await
            .unwrap();
        registry
            .spawn_node(sim_contact(1), DhtConfig::default())
            .await
            .unwrap();
        registry
            .spawn_node(sim_contact(2), DhtConfig::default())
            .await
            .unwrap();

        net_a.set_failure(sim_contact(1).id, true).await;
        assert!(net_a.ping(&sim_contact(1)).await.is_err());
        assert!(net_a.ping(&sim_contact(2)).await.is_ok());

        net_a.set_failure(sim_contact(1).id, false).await;
        assert!(net_a.ping(&sim_contact(1)).await.is_ok());
    }

    #[tokio::test]
    async fn store_rejected_by_peer_is_an_error() {
        let registry = NetworkRegistry::new();
        let (_a, net_a) = registry
            .spawn_node(sim_contact(0), DhtConfig::default())
            .await
            .unwrap();
        let (b, _) = registry
            .spawn_node(sim_contact(1), DhtConfig::default())
            .await
            .unwrap();

        let key = hash_content(b"real");
        assert!(net_a
            .store(&b.contact(), key, b"forged".to_vec())
            .await
            .is_err());
        assert!(b.content_store().is_empty());
        assert_eq!(net_a.store_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn build_cluster_connects_every_node() {
        let registry = NetworkRegistry::new();
        let nodes = build_cluster(&registry, 12, &DhtConfig::with_params(4, 2))
            .await
            .unwrap();

        assert_eq!(registry.len().await, 12);
        for node in &nodes {
            assert!(!node.routing_table().is_empty(), "{} is isolated", node.contact());
        }
    }
}

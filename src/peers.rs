//! Feeding peer sightings into the routing table.
//!
//! Every successful RPC exchange, in either direction, is a sighting. Sightings
//! that land in a full bucket trigger the Kademlia ping-before-evict check in a
//! detached task; failed RPCs demote the peer to its bucket's ping candidate.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Duration;
use tracing::{debug, trace};

use crate::core::{short_hex, Contact, NodeId};
use crate::error::DhtError;
use crate::network::DhtNetwork;
use crate::routing::{PendingBucketUpdate, RoutingTable};

/// Shared handle used by lookups, replication and inbound handlers to report
/// what they learn about peers.
pub(crate) struct PeerTracker<N: DhtNetwork> {
    routing: Arc<RoutingTable>,
    network: Arc<N>,
    ping_timeout: Duration,
}

impl<N: DhtNetwork> Clone for PeerTracker<N> {
    fn clone(&self) -> Self {
        Self {
            routing: self.routing.clone(),
            network: self.network.clone(),
            ping_timeout: self.ping_timeout,
        }
    }
}

impl<N: DhtNetwork> PeerTracker<N> {
    pub(crate) fn new(routing: Arc<RoutingTable>, network: Arc<N>, ping_timeout: Duration) -> Self {
        Self {
            routing,
            network,
            ping_timeout,
        }
    }

    pub(crate) fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub(crate) fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Record a sighting of `contact`.
    ///
    /// Must run inside a tokio runtime: a full bucket spawns a ping of its
    /// oldest contact.
    pub(crate) fn observe(&self, contact: Contact) {
        if let Some(pending) = self.routing.insert(contact) {
            self.spawn_ping_check(pending);
        }
    }

    /// Record that `id` failed to answer an RPC.
    pub(crate) fn flag_unreachable(&self, id: &NodeId) {
        if self.routing.mark_stale(id) {
            trace!(peer = %short_hex(id), "demoted unresponsive peer to ping candidate");
        }
    }

    fn spawn_ping_check(&self, pending: PendingBucketUpdate) {
        let network = self.network.clone();
        let routing = self.routing.clone();
        let ping_timeout = self.ping_timeout;
        tokio::spawn(async move {
            let oldest = pending.oldest.clone();
            let alive = match timed_rpc(&oldest, ping_timeout, network.ping(&oldest)).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(peer = %oldest, error = %err, "ping failed, evicting");
                    false
                }
            };
            routing.apply_ping_result(pending, alive);
        });
    }
}

/// Run one RPC under a timeout, classifying failures as per-peer errors.
pub(crate) async fn timed_rpc<T, F>(
    contact: &Contact,
    timeout: Duration,
    call: F,
) -> Result<T, DhtError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DhtError::PeerUnreachable {
            peer: contact.to_string(),
            reason: format!("{err:#}"),
        }),
        Err(_) => Err(DhtError::Timeout {
            peer: contact.to_string(),
            timeout,
        }),
    }
}

//! Record replication to the k closest nodes.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::core::{short_hex, xor_distance, Contact, Key, NodeId};
use crate::error::{DhtError, Result};
use crate::lookup::LookupCoordinator;
use crate::network::DhtNetwork;
use crate::peers::{timed_rpc, PeerTracker};
use crate::store::{ContentStore, MemoryBackend, RecordBackend};

/// What a replication pass achieved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreReport {
    pub key: Key,
    /// Remote nodes that acknowledged the STORE.
    pub replicas: Vec<NodeId>,
    /// Remote nodes whose STORE failed or timed out.
    pub failed: Vec<NodeId>,
    /// Whether the local store holds the record after this pass.
    pub stored_locally: bool,
}

impl StoreReport {
    /// Total copies confirmed, local copy included.
    pub fn copies(&self) -> usize {
        self.replicas.len() + usize::from(self.stored_locally)
    }
}

pub struct ReplicationManager<N: DhtNetwork, B: RecordBackend = MemoryBackend> {
    local_id: NodeId,
    records: Arc<ContentStore<B>>,
    lookup: LookupCoordinator<N>,
    tracker: PeerTracker<N>,
    bucket_size: usize,
    rpc_timeout: Duration,
}

impl<N: DhtNetwork, B: RecordBackend> Clone for ReplicationManager<N, B> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id,
            records: self.records.clone(),
            lookup: self.lookup.clone(),
            tracker: self.tracker.clone(),
            bucket_size: self.bucket_size,
            rpc_timeout: self.rpc_timeout,
        }
    }
}

impl<N: DhtNetwork, B: RecordBackend> ReplicationManager<N, B> {
    pub(crate) fn new(
        local_id: NodeId,
        records: Arc<ContentStore<B>>,
        lookup: LookupCoordinator<N>,
        tracker: PeerTracker<N>,
        rpc_timeout: Duration,
    ) -> Self {
        let bucket_size = tracker.routing().bucket_size();
        Self {
            local_id,
            records,
            lookup,
            tracker,
            bucket_size,
            rpc_timeout,
        }
    }

    /// Replicate a record to the k closest nodes to its key.
    ///
    /// The record is verified before any network traffic. The local node keeps
    /// a copy when it is one of the k closest or when `publisher` is set. Fails
    /// with [`DhtError::ReplicationFailed`] only if no copy landed anywhere.
    pub async fn store(&self, key: Key, value: Vec<u8>, publisher: bool) -> Result<StoreReport> {
        self.records.validate(&key, &value)?;

        let targets = match self.lookup.find_node(key).await {
            Ok(targets) => targets,
            Err(DhtError::LookupFailed { attempted }) => {
                warn!(key = %short_hex(&key), attempted, "no reachable peers near key");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let store_locally = publisher || self.is_among_closest(&key, &targets);
        let stored_locally = if store_locally {
            self.records.put(key, value.clone())?;
            true
        } else {
            false
        };

        let mut join_set = JoinSet::new();
        for contact in targets.iter().take(self.bucket_size).cloned() {
            let tracker = self.tracker.clone();
            let value = value.clone();
            let timeout = self.rpc_timeout;
            join_set.spawn(async move {
                let network = tracker.network().clone();
                let result = timed_rpc(&contact, timeout, network.store(&contact, key, value)).await;
                match &result {
                    Ok(()) => tracker.observe(contact.clone()),
                    Err(err) => {
                        debug!(peer = %contact, error = %err, "store rejected or unanswered");
                        tracker.flag_unreachable(&contact.id);
                    }
                }
                (contact.id, result.is_ok())
            });
        }

        let mut replicas = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, true)) => replicas.push(id),
                Ok((id, false)) => failed.push(id),
                Err(err) => warn!(error = %err, "store task panicked"),
            }
        }

        if replicas.is_empty() && !stored_locally {
            return Err(DhtError::ReplicationFailed {
                attempted: targets.len(),
            });
        }

        debug!(
            key = %short_hex(&key),
            replicas = replicas.len(),
            failed = failed.len(),
            stored_locally,
            "record replicated"
        );
        Ok(StoreReport {
            key,
            replicas,
            failed,
            stored_locally,
        })
    }

    /// Push every locally held record back out to its current closest nodes.
    /// Returns how many records reached at least one copy.
    pub async fn republish_all(&self) -> Result<usize> {
        let mut republished = 0;
        for key in self.records.keys()? {
            let Some(value) = self.records.get(&key)? else {
                continue;
            };
            match self.store(key, value, true).await {
                Ok(_) => republished += 1,
                Err(err) => warn!(key = %short_hex(&key), error = %err, "republish failed"),
            }
        }
        Ok(republished)
    }

    fn is_among_closest(&self, key: &Key, targets: &[Contact]) -> bool {
        if targets.len() < self.bucket_size {
            return true;
        }
        let own = xor_distance(&self.local_id, key);
        targets
            .last()
            .map_or(true, |farthest| own < farthest.distance_to(key))
    }
}

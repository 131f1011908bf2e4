//! The caller-facing DHT node.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::core::{hash_content, short_hex, Contact, IdentityProvider, Key, NodeId};
use crate::error::{DhtError, Result};
use crate::lookup::{CancelToken, LookupCoordinator, LookupMode, LookupResult};
use crate::network::{DhtNetwork, FindValueResponse};
use crate::peers::PeerTracker;
use crate::replication::{ReplicationManager, StoreReport};
use crate::routing::RoutingTable;
use crate::store::{ContentStore, MemoryBackend, RecordBackend};

/// Snapshot of node state for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Contacts across all buckets.
    pub routing_contacts: usize,
    pub occupied_buckets: usize,
    /// Records in the local store.
    pub stored_keys: usize,
    pub bucket_size: usize,
    pub alpha: usize,
}

/// What one maintenance pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub refreshed_buckets: usize,
    /// `None` when republishing was not due.
    pub republished: Option<usize>,
}

/// A Kademlia node: routing table, local record store and the lookup and
/// replication logic that drives them.
///
/// The node is generic over the [`DhtNetwork`] used for outbound RPCs, so tests
/// and simulations run on [`crate::sim::MemoryNetwork`] while a deployment plugs
/// in a real transport. Inbound RPCs arrive through the `handle_*` methods.
///
/// Cloning is cheap; clones share all state.
pub struct DhtNode<N: DhtNetwork, B: RecordBackend = MemoryBackend> {
    self_contact: Contact,
    config: Arc<DhtConfig>,
    routing: Arc<RoutingTable>,
    store: Arc<ContentStore<B>>,
    tracker: PeerTracker<N>,
    lookup: LookupCoordinator<N>,
    replication: ReplicationManager<N, B>,
    last_republish: Arc<Mutex<Instant>>,
}

impl<N: DhtNetwork, B: RecordBackend> Clone for DhtNode<N, B> {
    fn clone(&self) -> Self {
        Self {
            self_contact: self.self_contact.clone(),
            config: self.config.clone(),
            routing: self.routing.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            lookup: self.lookup.clone(),
            replication: self.replication.clone(),
            last_republish: self.last_republish.clone(),
        }
    }
}

impl<N: DhtNetwork> DhtNode<N, MemoryBackend> {
    /// Create a node with an in-memory record store.
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Result<Self> {
        Self::with_backend(self_contact, network, config, MemoryBackend::new())
    }

    /// Create a node whose ID comes from `identity`.
    pub fn with_identity(
        identity: &impl IdentityProvider,
        addr: impl Into<String>,
        network: N,
        config: DhtConfig,
    ) -> Result<Self> {
        Self::new(Contact::new(identity.node_id(), addr), network, config)
    }
}

impl<N: DhtNetwork, B: RecordBackend> DhtNode<N, B> {
    /// Create a node storing records in `backend`.
    pub fn with_backend(
        self_contact: Contact,
        network: N,
        config: DhtConfig,
        backend: B,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = self_contact.id;
        let routing = Arc::new(RoutingTable::new(local_id, config.bucket_size));
        let store = Arc::new(ContentStore::with_backend(
            backend,
            config.max_value_size,
            config.record_ttl(),
        ));
        let tracker = PeerTracker::new(routing.clone(), Arc::new(network), config.ping_timeout());
        let lookup = LookupCoordinator::new(local_id, tracker.clone(), &config);
        let replication = ReplicationManager::new(
            local_id,
            store.clone(),
            lookup.clone(),
            tracker.clone(),
            config.rpc_timeout(),
        );

        Ok(Self {
            self_contact,
            config: Arc::new(config),
            routing,
            store,
            tracker,
            lookup,
            replication,
            last_republish: Arc::new(Mutex::new(Instant::now())),
        })
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.self_contact.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn content_store(&self) -> &ContentStore<B> {
        &self.store
    }

    pub fn lookup_coordinator(&self) -> &LookupCoordinator<N> {
        &self.lookup
    }

    pub fn replication(&self) -> &ReplicationManager<N, B> {
        &self.replication
    }

    /// Record a sighting of `contact` in the routing table.
    ///
    /// If its bucket is full, the bucket's oldest contact is pinged in the
    /// background and evicted only if it does not answer.
    pub async fn observe_contact(&self, contact: Contact) {
        self.tracker.observe(contact);
    }

    /// Join the network through `seeds`.
    ///
    /// Adds the seeds, looks up our own ID to learn our neighbourhood, then
    /// refreshes every bucket farther away than the nearest neighbour found.
    /// Returns the routing table size afterwards.
    pub async fn bootstrap(&self, seeds: Vec<Contact>) -> Result<usize> {
        for seed in seeds {
            if seed.id != self.node_id() {
                self.tracker.observe(seed);
            }
        }
        if self.routing.is_empty() {
            debug!(node = %self.self_contact, "bootstrap without seeds");
            return Ok(0);
        }

        self.lookup.find_node(self.node_id()).await?;

        if let Some(nearest) = self.routing.nearest_occupied_bucket() {
            for index in 0..nearest {
                self.refresh_bucket(index).await;
            }
        }

        let known = self.routing.len();
        info!(node = %self.self_contact, contacts = known, "bootstrap complete");
        Ok(known)
    }

    /// The k closest reachable nodes to `target`.
    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        self.lookup.find_node(target).await
    }

    /// Run a FIND_VALUE lookup over the network, ignoring the local store.
    pub async fn iterative_find_value(&self, key: Key) -> Result<LookupResult> {
        self.lookup.lookup(key, LookupMode::FindValue, None).await
    }

    /// Like [`Self::get`] but abandoned when `cancel` fires.
    pub async fn get_with_cancel(&self, key: &Key, cancel: CancelToken) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.store.get(key)? {
            return Ok(Some(value));
        }
        let result = self
            .lookup
            .lookup(*key, LookupMode::FindValue, Some(cancel))
            .await?;
        Ok(result.value.map(|found| found.value))
    }

    /// Fetch a record: local store first, then a FIND_VALUE lookup.
    ///
    /// `Ok(None)` means the lookup converged without finding the record.
    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.store.get(key)? {
            return Ok(Some(value));
        }
        let result = self.iterative_find_value(*key).await?;
        match result.value {
            Some(found) => {
                debug!(key = %short_hex(key), holder = %found.holder, rounds = result.rounds, "remote get hit");
                Ok(Some(found.value))
            }
            None => {
                debug!(key = %short_hex(key), rounds = result.rounds, "record not found");
                Ok(None)
            }
        }
    }

    /// Publish a value under its content hash. Returns the key.
    pub async fn put(&self, value: Vec<u8>) -> Result<Key> {
        let key = hash_content(&value);
        self.put_record(key, value).await?;
        Ok(key)
    }

    /// Publish a record under an explicit key, which must be the value's hash.
    ///
    /// A mismatching pair fails with [`DhtError::Integrity`] before any RPC.
    pub async fn put_record(&self, key: Key, value: Vec<u8>) -> Result<StoreReport> {
        self.replication.store(key, value, true).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound RPC handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle an incoming FIND_NODE: the k closest contacts we know to `target`.
    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.tracker.observe(from.clone());
        self.routing.closest_peers(&target, self.config.bucket_size)
    }

    /// Handle an incoming FIND_VALUE: the value if we hold it, else closer contacts.
    pub async fn handle_find_value_request(&self, from: &Contact, key: Key) -> FindValueResponse {
        self.tracker.observe(from.clone());
        match self.store.get(&key) {
            Ok(Some(value)) => FindValueResponse::Found(value),
            Ok(None) => FindValueResponse::Closer(
                self.routing.closest_peers(&key, self.config.bucket_size),
            ),
            Err(err) => {
                warn!(key = %short_hex(&key), error = %err, "local read failed");
                FindValueResponse::Closer(
                    self.routing.closest_peers(&key, self.config.bucket_size),
                )
            }
        }
    }

    /// Handle an incoming STORE. Records that fail verification are rejected.
    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        self.tracker.observe(from.clone());
        self.store.put(key, value).map(|_| ())
    }

    /// Handle an incoming PING.
    pub async fn handle_ping(&self, from: &Contact) {
        self.tracker.observe(from.clone());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            routing_contacts: self.routing.len(),
            occupied_buckets: self.routing.occupied_buckets(),
            stored_keys: self.store.len(),
            bucket_size: self.config.bucket_size,
            alpha: self.config.alpha,
        }
    }

    /// One round of upkeep: expire records, refresh idle buckets, and
    /// republish local records when the republish interval has passed.
    pub async fn maintenance_tick(&self) -> Result<MaintenanceReport> {
        let now = Instant::now();
        let expired = self.store.expire(now)?;

        let stale = self
            .routing
            .stale_buckets(self.config.bucket_refresh_interval());
        for &index in &stale {
            self.refresh_bucket(index).await;
        }

        let due = {
            let mut last = self.last_republish.lock();
            if now.duration_since(*last) >= self.config.republish_interval() {
                *last = now;
                true
            } else {
                false
            }
        };
        let republished = if due {
            Some(self.replication.republish_all().await?)
        } else {
            None
        };

        Ok(MaintenanceReport {
            expired,
            refreshed_buckets: stale.len(),
            republished,
        })
    }

    /// Run [`Self::maintenance_tick`] every `period` until the task is aborted.
    pub fn spawn_maintenance(&self, period: Duration) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match node.maintenance_tick().await {
                    Ok(report) => debug!(node = %node.self_contact, ?report, "maintenance tick"),
                    Err(err) => warn!(node = %node.self_contact, error = %err, "maintenance failed"),
                }
            }
        })
    }

    async fn refresh_bucket(&self, index: usize) {
        let target = self.routing.random_id_in_bucket(index);
        match self.lookup.find_node(target).await {
            Ok(_) => {}
            Err(DhtError::LookupFailed { attempted }) => {
                debug!(bucket = index, attempted, "bucket refresh reached nobody");
            }
            Err(err) => warn!(bucket = index, error = %err, "bucket refresh failed"),
        }
    }
}

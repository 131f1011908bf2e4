//! Kademlia routing table: k-buckets indexed by shared-prefix length.
//!
//! Buckets are pure data structures. When a bucket is full the insert does not
//! block on I/O; it hands the least-recently-seen contact back to the caller as
//! a ping candidate, and the caller decides after pinging it.

use parking_lot::Mutex;
use rand::RngCore;
use tokio::time::{Duration, Instant};

use crate::core::{bucket_index, cmp_by_distance, Contact, NodeId, ID_BITS, ID_BYTES};

// ─────────────────────────────────────────────────────────────────────────────
// Bucket
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of inserting a contact into a [`Bucket`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Contact was appended (bucket had space).
    Inserted,
    /// Contact was already present and moved to the most-recent position.
    Refreshed,
    /// Bucket is full; `candidate` is the least-recently-seen contact and should
    /// be pinged. The bucket was not modified.
    Full { candidate: Contact },
}

/// A single k-bucket with LRU-like ordering.
///
/// Contacts are kept oldest first, newest last. Long-lived contacts are preferred
/// over new ones: a newcomer only gets a slot once the oldest entry is confirmed
/// unreachable.
#[derive(Debug, Clone)]
pub struct Bucket {
    contacts: Vec<Contact>,
    capacity: usize,
    last_updated: Option<Instant>,
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            contacts: Vec::with_capacity(capacity),
            capacity,
            last_updated: None,
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.iter().any(|c| &c.id == id)
    }

    /// Contacts in LRU order (least-recently-seen first).
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// The least-recently-seen contact.
    pub fn oldest(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// When the bucket last gained or refreshed a contact.
    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    /// Add or refresh a contact.
    ///
    /// - present: moved to the end (most recently seen)
    /// - space left: appended
    /// - full: unchanged, the oldest contact is returned as a ping candidate
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if self.refresh(&contact.id) {
            return InsertOutcome::Refreshed;
        }

        if !self.is_full() {
            self.contacts.push(contact);
            self.last_updated = Some(Instant::now());
            return InsertOutcome::Inserted;
        }

        match self.contacts.first() {
            Some(oldest) => InsertOutcome::Full {
                candidate: oldest.clone(),
            },
            // Zero-capacity bucket: nothing to evict.
            None => InsertOutcome::Full { candidate: contact },
        }
    }

    /// Move a contact to the most-recent position. Returns false if absent.
    pub fn refresh(&mut self, id: &NodeId) -> bool {
        match self.contacts.iter().position(|c| &c.id == id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.push(existing);
                self.last_updated = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Demote a contact to the least-recently-seen position so it becomes the
    /// next ping candidate. Returns false if absent.
    pub fn mark_stale(&mut self, id: &NodeId) -> bool {
        match self.contacts.iter().position(|c| &c.id == id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.insert(0, existing);
                true
            }
            None => false,
        }
    }

    /// Remove a contact, e.g. after a failed liveness check.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        Some(self.contacts.remove(pos))
    }

    /// Evict `stale` (reported unreachable by the caller) and admit `replacement`.
    ///
    /// Returns true if the replacement now occupies a slot.
    pub fn replace_unreachable(&mut self, stale: &NodeId, replacement: Contact) -> bool {
        let _ = self.remove(stale);
        if self.contains(&replacement.id) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.contacts.push(replacement);
        self.last_updated = Some(Instant::now());
        true
    }

    /// Up to `n` contacts sorted by distance to `target`.
    ///
    /// The sort is stable, so equal distances keep insertion order. The returned
    /// iterator borrows the bucket and can be cloned to walk it again.
    pub fn closest_to<'a>(
        &'a self,
        target: &NodeId,
        n: usize,
    ) -> impl Iterator<Item = &'a Contact> + Clone + 'a {
        let mut sorted: Vec<&Contact> = self.contacts.iter().collect();
        sorted.sort_by(|a, b| cmp_by_distance(target, &a.id, &b.id));
        sorted.into_iter().take(n)
    }
}

/// A full bucket waiting on a ping of its oldest contact.
#[derive(Clone, Debug)]
pub struct PendingBucketUpdate {
    pub bucket_index: usize,
    /// The least-recently-seen contact that must prove it is alive.
    pub oldest: Contact,
    /// The newcomer that takes the slot if `oldest` is dead.
    pub new_contact: Contact,
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Kademlia routing table with 256 buckets for 256-bit node IDs.
///
/// Every bucket sits behind its own lock, so sightings that land in unrelated
/// buckets never contend. No lock is held across an `.await`.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    /// Create an empty table for `self_id` with `bucket_size` contacts per bucket.
    pub fn new(self_id: NodeId, bucket_size: usize) -> Self {
        let buckets = (0..ID_BITS)
            .map(|_| Mutex::new(Bucket::new(bucket_size)))
            .collect();
        Self {
            self_id,
            bucket_size,
            buckets,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.self_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Bucket that `id` belongs to.
    pub fn bucket_index_for(&self, id: &NodeId) -> usize {
        bucket_index(&self.self_id, id)
    }

    /// Add or refresh a contact, ignoring the ping-before-evict outcome.
    pub fn update(&self, contact: Contact) {
        let _ = self.insert(contact);
    }

    /// Add or refresh a contact.
    ///
    /// When the owning bucket is full, returns the pending update so the caller
    /// can ping the oldest contact and report back via [`Self::apply_ping_result`].
    pub fn insert(&self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.id == self.self_id {
            return None;
        }
        let idx = self.bucket_index_for(&contact.id);
        let outcome = self.buckets[idx].lock().insert(contact.clone());
        match outcome {
            InsertOutcome::Inserted | InsertOutcome::Refreshed => None,
            InsertOutcome::Full { candidate } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest: candidate,
                new_contact: contact,
            }),
        }
    }

    /// Apply the result of pinging the oldest contact of a full bucket.
    ///
    /// Alive: the oldest is refreshed and the newcomer dropped. Dead: the oldest
    /// is evicted and the newcomer takes its slot.
    pub fn apply_ping_result(&self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let mut bucket = self.buckets[pending.bucket_index].lock();
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
        } else {
            bucket.replace_unreachable(&pending.oldest.id, pending.new_contact);
        }
    }

    /// Remove a contact from whichever bucket holds it.
    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].lock().remove(id)
    }

    /// Flag a contact as suspect: it becomes its bucket's next ping candidate.
    pub fn mark_stale(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].lock().mark_stale(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].lock().contains(id)
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.lock().is_empty())
    }

    /// Number of buckets holding at least one contact.
    pub fn occupied_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.lock().is_empty()).count()
    }

    /// Snapshot of one bucket.
    pub fn bucket(&self, index: usize) -> Option<Bucket> {
        self.buckets.get(index).map(|b| b.lock().clone())
    }

    /// The `n` closest known contacts to `target`, nearest first.
    ///
    /// Every bucket contributes its own `n` closest before the merged set is
    /// re-sorted: in a sparse table the bucket matching `target` may hold fewer
    /// than `n` contacts, or none. An empty table yields an empty vec.
    pub fn closest_peers(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            all.extend(bucket.closest_to(target, n).cloned());
        }

        all.sort_by(|a, b| cmp_by_distance(target, &a.id, &b.id));
        all.truncate(n);
        all
    }

    /// Index of the bucket holding the nearest known neighbour.
    pub fn nearest_occupied_bucket(&self) -> Option<usize> {
        (0..self.buckets.len())
            .rev()
            .find(|&idx| !self.buckets[idx].lock().is_empty())
    }

    /// Non-empty buckets whose contacts have not changed for `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, bucket)| {
                let bucket = bucket.lock();
                match bucket.last_updated() {
                    Some(at) if !bucket.is_empty() && now.duration_since(at) >= max_age => {
                        Some(idx)
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// A random ID that falls into bucket `index`: it shares exactly `index`
    /// leading bits with the local ID.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let index = index.min(ID_BITS - 1);
        let mut id = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut id);

        let byte = index / 8;
        let bit = index % 8;
        // Copy the shared prefix from the local ID.
        id[..byte].copy_from_slice(&self.self_id[..byte]);
        let prefix_mask: u8 = if bit == 0 { 0 } else { 0xFF << (8 - bit) };
        id[byte] = (self.self_id[byte] & prefix_mask) | (id[byte] & !prefix_mask);
        // Flip the first differing bit.
        let flip = 0x80u8 >> bit;
        id[byte] = (id[byte] & !flip) | (!self.self_id[byte] & flip);
        id
    }
}

//! Local content-addressed record storage.
//!
//! [`ContentStore`] enforces the record invariant `hash(value) == key` on every
//! write and delegates the bytes to a [`RecordBackend`]. Records are verified once
//! on the way in; reads trust the backend.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::{short_hex, verify_key_value_pair, Key};
use crate::error::{DhtError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Backends
// ─────────────────────────────────────────────────────────────────────────────

/// Storage seam for records. Implementations may be durable; the core only
/// relies on get/put/contains semantics.
pub trait RecordBackend: Send + Sync + 'static {
    fn get(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>>;

    fn put(&self, key: Key, value: Vec<u8>) -> anyhow::Result<()>;

    fn contains(&self, key: &Key) -> anyhow::Result<bool>;

    fn remove(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>>;

    fn keys(&self) -> anyhow::Result<Vec<Key>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory `HashMap` backend. All data is lost on process termination.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Key, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordBackend for MemoryBackend {
    fn get(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Vec<u8>) -> anyhow::Result<()> {
        self.records.write().insert(key, value);
        Ok(())
    }

    fn contains(&self, key: &Key) -> anyhow::Result<bool> {
        Ok(self.records.read().contains_key(key))
    }

    fn remove(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.records.write().remove(key))
    }

    fn keys(&self) -> anyhow::Result<Vec<Key>> {
        Ok(self.records.read().keys().copied().collect())
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Content Store
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a successful [`ContentStore::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The identical record was already present; nothing changed.
    AlreadyPresent,
}

/// Verified key/value store owned by one node.
pub struct ContentStore<B: RecordBackend = MemoryBackend> {
    backend: B,
    max_value_size: usize,
    ttl: Option<Duration>,
    stored_at: RwLock<HashMap<Key, Instant>>,
}

impl ContentStore<MemoryBackend> {
    /// In-memory store with the given value size limit and no expiry.
    pub fn in_memory(max_value_size: usize) -> Self {
        Self::with_backend(MemoryBackend::new(), max_value_size, None)
    }
}

impl<B: RecordBackend> ContentStore<B> {
    pub fn with_backend(backend: B, max_value_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            backend,
            max_value_size,
            ttl,
            stored_at: RwLock::new(HashMap::new()),
        }
    }

    /// Check a record without storing it.
    pub fn validate(&self, key: &Key, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_size {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: self.max_value_size,
            });
        }
        if !verify_key_value_pair(key, value) {
            warn!(key = %short_hex(key), len = value.len(), "rejecting record: hash mismatch");
            return Err(DhtError::Integrity(*key));
        }
        Ok(())
    }

    /// Verify and store a record. Re-storing a present record is a no-op.
    pub fn put(&self, key: Key, value: Vec<u8>) -> Result<PutOutcome> {
        self.validate(&key, &value)?;

        if self.backend.contains(&key).map_err(storage_err)? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let len = value.len();
        self.backend.put(key, value).map_err(storage_err)?;
        self.stored_at.write().insert(key, Instant::now());
        debug!(key = %short_hex(&key), len, "stored record");
        Ok(PutOutcome::Stored)
    }

    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.backend.get(key).map_err(storage_err)
    }

    pub fn contains(&self, key: &Key) -> Result<bool> {
        self.backend.contains(key).map_err(storage_err)
    }

    pub fn keys(&self) -> Result<Vec<Key>> {
        self.backend.keys().map_err(storage_err)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Drop records older than the configured TTL. Returns how many were removed.
    ///
    /// Without a TTL records live until the process exits and this is a no-op.
    pub fn expire(&self, now: Instant) -> Result<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };

        let expired: Vec<Key> = self
            .stored_at
            .read()
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= ttl)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.backend.remove(key).map_err(storage_err)?;
            self.stored_at.write().remove(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired records");
        }
        Ok(expired.len())
    }
}

fn storage_err(err: anyhow::Error) -> DhtError {
    DhtError::Storage(format!("{err:#}"))
}

//! Error types surfaced by the DHT core.
//!
//! Per-peer failures ([`DhtError::PeerUnreachable`], [`DhtError::Timeout`]) are
//! produced inside lookups and replication for logging, but are absorbed there.
//! Callers only ever see aggregate failures or local integrity violations.

use std::time::Duration;

use thiserror::Error;

use crate::core::Key;

/// Errors produced by the DHT.
#[derive(Error, Debug)]
pub enum DhtError {
    /// `hash(value) != key`. Fatal to the operation; never retried with the same value.
    #[error("integrity check failed: value does not hash to key {}", hex::encode(&.0[..8]))]
    Integrity(Key),

    #[error("value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("rpc to {peer} timed out after {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    /// The shortlist emptied because every queried peer failed.
    #[error("lookup failed: all {attempted} queried peers were unreachable")]
    LookupFailed { attempted: usize },

    /// No STORE succeeded and the record could not be kept locally either.
    #[error("replication failed: none of {attempted} store targets accepted the record")]
    ReplicationFailed { attempted: usize },

    #[error("lookup cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DhtError {
    /// True for failures scoped to a single peer and RPC.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            DhtError::PeerUnreachable { .. } | DhtError::Timeout { .. }
        )
    }
}

/// Result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_error_shows_key_prefix() {
        let err = DhtError::Integrity([0xab; 32]);
        assert_eq!(
            err.to_string(),
            "integrity check failed: value does not hash to key abababababababab"
        );
    }

    #[test]
    fn peer_failures_are_classified() {
        let timeout = DhtError::Timeout {
            peer: "aa".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_peer_failure());
        assert!(!DhtError::Cancelled.is_peer_failure());
        assert!(!DhtError::LookupFailed { attempted: 3 }.is_peer_failure());
    }
}

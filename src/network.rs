//! Network abstraction for DHT RPC operations.
//!
//! The transport and its wire encoding live outside this crate. The core only
//! talks to peers through [`DhtNetwork`], so tests can plug in an in-memory
//! network (see [`crate::sim`]) and production can plug in QUIC, TCP, etc.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Contact, Key, NodeId};

/// Reply to a FIND_VALUE request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResponse {
    /// The peer holds the value.
    Found(Vec<u8>),
    /// The peer does not hold the value; these are the closest contacts it knows.
    Closer(Vec<Contact>),
}

impl FindValueResponse {
    /// Contacts carried by the reply (empty for `Found`).
    pub fn contacts(&self) -> &[Contact] {
        match self {
            FindValueResponse::Found(_) => &[],
            FindValueResponse::Closer(contacts) => contacts,
        }
    }
}

/// Outbound RPC client.
///
/// Implementations return an error when the peer is unreachable. The core wraps
/// every call in its own timeout, so a hanging implementation cannot stall a
/// lookup beyond the configured per-RPC limit.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_VALUE RPC to retrieve a value or get closer contacts.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResponse>;

    /// Send a STORE RPC. `Ok` is the peer's acknowledgement.
    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()>;

    /// Ping a contact; `Ok` means alive.
    ///
    /// Used for the Kademlia "ping-before-evict" rule: when a bucket is full,
    /// the oldest contact is pinged before deciding whether to keep it or
    /// replace it with the new contact.
    async fn ping(&self, to: &Contact) -> Result<()>;
}

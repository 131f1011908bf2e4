//! # kadstore
//!
//! A Kademlia-style distributed content-addressed key/value store. Records are
//! keyed by the BLAKE3 hash of their value, placed on the `k` nodes whose IDs
//! are closest to the key under the XOR metric, and found again with iterative
//! lookups that close in on the key `α` RPCs at a time.
//!
//! The crate is transport-agnostic:
//!
//! - [`core`](crate::core): IDs, hashing, the XOR distance metric and [`Contact`].
//! - [`routing`]: the 256-bucket [`RoutingTable`] with ping-before-evict.
//! - [`store`]: the verified [`ContentStore`] and its [`RecordBackend`] seam.
//! - [`lookup`]: iterative FIND_NODE / FIND_VALUE via [`LookupCoordinator`].
//! - [`replication`]: closest-k placement via [`ReplicationManager`].
//! - [`node`]: [`DhtNode`], the caller API plus inbound RPC handlers.
//! - [`network`]: the [`DhtNetwork`] trait a transport implements.
//! - [`sim`]: an in-process network for simulations and tests.
//!
//! ## Getting started
//!
//! ```no_run
//! use kadstore::sim::{build_cluster, NetworkRegistry};
//! use kadstore::DhtConfig;
//!
//! # async fn demo() -> kadstore::Result<()> {
//! let registry = NetworkRegistry::new();
//! let nodes = build_cluster(&registry, 50, &DhtConfig::default()).await?;
//!
//! let key = nodes[3].put(b"hello".to_vec()).await?;
//! assert_eq!(nodes[41].get(&key).await?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` runs that experiment at scale and reports how
//! many reads came back wrong.

pub mod config;
pub mod core;
pub mod error;
pub mod lookup;
pub mod network;
pub mod node;
mod peers;
pub mod replication;
pub mod routing;
pub mod sim;
pub mod store;

pub use config::{DhtConfig, ALPHA_DEFAULT, K_DEFAULT, MAX_VALUE_SIZE};
pub use crate::core::{
    derive_node_id, hash_content, verify_key_value_pair, xor_distance, Contact, IdentityProvider,
    Key, NodeId, StaticIdentity,
};
pub use error::{DhtError, Result};
pub use lookup::{
    cancel_pair, CancelHandle, CancelToken, FoundValue, LookupCoordinator, LookupMode, LookupPhase,
    LookupResult,
};
pub use network::{DhtNetwork, FindValueResponse};
pub use node::{DhtNode, MaintenanceReport, TelemetrySnapshot};
pub use replication::{ReplicationManager, StoreReport};
pub use routing::{Bucket, RoutingTable};
pub use store::{ContentStore, MemoryBackend, RecordBackend};

//! Identifiers, hashing and the XOR distance metric.
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`derive_node_id`], [`hash_content`]
//! - **Distance Metric**: [`xor_distance`], [`distance_cmp`], [`bucket_index`]
//! - **Contacts**: [`Contact`] and the [`IdentityProvider`] seam

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases
// ============================================================================

/// Width of node IDs and keys in bytes.
pub const ID_BYTES: usize = 32;

/// Width of node IDs and keys in bits; also the number of routing buckets.
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 256-bit identifier for DHT nodes.
///
/// Node IDs are derived from the node's public key using BLAKE3 hashing,
/// ensuring a uniform distribution across the identifier space.
pub type NodeId = [u8; ID_BYTES];

/// A 256-bit content-addressed key for stored values.
///
/// Keys live in the same space as node IDs, so the node "owning" a key is simply
/// the node whose ID is XOR-closest to it.
pub type Key = [u8; ID_BYTES];

/// An XOR distance, read as a big-endian unsigned integer.
pub type Distance = [u8; ID_BYTES];

// ============================================================================
// Hashing Functions
// ============================================================================

fn blake3_digest(data: &[u8]) -> [u8; ID_BYTES] {
    *blake3::hash(data).as_bytes()
}

/// Derive a stable [`NodeId`] by hashing arbitrary input (typically a public key).
///
/// ```
/// use kadstore::derive_node_id;
///
/// let node_id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(node_id.len(), 32);
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

/// Compute the content-addressed key of a value.
///
/// ```
/// use kadstore::hash_content;
///
/// let key = hash_content(b"hello world");
/// assert_eq!(key, hash_content(b"hello world"));
/// ```
pub fn hash_content(data: &[u8]) -> Key {
    blake3_digest(data)
}

/// Check the record invariant `hash(value) == key`.
///
/// ```
/// use kadstore::{hash_content, verify_key_value_pair};
///
/// let key = hash_content(b"my data");
/// assert!(verify_key_value_pair(&key, b"my data"));
/// assert!(!verify_key_value_pair(&key, b"wrong data"));
/// ```
pub fn verify_key_value_pair(key: &Key, value: &[u8]) -> bool {
    hash_content(value) == *key
}

// ============================================================================
// Distance Metric
// ============================================================================

/// Compute the XOR distance between two IDs.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]`
/// - `xor_distance(a, b) == xor_distance(b, a)`
/// - ordering the result with [`distance_cmp`] gives the Kademlia notion of "closer"
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_BYTES];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Order two distances as 256-bit unsigned integers (smaller = closer).
///
/// Byte arrays compare lexicographically, which for big-endian integers is the
/// numeric order.
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

/// Order two IDs by their distance to `target`.
pub fn cmp_by_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&xor_distance(a, target), &xor_distance(b, target))
}

/// Number of leading zero bits in a distance, i.e. the shared prefix length.
///
/// Returns [`ID_BITS`] for the zero distance.
pub fn leading_zeros(distance: &Distance) -> usize {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

/// Bucket index of `other` in the routing table of `self_id`.
///
/// The index is the position of the first differing bit (0..=255). Bucket 0
/// holds the farthest half of the ID space, bucket 255 the nearest peers. An
/// identical ID falls back to the last bucket.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    leading_zeros(&xor_distance(self_id, other)).min(ID_BITS - 1)
}

/// Short hex rendering of an ID for log fields.
pub fn short_hex(id: &[u8; ID_BYTES]) -> String {
    hex::encode(&id[..8])
}

// ============================================================================
// Contacts & Identity
// ============================================================================

/// Another DHT node: its ID plus the opaque address the transport understands.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// The node's unique identifier.
    pub id: NodeId,
    /// Transport address; interpreted only by the [`crate::DhtNetwork`] implementation.
    pub addr: String,
}

impl Contact {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }

    /// Distance from this contact to `target`.
    pub fn distance_to(&self, target: &NodeId) -> Distance {
        xor_distance(&self.id, target)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", short_hex(&self.id), self.addr)
    }
}

/// Supplies the local node ID at startup. The ID never changes afterwards.
pub trait IdentityProvider {
    fn node_id(&self) -> NodeId;
}

/// An identity fixed at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticIdentity(pub NodeId);

impl StaticIdentity {
    /// Derive the identity from public key bytes.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(derive_node_id(public_key))
    }
}

impl IdentityProvider for StaticIdentity {
    fn node_id(&self) -> NodeId {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with(byte_idx: usize, value: u8) -> NodeId {
        let mut id = [0u8; ID_BYTES];
        id[byte_idx] = value;
        id
    }

    #[test]
    fn hash_content_is_deterministic() {
        let hash_one = hash_content(b"hello world");
        let hash_two = hash_content(b"hello world");
        assert_eq!(hash_one, hash_two, "hashes of identical data should match");
        assert_ne!(hash_one, hash_content(b"goodbye world"));
    }

    #[test]
    fn hash_content_matches_blake3_reference() {
        let expected = blake3::hash(b"hello world");
        assert_eq!(hash_content(b"hello world"), *expected.as_bytes());
    }

    #[test]
    fn verify_key_value_pair_rejects_flipped_key() {
        let key = hash_content(b"payload");
        assert!(verify_key_value_pair(&key, b"payload"));

        let mut wrong_key = key;
        wrong_key[0] ^= 0xFF;
        assert!(!verify_key_value_pair(&wrong_key, b"payload"));
    }

    #[test]
    fn xor_distance_produces_expected_value() {
        let a = id_with(0, 0b1010_1010);
        let b = id_with(0, 0b0101_0101);

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[0], 0b1111_1111);
        assert!(dist.iter().skip(1).all(|byte| *byte == 0));
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = derive_node_id(b"a");
        let b = derive_node_id(b"b");
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; ID_BYTES]);
    }

    #[test]
    fn distance_cmp_orders_as_big_endian_integers() {
        let smaller = id_with(1, 0xFF);
        let larger = id_with(0, 0x01);

        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
        assert_eq!(distance_cmp(&larger, &smaller), Ordering::Greater);
        assert_eq!(distance_cmp(&smaller, &smaller), Ordering::Equal);
    }

    #[test]
    fn xor_metric_satisfies_triangle_inequality_on_samples() {
        // d(a,c) = d(a,b) ^ d(b,c), and x ^ y <= x + y. Compare the top 128 bits.
        let ids: Vec<NodeId> = (0u8..16).map(|i| derive_node_id(&[i])).collect();
        for a in &ids {
            for b in &ids {
                for c in &ids {
                    let ab = u128::from_be_bytes(xor_distance(a, b)[..16].try_into().unwrap());
                    let bc = u128::from_be_bytes(xor_distance(b, c)[..16].try_into().unwrap());
                    let ac = u128::from_be_bytes(xor_distance(a, c)[..16].try_into().unwrap());
                    assert!(ac <= ab.saturating_add(bc));
                }
            }
        }
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        let self_id = [0u8; ID_BYTES];

        assert_eq!(bucket_index(&self_id, &id_with(0, 0b1000_0000)), 0);
        assert_eq!(bucket_index(&self_id, &id_with(1, 0b0001_0000)), 11);
        assert_eq!(bucket_index(&self_id, &id_with(31, 0b0000_0001)), 255);
        assert_eq!(bucket_index(&self_id, &self_id), 255);
    }

    #[test]
    fn static_identity_is_stable() {
        let identity = StaticIdentity::from_public_key(b"public key bytes");
        assert_eq!(identity.node_id(), derive_node_id(b"public key bytes"));
        assert_eq!(identity.node_id(), identity.node_id());
    }
}

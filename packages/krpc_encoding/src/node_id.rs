use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Error, ErrorKind};

/// Length in bytes of a [`NodeId`] (and, not coincidentally, of a BitTorrent
/// info-hash — the DHT routes both in the same 160-bit keyspace).
pub const NODE_ID_LEN: usize = 20;

/// A 160-bit Kademlia identifier.
///
/// `NodeId` is used both for node identities and (since the DHT keyspace and
/// the info-hash keyspace coincide) for info-hashes passed as lookup
/// targets. There is no sentinel "invalid" value; absence is represented by
/// `Option<NodeId>` at call sites.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Builds a `NodeId` from its raw big-endian byte representation.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> NodeId {
        NodeId(bytes)
    }

    /// Parses a `NodeId` from a 40 character hex string.
    pub fn from_hex(hex_str: &str) -> Result<NodeId, Error> {
        if hex_str.len() != NODE_ID_LEN * 2 {
            return Err(ErrorKind::InvalidNodeIdLength {
                len: hex_str.len(),
            }
            .into());
        }

        let decoded = hex::decode(hex_str).map_err(|_| ErrorKind::InvalidNodeIdHex)?;

        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(NodeId(bytes))
    }

    /// Generates a `NodeId` using the thread-local PRNG. Suitable for lookup
    /// targets and other non-identity-bearing uses.
    pub fn random() -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Generates a `NodeId` by reading directly from the OS entropy source.
    /// Used to mint the local node identity.
    pub fn secure_random() -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance between `self` and `other`, itself a `NodeId` per the
    /// Kademlia metric.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Common-prefix length between `self` and `other`: the number of
    /// leading zero bits of `distance(self, other)`, in `[0, 160]`.
    pub fn cpl(&self, other: &NodeId) -> u8 {
        let distance = self.distance(other);
        let mut count = 0u8;
        for byte in distance.0.iter() {
            if *byte == 0 {
                count += 8;
                continue;
            }
            count += byte.leading_zeros() as u8;
            break;
        }
        count
    }

    /// Whether bit `i` is set, where `i = 0` is the most significant bit of
    /// byte 0.
    pub fn is_bit_set(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        let shift = 7 - (i % 8);
        (byte >> shift) & 1 == 1
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(DeError::invalid_length(bytes.len(), &"20 bytes"));
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&bytes);
        Ok(NodeId(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_symmetry_and_identity() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), NodeId::from_bytes([0; NODE_ID_LEN]));
    }

    #[test]
    fn cpl_of_identical_ids_is_full() {
        let a = NodeId::random();
        assert_eq!(a.cpl(&a), 160);
    }

    #[test]
    fn cpl_examples() {
        let local = NodeId::from_bytes([0u8; NODE_ID_LEN]);

        let mut msb_set = [0u8; NODE_ID_LEN];
        msb_set[0] = 0x80;
        assert_eq!(local.cpl(&NodeId::from_bytes(msb_set)), 0);

        let mut second_bit = [0u8; NODE_ID_LEN];
        second_bit[0] = 0x40;
        assert_eq!(local.cpl(&NodeId::from_bytes(second_bit)), 1);
    }

    #[test]
    fn is_bit_set_msb_first() {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = 0b1000_0001;
        let id = NodeId::from_bytes(bytes);
        assert!(id.is_bit_set(0));
        assert!(!id.is_bit_set(1));
        assert!(id.is_bit_set(7));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(NodeId::from_hex("too_short").is_err());
        assert!(NodeId::from_hex(&"zz".repeat(20)).is_err());
        assert!(NodeId::from_hex(&"ab".repeat(20)).is_ok());
    }

    #[test]
    fn ord_is_big_endian_lexicographic() {
        let a = NodeId::from_bytes([0x01; NODE_ID_LEN]);
        let b = NodeId::from_bytes([0x02; NODE_ID_LEN]);
        assert!(a < b);
    }
}

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

const V4_PEER_LEN: usize = 4 + 2;
const V6_PEER_LEN: usize = 16 + 2;

pub fn encode_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(V6_PEER_LEN);
    match addr.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn decode_peer_v4(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != V4_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn decode_peer_v6(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != V6_PEER_LEN {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[0..16]);
    let ip = Ipv6Addr::from(octets);
    let port = u16::from_be_bytes([bytes[16], bytes[17]]);
    Some(SocketAddr::new(IpAddr::V6(ip), port))
}

/// Tries the 6-byte v4 form first, then the 18-byte v6 form.
pub fn decode_peer(bytes: &[u8]) -> Option<SocketAddr> {
    decode_peer_v4(bytes).or_else(|| decode_peer_v6(bytes))
}

/// `serde(with = ...)` helper for a `"values"` list of compact peer
/// records (6 bytes each for IPv4, 18 for IPv6 — BEP 5 only specifies the
/// 6-byte v4 form, but this node's `get_peers_response` decoder tolerates
/// both so it does not choke on a v6-capable peer's traffic).
pub mod compact_peers {
    use super::*;

    pub fn serialize<S: Serializer>(peers: &Vec<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(peers.len()))?;
        for peer in peers {
            seq.serialize_element(serde_bytes::Bytes::new(&encode_peer(peer)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error> {
        let raw: Vec<ByteBuf> = Vec::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|b| decode_peer_v4(&b).or_else(|| decode_peer_v6(&b)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_peer_round_trips() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let encoded = encode_peer(&addr);
        assert_eq!(encoded.len(), V4_PEER_LEN);
        assert_eq!(decode_peer_v4(&encoded), Some(addr));
    }

    #[test]
    fn v6_peer_round_trips() {
        let addr: SocketAddr = "[::1]:6881".parse().unwrap();
        let encoded = encode_peer(&addr);
        assert_eq!(encoded.len(), V6_PEER_LEN);
        assert_eq!(decode_peer_v6(&encoded), Some(addr));
    }
}

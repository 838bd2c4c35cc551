use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};

use crate::endpoint::Endpoint;
use crate::node_id::{NodeId, NODE_ID_LEN};

/// `(NodeId, Endpoint)` pair as exchanged in `find_node`/`get_peers`
/// responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeInfo {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl NodeInfo {
    pub fn new(id: NodeId, endpoint: Endpoint) -> NodeInfo {
        NodeInfo { id, endpoint }
    }
}

const V4_RECORD_LEN: usize = NODE_ID_LEN + 4 + 2;
const V6_RECORD_LEN: usize = NODE_ID_LEN + 16 + 2;

pub fn encode_v4(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * V4_RECORD_LEN);
    for node in nodes.iter().filter(|n| n.endpoint.is_v4()) {
        out.extend_from_slice(node.id.as_bytes());
        match node.endpoint.socket_addr().ip() {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(_) => unreachable!("filtered to v4 above"),
        }
        out.extend_from_slice(&node.endpoint.port().to_be_bytes());
    }
    out
}

pub fn decode_v4(bytes: &[u8]) -> Vec<NodeInfo> {
    bytes
        .chunks_exact(V4_RECORD_LEN)
        .filter_map(|chunk| {
            let mut id_bytes = [0u8; NODE_ID_LEN];
            id_bytes.copy_from_slice(&chunk[0..NODE_ID_LEN]);
            let id = NodeId::from_bytes(id_bytes);

            let ip = Ipv4Addr::new(
                chunk[NODE_ID_LEN],
                chunk[NODE_ID_LEN + 1],
                chunk[NODE_ID_LEN + 2],
                chunk[NODE_ID_LEN + 3],
            );
            let port = u16::from_be_bytes([chunk[NODE_ID_LEN + 4], chunk[NODE_ID_LEN + 5]]);

            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            Endpoint::new(addr).ok().map(|endpoint| NodeInfo { id, endpoint })
        })
        .collect()
}

pub fn encode_v6(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * V6_RECORD_LEN);
    for node in nodes.iter().filter(|n| n.endpoint.is_v6()) {
        out.extend_from_slice(node.id.as_bytes());
        match node.endpoint.socket_addr().ip() {
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
            IpAddr::V4(_) => unreachable!("filtered to v6 above"),
        }
        out.extend_from_slice(&node.endpoint.port().to_be_bytes());
    }
    out
}

pub fn decode_v6(bytes: &[u8]) -> Vec<NodeInfo> {
    bytes
        .chunks_exact(V6_RECORD_LEN)
        .filter_map(|chunk| {
            let mut id_bytes = [0u8; NODE_ID_LEN];
            id_bytes.copy_from_slice(&chunk[0..NODE_ID_LEN]);
            let id = NodeId::from_bytes(id_bytes);

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[NODE_ID_LEN..NODE_ID_LEN + 16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[NODE_ID_LEN + 16], chunk[NODE_ID_LEN + 17]]);

            let addr = SocketAddr::new(IpAddr::V6(ip), port);
            Endpoint::new(addr).ok().map(|endpoint| NodeInfo { id, endpoint })
        })
        .collect()
}

/// `serde(with = ...)` helper for the `"nodes"` key: compact IPv4 node info.
pub mod compact_nodes_v4 {
    use super::*;

    pub fn serialize<S: Serializer>(nodes: &Vec<NodeInfo>, serializer: S) -> Result<S::Ok, S::Error> {
        Bytes::new(&encode_v4(nodes)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<NodeInfo>, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        Ok(decode_v4(&bytes))
    }
}

/// `serde(with = ...)` helper for the `"nodes6"` key: compact IPv6 node
/// info, per the REDESIGN FLAGS requirement that both paths exist from the
/// start rather than being bolted on later.
pub mod compact_nodes_v6 {
    use super::*;

    pub fn serialize<S: Serializer>(nodes: &Vec<NodeInfo>, serializer: S) -> Result<S::Ok, S::Error> {
        Bytes::new(&encode_v6(nodes)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<NodeInfo>, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        Ok(decode_v6(&bytes))
    }
}

/// Splits a mixed-family node list into its `nodes` (v4) and `nodes6` (v6)
/// compact-encodable halves.
pub fn partition_by_family(nodes: &[NodeInfo]) -> (Vec<NodeInfo>, Vec<NodeInfo>) {
    let v4 = nodes.iter().filter(|n| n.endpoint.is_v4()).copied().collect();
    let v6 = nodes.iter().filter(|n| n.endpoint.is_v6()).copied().collect();
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_byte: u8, addr: &str) -> NodeInfo {
        NodeInfo::new(
            NodeId::from_bytes([id_byte; NODE_ID_LEN]),
            Endpoint::parse(addr.split(':').next().unwrap(), addr.split(':').nth(1).unwrap().parse().unwrap()).unwrap(),
        )
    }

    #[test]
    fn v4_round_trip_three_records() {
        let nodes = vec![
            node(1, "127.0.0.1:6881"),
            node(2, "127.0.0.2:6882"),
            node(3, "127.0.0.3:6883"),
        ];
        let encoded = encode_v4(&nodes);
        assert_eq!(encoded.len(), 3 * V4_RECORD_LEN);
        let decoded = decode_v4(&encoded);
        assert_eq!(decoded, nodes);
    }

    #[test]
    fn v6_round_trip() {
        let nodes = vec![NodeInfo::new(
            NodeId::from_bytes([9; NODE_ID_LEN]),
            Endpoint::parse("::1", 6881).unwrap(),
        )];
        let encoded = encode_v6(&nodes);
        assert_eq!(encoded.len(), V6_RECORD_LEN);
        assert_eq!(decode_v6(&encoded), nodes);
    }

    #[test]
    fn partition_separates_families() {
        let nodes = vec![
            node(1, "127.0.0.1:6881"),
            NodeInfo::new(NodeId::from_bytes([2; NODE_ID_LEN]), Endpoint::parse("::1", 6881).unwrap()),
        ];
        let (v4, v6) = partition_by_family(&nodes);
        assert_eq!(v4.len(), 1);
        assert_eq!(v6.len(), 1);
    }
}

use std::time::Instant;

use krpc_encoding::{Endpoint, NodeId};

/// Health classification the table and its caller maintain for a peer.
/// Promotion/demotion policy (what counts as "questionable", when a node
/// goes "bad") lives above this crate; `RoutingTable` only stores whatever
/// status it is told.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    Unknown,
    Good,
    Questionable,
    Bad,
}

/// A single entry in the routing table: an identity, its last known
/// endpoint, and the bookkeeping the table and its caller use to decide
/// whether to keep talking to it.
#[derive(Clone, Debug)]
pub struct DhtNode {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub status: NodeStatus,
    pub last_seen: Instant,
    pub last_rtt_ms: Option<u32>,
}

impl DhtNode {
    /// Creates a freshly observed node. `last_seen` starts at the moment of
    /// observation; callers that have an RTT sample should call
    /// `with_rtt_ms` immediately after.
    pub fn new(id: NodeId, endpoint: Endpoint) -> DhtNode {
        DhtNode {
            id,
            endpoint,
            status: NodeStatus::Unknown,
            last_seen: Instant::now(),
            last_rtt_ms: None,
        }
    }

    pub fn with_rtt_ms(mut self, rtt_ms: u32) -> DhtNode {
        self.last_rtt_ms = Some(rtt_ms);
        self
    }

    pub fn update_last_seen(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub fn record_rtt(&mut self, rtt_ms: u32) {
        self.last_rtt_ms = Some(rtt_ms);
    }
}

impl PartialEq for DhtNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for DhtNode {}

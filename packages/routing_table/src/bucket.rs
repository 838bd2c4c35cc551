use std::collections::VecDeque;
use std::time::Instant;

use krpc_encoding::NodeId;

use crate::node::DhtNode;

/// Maximum number of entries a single k-bucket holds (spec §4.4).
pub const K: usize = 8;

/// Up to `K` node entries that all share `prefix_len` bits of common prefix
/// with the local id. Ordered front-to-back by insertion/refresh recency:
/// front is oldest, back is most-recently-seen.
pub struct KBucket {
    prefix_len: u8,
    nodes: VecDeque<DhtNode>,
    last_updated: Instant,
}

impl KBucket {
    pub fn new(prefix_len: u8) -> KBucket {
        KBucket {
            prefix_len,
            nodes: VecDeque::with_capacity(K),
            last_updated: Instant::now(),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn find(&self, id: &NodeId) -> Option<&DhtNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Oldest entry: the eviction candidate when the bucket is full.
    pub fn front(&self) -> Option<&DhtNode> {
        self.nodes.front()
    }

    pub fn snapshot(&self) -> Vec<DhtNode> {
        self.nodes.iter().cloned().collect()
    }

    /// Appends `node` at the back. Rejects a duplicate id and rejects when
    /// full; splitting/eviction is the table's concern (§4.4).
    pub fn try_insert(&mut self, node: DhtNode) -> bool {
        if self.is_full() || self.contains(&node.id) {
            return false;
        }
        self.nodes.push_back(node);
        self.last_updated = Instant::now();
        true
    }

    /// Overwrites metadata for an already-present node and moves it to the
    /// back (most-recently-seen). Returns `false` if the node isn't here.
    pub fn update(&mut self, node: DhtNode) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(pos);
            self.nodes.push_back(node);
            self.last_updated = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<DhtNode> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        self.nodes.remove(pos)
    }

    /// Removes the oldest entry and appends `candidate`, used once the
    /// caller has confirmed the oldest entry failed to respond to a ping.
    pub fn evict_front_and_insert(&mut self, candidate: DhtNode) -> Option<DhtNode> {
        let evicted = self.nodes.pop_front();
        self.nodes.push_back(candidate);
        self.last_updated = Instant::now();
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::Endpoint;

    fn node(byte: u8) -> DhtNode {
        DhtNode::new(
            NodeId::from_bytes([byte; 20]),
            Endpoint::parse("127.0.0.1", 6881 + byte as u16).unwrap(),
        )
    }

    #[test]
    fn rejects_duplicate_and_respects_capacity() {
        let mut bucket = KBucket::new(0);
        for i in 0..K as u8 {
            assert!(bucket.try_insert(node(i)));
        }
        assert!(bucket.is_full());
        assert!(!bucket.try_insert(node(0)));
        assert!(!bucket.try_insert(node(200)));
    }

    #[test]
    fn update_moves_entry_to_back() {
        let mut bucket = KBucket::new(0);
        bucket.try_insert(node(1));
        bucket.try_insert(node(2));
        bucket.update(node(1));
        assert_eq!(bucket.front().unwrap().id, NodeId::from_bytes([2; 20]));
    }

    #[test]
    fn evict_front_replaces_oldest() {
        let mut bucket = KBucket::new(0);
        for i in 0..K as u8 {
            bucket.try_insert(node(i));
        }
        let evicted = bucket.evict_front_and_insert(node(99));
        assert_eq!(evicted.unwrap().id, NodeId::from_bytes([0; 20]));
        assert!(bucket.contains(&NodeId::from_bytes([99; 20])));
        assert_eq!(bucket.len(), K);
    }
}

use parking_lot::RwLock;

use krpc_encoding::NodeId;

use crate::bucket::{KBucket, K};
use crate::node::DhtNode;

/// Result of offering a freshly observed node to the table.
#[derive(Debug)]
pub enum InsertOutcome {
    /// A new entry was appended to its bucket.
    Inserted,
    /// An existing entry's metadata was refreshed and moved to the back.
    Updated,
    /// The candidate was the local id, or its target bucket rejected it
    /// outright (shouldn't happen outside `NeedsEvictionCheck`).
    Rejected,
    /// The candidate's bucket is full. The caller should ping `stale`
    /// (the bucket's oldest entry); on success call
    /// [`RoutingTable::keep_stale`], on timeout call
    /// [`RoutingTable::evict_and_insert`].
    NeedsEvictionCheck { stale: DhtNode, candidate: DhtNode },
}

/// A dense, growable vector of k-buckets indexed by common-prefix length
/// with `local_id`. `buckets[i].prefix_len() == i` always holds; the vector
/// starts with a single bucket at construction and grows on demand as
/// farther-out buckets are needed (§4.5).
///
/// Concurrency: an outer lock guards the vector's shape (its length); each
/// bucket carries its own lock over its contents. A reader that wants a
/// consistent snapshot (`closest_nodes`) takes the outer read lock, then
/// each bucket's read lock in turn — readers never block readers.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: RwLock<Vec<RwLock<KBucket>>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> RoutingTable {
        RoutingTable {
            local_id,
            buckets: RwLock::new(vec![RwLock::new(KBucket::new(0))]),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Bucket index for `id`: the common-prefix length with the local id.
    fn bucket_index(&self, id: &NodeId) -> u8 {
        self.local_id.cpl(id)
    }

    /// Grows the bucket vector, if needed, so that index `idx` exists.
    /// `idx` is in `[0, 160)` since `cpl` against a distinct id never
    /// reaches 160 (the caller rejects the local id before this point) —
    /// but the bound is still clamped defensively.
    fn ensure_bucket(&self, idx: usize) {
        let buckets = self.buckets.read();
        if idx < buckets.len() {
            return;
        }
        drop(buckets);

        let mut buckets = self.buckets.write();
        while buckets.len() <= idx {
            let prefix_len = buckets.len() as u8;
            buckets.push(RwLock::new(KBucket::new(prefix_len)));
        }
    }

    /// Offers a freshly observed node to the table. Rejects the local id
    /// outright; otherwise routes to `buckets[cpl(local_id, node.id)]`,
    /// growing the bucket vector if that index doesn't exist yet.
    pub fn add_node(&self, node: DhtNode) -> InsertOutcome {
        if node.id == self.local_id {
            return InsertOutcome::Rejected;
        }

        let idx = self.bucket_index(&node.id) as usize;
        self.ensure_bucket(idx);

        let buckets = self.buckets.read();
        let bucket_lock = &buckets[idx];
        let mut bucket = bucket_lock.write();

        if bucket.contains(&node.id) {
            bucket.update(node);
            return InsertOutcome::Updated;
        }

        if bucket.try_insert(node.clone()) {
            return InsertOutcome::Inserted;
        }

        // Bucket full: hand the decision (ping the oldest entry) to the
        // caller rather than blocking on network I/O under this lock.
        let stale = bucket
            .front()
            .cloned()
            .expect("is_full implies at least one entry");
        InsertOutcome::NeedsEvictionCheck { stale, candidate: node }
    }

    /// The oldest entry answered its ping: refresh it, discard the
    /// candidate that triggered the check.
    pub fn keep_stale(&self, stale_id: &NodeId) {
        let idx = self.bucket_index(stale_id) as usize;
        let buckets = self.buckets.read();
        if idx >= buckets.len() {
            return;
        }
        let mut bucket = buckets[idx].write();
        if let Some(mut existing) = bucket.remove(stale_id) {
            existing.update_last_seen();
            bucket.try_insert(existing);
        }
    }

    /// The oldest entry failed to respond: evict it and seat `candidate`.
    pub fn evict_and_insert(&self, stale_id: &NodeId, candidate: DhtNode) {
        let idx = self.bucket_index(&candidate.id) as usize;
        self.ensure_bucket(idx);
        let buckets = self.buckets.read();
        let mut bucket = buckets[idx].write();
        if bucket.find(stale_id).is_some() {
            bucket.evict_front_and_insert(candidate);
        } else {
            bucket.try_insert(candidate);
        }
    }

    pub fn remove(&self, id: &NodeId) {
        let idx = self.bucket_index(id) as usize;
        let buckets = self.buckets.read();
        if idx >= buckets.len() {
            return;
        }
        buckets[idx].write().remove(id);
    }

    pub fn find(&self, id: &NodeId) -> Option<DhtNode> {
        let idx = self.bucket_index(id) as usize;
        let buckets = self.buckets.read();
        buckets.get(idx).and_then(|b| b.read().find(id).cloned())
    }

    /// Total number of nodes across all buckets.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.read();
        buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every node currently held by the table (bounded by `160 * K`).
    pub fn snapshot(&self) -> Vec<DhtNode> {
        let buckets = self.buckets.read();
        let mut out = Vec::with_capacity(buckets.len() * K);
        for bucket in buckets.iter() {
            out.extend(bucket.read().snapshot());
        }
        out
    }

    /// The `k` nodes in the table closest to `target` by XOR distance,
    /// sorted ascending, ties broken by endpoint for determinism.
    pub fn closest_nodes(&self, target: &NodeId, k: usize) -> Vec<DhtNode> {
        let mut all = self.snapshot();
        all.sort_by(|a, b| {
            let da = a.id.distance(target);
            let db = b.id.distance(target);
            da.cmp(&db).then_with(|| a.endpoint.socket_addr().cmp(&b.endpoint.socket_addr()))
        });
        all.truncate(k);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::Endpoint;

    fn node(id_byte: u8, port: u16) -> DhtNode {
        DhtNode::new(NodeId::from_bytes([id_byte; 20]), Endpoint::parse("127.0.0.1", port).unwrap())
    }

    #[test]
    fn placement_by_common_prefix_length() {
        // Scenario 3 of spec §8.
        let local = NodeId::from_bytes([0u8; 20]);
        let table = RoutingTable::new(local);

        let mut high_bit = [0u8; 20];
        high_bit[0] = 0x80;
        let n1 = DhtNode::new(NodeId::from_bytes(high_bit), Endpoint::parse("127.0.0.1", 6881).unwrap());

        let mut second_bit = [0u8; 20];
        second_bit[0] = 0x40;
        let n2 = DhtNode::new(NodeId::from_bytes(second_bit), Endpoint::parse("127.0.0.1", 6882).unwrap());

        assert!(matches!(table.add_node(n1.clone()), InsertOutcome::Inserted));
        assert!(matches!(table.add_node(n2.clone()), InsertOutcome::Inserted));

        let mut target = [0u8; 20];
        target[0] = 0xC0;
        let closest = table.closest_nodes(&NodeId::from_bytes(target), 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, n1.id);
        assert_eq!(closest[1].id, n2.id);
    }

    #[test]
    fn local_id_is_never_inserted() {
        let local = NodeId::random();
        let table = RoutingTable::new(local);
        assert!(matches!(table.add_node(DhtNode::new(local, Endpoint::parse("127.0.0.1", 6881).unwrap())), InsertOutcome::Rejected));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn full_bucket_surfaces_eviction_check() {
        let local = NodeId::from_bytes([0u8; 20]);
        let table = RoutingTable::new(local);
        for i in 0..K as u8 {
            let mut id = [0u8; 20];
            id[0] = 0x80; // all share cpl(local) == 0
            id[19] = i + 1;
            table.add_node(DhtNode::new(NodeId::from_bytes(id), Endpoint::parse("127.0.0.1", 6881 + i as u16).unwrap()));
        }
        let mut extra = [0u8; 20];
        extra[0] = 0x80;
        extra[19] = 200;
        let outcome = table.add_node(DhtNode::new(NodeId::from_bytes(extra), Endpoint::parse("127.0.0.1", 6999).unwrap()));
        assert!(matches!(outcome, InsertOutcome::NeedsEvictionCheck { .. }));
    }

    #[test]
    fn cpl_invariant_holds_after_insertions() {
        let local = NodeId::random();
        let table = RoutingTable::new(local);
        for _ in 0..50 {
            table.add_node(DhtNode::new(NodeId::random(), Endpoint::parse("127.0.0.1", 6881).unwrap()));
        }
        for node in table.snapshot() {
            let idx = local.cpl(&node.id) as usize;
            let buckets = table.buckets.read();
            assert!(buckets[idx].read().find(&node.id).is_some());
        }
    }

    #[test]
    fn closest_k_never_dominated_by_unreturned_entry() {
        let local = NodeId::from_bytes([0u8; 20]);
        let table = RoutingTable::new(local);
        let mut ids = Vec::new();
        for i in 0..40u8 {
            let mut id = [0u8; 20];
            id[0] = i;
            id[19] = i;
            ids.push(NodeId::from_bytes(id));
            table.add_node(DhtNode::new(NodeId::from_bytes(id), Endpoint::parse("127.0.0.1", 6900 + i as u16).unwrap()));
        }
        let target = NodeId::from_bytes([0xAB; 20]);
        let k = 5;
        let closest = table.closest_nodes(&target, k);
        let returned_max = closest.iter().map(|n| n.id.distance(&target)).max().unwrap();
        for id in &ids {
            if closest.iter().any(|n| n.id == *id) {
                continue;
            }
            assert!(returned_max <= id.distance(&target));
        }
    }
}

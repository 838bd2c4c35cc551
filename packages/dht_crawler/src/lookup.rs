//! The iterative α-parallel, K-bounded lookup engine (C8). Drives
//! `find_node` or `get_peers` queries against progressively closer nodes
//! until the K closest known entries have all answered (or failed) and no
//! closer candidate remains unqueried, or until the overall deadline
//! elapses.
//!
//! A `Lookup` never touches the routing table directly beyond the initial
//! seed: candidates discovered along the way are kept in the lookup's own
//! frontier and are only handed to `RoutingTable` once the owning session
//! has actually exchanged a message with them (via
//! [`tokio_krpc::InboundHandler::observe`]), matching real Kademlia
//! practice of not trusting third-party node reports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::Notify;

use krpc_encoding::{Endpoint, NodeId, NodeInfo, Token};
use routing_table::DhtNode;
use tokio_krpc::RequestTransport;

use crate::config::DhtConfig;

/// A node entry will not be retried a third time; after `MAX_TIMEOUTS`
/// failures it is considered dead for the rest of this lookup (§4.8).
const MAX_TIMEOUTS: u8 = 2;

/// A shared, cloneable cancellation switch for a single `Lookup`. The owning
/// session keeps one of these per in-flight lookup so it can cancel it from
/// outside `run()`'s task (on `Dht::stop`/`Drop`) without needing a handle to
/// the `Lookup` itself, which has already been moved into `run()`.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    fn new() -> CancelHandle {
        CancelHandle { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    /// Sets the cancelled flag and wakes any task parked in `cancelled()`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Returns immediately if it
    /// already was, so a call racing with `cancel()`'s `notify_waiters()`
    /// never misses the signal for more than one `run()` loop iteration.
    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EntryState {
    Unknown,
    Queried,
    Responded,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    FindNode,
    GetPeers,
}

struct NodeLookupEntry {
    node: DhtNode,
    state: EntryState,
    timeouts: u8,
    distance: NodeId,
    token: Option<Token>,
}

/// What a `find_node`/`get_peers` lookup produced.
pub struct LookupOutcome {
    /// The K closest nodes that answered, ascending by distance to the
    /// target (padded with unqueried candidates if fewer than K answered
    /// before the deadline).
    pub nodes: Vec<DhtNode>,
    /// Peers harvested from `get_peers` responses carrying `values`. Empty
    /// for a `find_node` lookup.
    pub peers: Vec<Endpoint>,
    /// `(node id, endpoint, token)` for every node that answered with a
    /// token, so `announce_peer` can use the right token per destination.
    pub tokens: Vec<(NodeId, Endpoint, Token)>,
}

struct QueryResult {
    nodes: Vec<NodeInfo>,
    values: Vec<SocketAddr>,
    token: Option<Token>,
}

/// Drives a single iterative lookup to completion. Constructed fresh for
/// every `find_nodes`/`get_peers`/`announce_peer` call; not reused.
pub struct Lookup {
    local_id: NodeId,
    target: NodeId,
    mode: Mode,
    entries: Vec<NodeLookupEntry>,
    k: usize,
    alpha: usize,
    query_timeout: Duration,
    deadline: Instant,
    peers: Vec<Endpoint>,
    transport: RequestTransport,
    cancel: CancelHandle,
}

impl Lookup {
    pub fn find_node(
        local_id: NodeId,
        target: NodeId,
        seeds: Vec<DhtNode>,
        transport: RequestTransport,
        config: &DhtConfig,
    ) -> Lookup {
        Lookup::new(local_id, target, Mode::FindNode, seeds, transport, config)
    }

    pub fn get_peers(
        local_id: NodeId,
        info_hash: NodeId,
        seeds: Vec<DhtNode>,
        transport: RequestTransport,
        config: &DhtConfig,
    ) -> Lookup {
        Lookup::new(local_id, info_hash, Mode::GetPeers, seeds, transport, config)
    }

    fn new(
        local_id: NodeId,
        target: NodeId,
        mode: Mode,
        seeds: Vec<DhtNode>,
        transport: RequestTransport,
        config: &DhtConfig,
    ) -> Lookup {
        let mut entries: Vec<NodeLookupEntry> = seeds
            .into_iter()
            .filter(|node| node.id != local_id)
            .map(|node| {
                let distance = node.id.distance(&target);
                NodeLookupEntry { node, state: EntryState::Unknown, timeouts: 0, distance, token: None }
            })
            .collect();
        entries.sort_by(|a, b| a.distance.cmp(&b.distance));

        Lookup {
            local_id,
            target,
            mode,
            entries,
            k: config.k,
            alpha: config.alpha,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
            deadline: Instant::now() + Duration::from_millis(config.lookup_deadline_ms),
            peers: Vec::new(),
            transport,
            cancel: CancelHandle::new(),
        }
    }

    /// A clone of this lookup's cancellation switch, for the owning session
    /// to register before handing the lookup itself off to `run()`.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels this lookup: `run()` stops issuing new queries and returns on
    /// its next loop iteration with whatever it has resolved so far. Queries
    /// already in flight are dropped along with `pending`, which drops their
    /// `PendingTransaction` handles and clears them from the transaction
    /// registry (`PendingTransaction`'s own `Drop` impl).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs the lookup to completion (step 1: empty seed set terminates
    /// immediately with an empty result; see §4.8 for the rest).
    pub async fn run(mut self) -> LookupOutcome {
        if self.entries.is_empty() || self.cancel.is_cancelled() {
            return LookupOutcome { nodes: Vec::new(), peers: Vec::new(), tokens: Vec::new() };
        }

        let mut pending: FuturesUnordered<BoxFuture<'static, (NodeId, Result<QueryResult, tokio_krpc::Error>)>> =
            FuturesUnordered::new();
        let mut active = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            while active < self.alpha && !self.converged() {
                match self.pick_next_unqueried() {
                    Some(idx) => {
                        self.entries[idx].state = EntryState::Queried;
                        let node = self.entries[idx].node.clone();
                        pending.push(self.issue_query(node));
                        active += 1;
                    }
                    None => break,
                }
            }

            if active == 0 {
                break;
            }

            let now = Instant::now();
            if now >= self.deadline {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.deadline - now) => break,
                _ = self.cancel.cancelled() => break,
                outcome = pending.next() => {
                    active -= 1;
                    if let Some((id, result)) = outcome {
                        self.apply_result(id, result);
                    }
                }
            }

            if self.converged() {
                break;
            }
        }

        self.finish()
    }

    fn issue_query(&self, node: DhtNode) -> BoxFuture<'static, (NodeId, Result<QueryResult, tokio_krpc::Error>)> {
        let transport = self.transport.clone();
        let local_id = self.local_id;
        let target = self.target;
        let timeout = self.query_timeout;
        let mode = self.mode;
        let to = node.endpoint;
        let id = node.id;
        async move {
            let result = match mode {
                Mode::FindNode => transport
                    .find_node(local_id, to, target, timeout)
                    .await
                    .map(|r| QueryResult { nodes: r.nodes, values: Vec::new(), token: None }),
                Mode::GetPeers => transport
                    .get_peers(local_id, to, target, timeout)
                    .await
                    .map(|r| QueryResult { nodes: r.nodes, values: r.values, token: r.token }),
            };
            (id, result)
        }
        .boxed()
    }

    fn apply_result(&mut self, id: NodeId, result: Result<QueryResult, tokio_krpc::Error>) {
        let idx = match self.entries.iter().position(|e| e.node.id == id) {
            Some(idx) => idx,
            None => return,
        };
        match result {
            Ok(outcome) => {
                self.entries[idx].state = EntryState::Responded;
                self.entries[idx].token = outcome.token;
                for addr in outcome.values {
                    if let Ok(endpoint) = Endpoint::new(addr) {
                        if !self.peers.contains(&endpoint) {
                            self.peers.push(endpoint);
                        }
                    }
                }
                self.merge_nodes(outcome.nodes);
            }
            Err(_) => {
                let entry = &mut self.entries[idx];
                entry.timeouts += 1;
                entry.state =
                    if entry.timeouts >= MAX_TIMEOUTS { EntryState::Failed } else { EntryState::Unknown };
            }
        }
    }

    /// Dedups by id, rejects the local id; leaves endpoint validation to
    /// `NodeInfo`'s decoder, which already refuses to construct an entry
    /// for a malformed compact record.
    fn merge_nodes(&mut self, nodes: Vec<NodeInfo>) {
        let mut changed = false;
        for info in nodes {
            if info.id == self.local_id {
                continue;
            }
            if self.entries.iter().any(|e| e.node.id == info.id) {
                continue;
            }
            let distance = info.id.distance(&self.target);
            self.entries.push(NodeLookupEntry {
                node: DhtNode::new(info.id, info.endpoint),
                state: EntryState::Unknown,
                timeouts: 0,
                distance,
                token: None,
            });
            changed = true;
        }
        if changed {
            self.entries.sort_by(|a, b| a.distance.cmp(&b.distance));
        }
    }

    /// The closest entry (by distance, since `entries` is kept sorted)
    /// that hasn't been queried yet and still has a timeout budget left.
    fn pick_next_unqueried(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.state == EntryState::Unknown && e.timeouts < MAX_TIMEOUTS)
    }

    /// §4.8 step 5: the K closest entries are all resolved (Responded or
    /// permanently Failed) and no still-live Unknown entry is closer than
    /// the furthest of those K.
    fn converged(&self) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let k = self.k.min(self.entries.len());
        let closest_k = &self.entries[..k];
        let all_resolved =
            closest_k.iter().all(|e| matches!(e.state, EntryState::Responded | EntryState::Failed));
        if !all_resolved {
            return false;
        }
        let boundary = closest_k.last().expect("k > 0 checked above").distance;
        !self.entries.iter().any(|e| e.state == EntryState::Unknown && e.distance < boundary)
    }

    /// §4.8 step 6: K closest `Responded` entries, padded with the closest
    /// `Unknown` entries if the deadline cut the lookup short.
    fn finish(self) -> LookupOutcome {
        let mut nodes: Vec<DhtNode> = Vec::new();
        let mut tokens = Vec::new();
        for entry in &self.entries {
            if entry.state == EntryState::Responded {
                nodes.push(entry.node.clone());
                if let Some(token) = &entry.token {
                    tokens.push((entry.node.id, entry.node.endpoint, token.clone()));
                }
            }
        }
        if nodes.len() < self.k {
            for entry in &self.entries {
                if entry.state == EntryState::Unknown {
                    nodes.push(entry.node.clone());
                    if nodes.len() >= self.k {
                        break;
                    }
                }
            }
        }
        nodes.truncate(self.k);
        LookupOutcome { nodes, peers: self.peers, tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8, port: u16) -> DhtNode {
        DhtNode::new(NodeId::from_bytes([byte; 20]), Endpoint::parse("127.0.0.1", port).unwrap())
    }

    /// These tests only exercise pure bookkeeping (`merge_nodes`,
    /// `converged`, `pick_next_unqueried`, `finish`) and never drive
    /// `issue_query`/`run`, but a `RequestTransport` still needs a live
    /// tokio `UdpSocket` to construct, hence `#[tokio::test]`.
    async fn lookup_with_seeds(seeds: Vec<DhtNode>) -> Lookup {
        let socket = std::sync::Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transport = RequestTransport::new(socket, tokio_krpc::ActiveTransactions::new());
        let config = DhtConfig::default();
        Lookup::new(
            NodeId::from_bytes([0u8; 20]),
            NodeId::from_bytes([0xFFu8; 20]),
            Mode::FindNode,
            seeds,
            transport,
            &config,
        )
    }

    #[tokio::test]
    async fn empty_seed_set_is_immediately_converged() {
        let lookup = lookup_with_seeds(Vec::new()).await;
        assert!(lookup.converged());
    }

    #[tokio::test]
    async fn pick_next_unqueried_returns_closest_first() {
        let lookup = lookup_with_seeds(vec![node(0x80, 6881), node(0x40, 6882)]).await;
        // distance(0x00.., 0x40..) < distance(0x00.., 0x80..), so the 0x40
        // entry sorts first and should be picked first.
        let idx = lookup.pick_next_unqueried().unwrap();
        assert_eq!(lookup.entries[idx].node.id, NodeId::from_bytes([0x40; 20]));
    }

    #[tokio::test]
    async fn merge_nodes_dedups_and_rejects_local_id() {
        let mut lookup = lookup_with_seeds(vec![node(1, 6881)]).await;
        let local = lookup.local_id;
        lookup.merge_nodes(vec![
            NodeInfo::new(local, Endpoint::parse("127.0.0.1", 9999).unwrap()),
            NodeInfo::new(NodeId::from_bytes([1; 20]), Endpoint::parse("127.0.0.1", 6881).unwrap()),
            NodeInfo::new(NodeId::from_bytes([2; 20]), Endpoint::parse("127.0.0.1", 6882).unwrap()),
        ]);
        assert_eq!(lookup.entries.len(), 2);
        assert!(lookup.entries.iter().all(|e| e.node.id != local));
    }

    #[tokio::test]
    async fn convergence_requires_k_closest_resolved() {
        let mut lookup = lookup_with_seeds(vec![node(1, 6881), node(2, 6882)]).await;
        lookup.k = 2;
        assert!(!lookup.converged());
        lookup.entries[0].state = EntryState::Responded;
        assert!(!lookup.converged());
        lookup.entries[1].state = EntryState::Failed;
        assert!(lookup.converged());
    }

    #[tokio::test]
    async fn convergence_blocked_by_closer_unknown_entry() {
        let mut lookup = lookup_with_seeds(vec![node(1, 6881)]).await;
        lookup.k = 1;
        lookup.entries[0].state = EntryState::Responded;
        assert!(lookup.converged());

        // id 0xFE..FE is closer to target 0xFF..FF than the seed (0x01..01)
        // is: XOR distance 0x01..01 versus 0xFE..FE, and 0x01 < 0xFE
        // lexicographically. Discovering it reopens the frontier.
        let closer_id = NodeId::from_bytes([0xFE; 20]);
        lookup.merge_nodes(vec![NodeInfo::new(closer_id, Endpoint::parse("127.0.0.1", 7001).unwrap())]);
        assert!(!lookup.converged());
    }

    #[tokio::test]
    async fn cancelling_before_run_returns_immediately_with_empty_outcome() {
        // A seed that will never answer (nothing is listening on it); left
        // to run on its own this would burn the full lookup deadline.
        let mut lookup = lookup_with_seeds(vec![node(1, 6881)]).await;
        lookup.deadline = Instant::now() + Duration::from_secs(30);
        lookup.cancel();
        let outcome = lookup.run().await;
        assert!(outcome.nodes.is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_run_unblocks_before_the_deadline() {
        let mut lookup = lookup_with_seeds(vec![node(1, 6881)]).await;
        lookup.deadline = Instant::now() + Duration::from_secs(30);
        let cancel = lookup.cancel_handle();
        let started = Instant::now();
        let handle = tokio::spawn(lookup.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn finish_pads_with_unknown_when_deadline_cuts_lookup_short() {
        let mut lookup = lookup_with_seeds(vec![node(1, 6881), node(2, 6882), node(3, 6883)]).await;
        lookup.k = 3;
        lookup.entries[0].state = EntryState::Responded;
        let outcome = lookup.finish();
        assert_eq!(outcome.nodes.len(), 3);
        assert_eq!(outcome.nodes[0].id, NodeId::from_bytes([1; 20]));
    }
}

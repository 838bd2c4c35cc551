//! C10: the UDP session. Owns the bound socket (via `tokio_krpc::KRPCNode`),
//! the routing table, and the token manager; answers inbound queries inline
//! and drives outbound lookups to completion on behalf of the application.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use krpc_encoding::{Endpoint, FamilyPreference, NodeId, NodeInfo, Query, Response};
use routing_table::{DhtNode, InsertOutcome, RoutingTable};
use tokio_krpc::{InboundHandler, KRPCNode, QueryOutcome, RequestTransport};

use crate::bootstrap;
use crate::config::DhtConfig;
use crate::errors::{Error, ErrorKind};
use crate::lookup::{CancelHandle, Lookup};
use crate::token::{DhtToken, TokenManager};

type InfoHashCallback = Box<dyn Fn(NodeId) + Send + Sync>;

/// Everything the inbound side needs; held behind `Arc` so eviction checks
/// and the `on_info_hash` callback can be driven from spawned tasks without
/// the receive loop blocking on them.
struct Inner {
    local_id: NodeId,
    routing_table: Arc<RoutingTable>,
    tokens: TokenManager,
    transport: RequestTransport,
    config: DhtConfig,
    on_info_hash: RwLock<Option<InfoHashCallback>>,
    /// Every lookup currently running on behalf of this session, keyed by a
    /// locally-assigned id. `Dht::stop`/`Drop` cancels every entry here
    /// before tearing down the receive loop (§5: "dropping the Session
    /// cancels all lookups ... and joins workers").
    lookups: Mutex<HashMap<u64, CancelHandle>>,
    next_lookup_id: AtomicU64,
}

impl Inner {
    fn fire_info_hash(&self, info_hash: NodeId) {
        let guard = self.on_info_hash.read();
        let callback = match guard.as_ref() {
            Some(c) => c,
            None => return,
        };
        // §5: "panics in callbacks must be caught at the receive-loop
        // boundary and logged; they must not tear down the session."
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(info_hash))).is_err() {
            log::error!("on_info_hash callback panicked for info-hash {}", info_hash);
        }
    }

    fn register_lookup(&self, cancel: CancelHandle) -> u64 {
        let id = self.next_lookup_id.fetch_add(1, Ordering::Relaxed);
        self.lookups.lock().insert(id, cancel);
        id
    }

    fn unregister_lookup(&self, id: u64) {
        self.lookups.lock().remove(&id);
    }

    /// Cancels every lookup currently registered, draining the map so a
    /// lookup that is mid-teardown doesn't get cancelled twice.
    fn cancel_all_lookups(&self) {
        for (_, cancel) in self.lookups.lock().drain() {
            cancel.cancel();
        }
    }
}

impl InboundHandler for Inner {
    fn handle_query(&self, query: Query, sender: Endpoint) -> QueryOutcome {
        match query {
            Query::Ping { .. } => QueryOutcome::Reply(Response::ping(self.local_id)),

            Query::FindNode { target, .. } => {
                let nodes = to_node_info(self.routing_table.closest_nodes(&target, self.config.k));
                QueryOutcome::Reply(Response::find_node(self.local_id, nodes))
            }

            Query::GetPeers { info_hash, .. } => {
                self.fire_info_hash(info_hash);
                let token = self.tokens.generate(sender);
                // This node never tracks peer sets for info-hashes itself,
                // so a get_peers reply always carries `nodes`, never `values`.
                let nodes = to_node_info(self.routing_table.closest_nodes(&info_hash, self.config.k));
                QueryOutcome::Reply(Response::get_peers_with_nodes(self.local_id, token.as_bytes().to_vec(), nodes))
            }

            Query::AnnouncePeer { info_hash, token, .. } => {
                let parsed = DhtToken::from_bytes(&token);
                let valid = parsed.map(|t| self.tokens.verify(&t, sender)).unwrap_or(false);
                if !valid {
                    return QueryOutcome::Error(krpc_encoding::KrpcError::bad_token());
                }
                self.fire_info_hash(info_hash);
                QueryOutcome::Reply(Response::announce_peer(self.local_id))
            }
        }
    }

    fn observe(&self, id: NodeId, sender: Endpoint) {
        if id == self.local_id {
            return;
        }
        let outcome = self.routing_table.add_node(DhtNode::new(id, sender));
        if let InsertOutcome::NeedsEvictionCheck { stale, candidate } = outcome {
            let routing_table = self.routing_table.clone();
            let transport = self.transport.clone();
            let timeout = Duration::from_millis(self.config.query_timeout_ms);
            let local_id = self.local_id;
            tokio::spawn(async move {
                match transport.ping(local_id, stale.endpoint, timeout).await {
                    Ok(_) => routing_table.keep_stale(&stale.id),
                    Err(_) => routing_table.evict_and_insert(&stale.id, candidate),
                }
            });
        }
    }
}

fn to_node_info(nodes: Vec<DhtNode>) -> Vec<NodeInfo> {
    nodes.into_iter().map(|n| NodeInfo::new(n.id, n.endpoint)).collect()
}

/// The running DHT node. Construct with [`Dht::new`] (binds the socket and
/// starts the receive loop), then call [`Dht::start`] once to bootstrap the
/// routing table before issuing lookups.
pub struct Dht {
    inner: Arc<Inner>,
    node: KRPCNode,
    receive_loop: JoinHandle<()>,
    started: AtomicBool,
}

impl Dht {
    pub async fn new(config: DhtConfig) -> Result<Dht, Error> {
        let local_id = config.node_id.unwrap_or_else(NodeId::secure_random);
        let bind_addr = format!("0.0.0.0:{}", config.bind_port);
        let addr = bind_addr
            .parse()
            .map_err(|_| ErrorKind::BindFailed { cause: "invalid bind address".to_string() })?;

        let node = KRPCNode::bind(addr)
            .await
            .map_err(|e| ErrorKind::BindFailed { cause: e.to_string() })?;

        let inner = Arc::new(Inner {
            local_id,
            routing_table: Arc::new(RoutingTable::new(local_id)),
            tokens: TokenManager::new(Duration::from_secs(config.token_rotation_s)),
            transport: node.request_transport(),
            config,
            on_info_hash: RwLock::new(None),
            lookups: Mutex::new(HashMap::new()),
            next_lookup_id: AtomicU64::new(0),
        });

        let receive_loop = node.spawn_receive_loop(inner.clone() as Arc<dyn InboundHandler>);

        Ok(Dht { inner, node, receive_loop, started: AtomicBool::new(false) })
    }

    /// Resolves the configured bootstrap endpoints and seeds the routing
    /// table (C9). May only be called once per session.
    pub async fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::AlreadyRunning.into());
        }

        let mut seeds = Vec::with_capacity(self.inner.config.bootstrap_endpoints.len());
        for (host, port) in &self.inner.config.bootstrap_endpoints {
            match Endpoint::resolve(host, *port, FamilyPreference::Either) {
                Ok(endpoint) => seeds.push(endpoint),
                Err(e) => log::warn!("failed to resolve bootstrap endpoint {}:{}: {}", host, port, e),
            }
        }

        bootstrap::bootstrap(
            self.inner.local_id,
            seeds,
            &self.inner.routing_table,
            self.inner.transport.clone(),
            &self.inner.config,
        )
        .await
    }

    /// Cancels every in-flight lookup and stops the receive loop. The bound
    /// socket is dropped along with this `Dht` once every clone of it (held
    /// by in-flight lookups) is gone.
    pub fn stop(&self) {
        self.inner.cancel_all_lookups();
        self.receive_loop.abort();
    }

    pub async fn find_nodes(&self, target: NodeId) -> Vec<DhtNode> {
        run_find_nodes(self.inner.clone(), target).await
    }

    /// Non-blocking variant of [`Dht::find_nodes`]: spawns the lookup on the
    /// runtime and returns a handle the caller can await (or drop) whenever
    /// it chooses, without tying up the calling task.
    pub fn find_nodes_async(&self, target: NodeId) -> JoinHandle<Vec<DhtNode>> {
        let inner = self.inner.clone();
        tokio::spawn(async move { run_find_nodes(inner, target).await })
    }

    pub async fn get_peers(&self, info_hash: NodeId) -> Vec<Endpoint> {
        run_get_peers(self.inner.clone(), info_hash).await
    }

    /// Non-blocking variant of [`Dht::get_peers`].
    pub fn get_peers_async(&self, info_hash: NodeId) -> JoinHandle<Vec<Endpoint>> {
        let inner = self.inner.clone();
        tokio::spawn(async move { run_get_peers(inner, info_hash).await })
    }

    /// Looks up the K nodes closest to `info_hash`, then announces to each
    /// using the token it handed back in the `get_peers` reply (standard
    /// BEP 5 two-step). Succeeds if at least one destination accepted the
    /// announce.
    pub async fn announce_peer(&self, info_hash: NodeId, port: u16) -> Result<(), Error> {
        run_announce_peer(self.inner.clone(), info_hash, port).await
    }

    /// Non-blocking variant of [`Dht::announce_peer`].
    pub fn announce_peer_async(&self, info_hash: NodeId, port: u16) -> JoinHandle<Result<(), Error>> {
        let inner = self.inner.clone();
        tokio::spawn(async move { run_announce_peer(inner, info_hash, port).await })
    }

    /// Registers the harvesting callback invoked whenever a `get_peers` or
    /// `announce_peer` query is received (§5: called synchronously from the
    /// receive loop; MUST NOT block). Replaces any previously set callback.
    pub fn set_on_info_hash<F>(&self, callback: F)
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        *self.inner.on_info_hash.write() = Some(Box::new(callback));
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn routing_table_snapshot(&self) -> Vec<DhtNode> {
        self.inner.routing_table.snapshot()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.node.local_addr().map_err(|e| ErrorKind::SocketError { cause: e.to_string() }.into())
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.inner.cancel_all_lookups();
        self.receive_loop.abort();
    }
}

/// Shared body of `find_nodes`/`find_nodes_async`: builds the lookup,
/// registers its cancel handle with the session for the duration of the
/// run, and always deregisters it again, whether it converged, hit its
/// deadline, or was cancelled out from under it.
async fn run_find_nodes(inner: Arc<Inner>, target: NodeId) -> Vec<DhtNode> {
    let seeds = inner.routing_table.closest_nodes(&target, inner.config.k);
    let lookup = Lookup::find_node(inner.local_id, target, seeds, inner.transport.clone(), &inner.config);
    let id = inner.register_lookup(lookup.cancel_handle());
    let outcome = lookup.run().await;
    inner.unregister_lookup(id);
    outcome.nodes
}

async fn run_get_peers(inner: Arc<Inner>, info_hash: NodeId) -> Vec<Endpoint> {
    let seeds = inner.routing_table.closest_nodes(&info_hash, inner.config.k);
    let lookup = Lookup::get_peers(inner.local_id, info_hash, seeds, inner.transport.clone(), &inner.config);
    let id = inner.register_lookup(lookup.cancel_handle());
    let outcome = lookup.run().await;
    inner.unregister_lookup(id);
    outcome.peers
}

async fn run_announce_peer(inner: Arc<Inner>, info_hash: NodeId, port: u16) -> Result<(), Error> {
    let seeds = inner.routing_table.closest_nodes(&info_hash, inner.config.k);
    let lookup = Lookup::get_peers(inner.local_id, info_hash, seeds, inner.transport.clone(), &inner.config);
    let id = inner.register_lookup(lookup.cancel_handle());
    let outcome = lookup.run().await;
    inner.unregister_lookup(id);

    let timeout = Duration::from_millis(inner.config.query_timeout_ms);
    let mut successes = 0usize;
    for (_, endpoint, token) in outcome.tokens {
        let result =
            inner.transport.announce_peer(inner.local_id, endpoint, info_hash, port, token, false, timeout).await;
        match result {
            Ok(_) => successes += 1,
            Err(e) => log::debug!("announce_peer to {} failed: {}", endpoint, e),
        }
    }

    if successes == 0 {
        return Err(ErrorKind::AnnounceFailed { cause: "no destination accepted the announce".to_string() }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> DhtConfig {
        let mut config = DhtConfig::default();
        config.bind_port = 0;
        config.query_timeout_ms = 200;
        config.lookup_deadline_ms = 1000;
        config
    }

    #[tokio::test]
    async fn ping_between_two_local_nodes_populates_both_tables() {
        let a = Dht::new(loopback_config()).await.unwrap();
        let b = Dht::new(loopback_config()).await.unwrap();
        // `local_addr()` reports the 0.0.0.0 wildcard a socket was bound to,
        // which `Endpoint` rejects as a destination; loopback with the same
        // port is the real address another local process reaches it at.
        let endpoint = Endpoint::parse("127.0.0.1", b.local_addr().unwrap().port()).unwrap();

        let transport = a.inner.transport.clone();
        let response = transport.ping(a.local_id(), endpoint, Duration::from_millis(200)).await.unwrap();
        assert_eq!(response.responder_id, b.local_id());

        // give the receive loops a moment to run `observe` on both sides
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.routing_table_snapshot().iter().any(|n| n.id == b.local_id()));
        assert!(b.routing_table_snapshot().iter().any(|n| n.id == a.local_id()));
    }

    #[tokio::test]
    async fn find_node_returns_closest_known_nodes() {
        let a = Dht::new(loopback_config()).await.unwrap();
        let b = Dht::new(loopback_config()).await.unwrap();
        let endpoint = Endpoint::parse("127.0.0.1", b.local_addr().unwrap().port()).unwrap();

        // seed a's table with b directly, bypassing bootstrap
        a.inner.routing_table.add_node(DhtNode::new(b.local_id(), endpoint));

        let target = NodeId::random();
        let found = a.find_nodes(target).await;
        assert!(found.iter().any(|n| n.id == b.local_id()));
    }

    #[tokio::test]
    async fn announce_with_bad_token_is_rejected_and_does_not_fire_callback() {
        // Scenario 6 of spec §8.
        let node = Dht::new(loopback_config()).await.unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_clone = seen.clone();
        node.set_on_info_hash(move |_| {
            seen_clone.store(true, Ordering::SeqCst);
        });

        let sender_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transactions = tokio_krpc::ActiveTransactions::new();
        let sender_transport = RequestTransport::new(sender_socket, transactions);

        let info_hash = NodeId::random();
        let bad_token: krpc_encoding::Token = vec![0xFFu8; 20];
        let node_addr = Endpoint::parse("127.0.0.1", node.local_addr().unwrap().port()).unwrap();
        let result = sender_transport
            .announce_peer(NodeId::random(), node_addr, info_hash, 6881, bad_token, false, Duration::from_millis(200))
            .await;

        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn find_nodes_async_returns_the_same_result_as_the_blocking_call() {
        let a = Dht::new(loopback_config()).await.unwrap();
        let b = Dht::new(loopback_config()).await.unwrap();
        let endpoint = Endpoint::parse("127.0.0.1", b.local_addr().unwrap().port()).unwrap();
        a.inner.routing_table.add_node(DhtNode::new(b.local_id(), endpoint));

        let target = NodeId::random();
        let found = a.find_nodes_async(target).await.unwrap();
        assert!(found.iter().any(|n| n.id == b.local_id()));
    }

    #[tokio::test]
    async fn stop_cancels_an_in_flight_lookup_instead_of_waiting_out_its_deadline() {
        let mut config = loopback_config();
        config.lookup_deadline_ms = 30_000;
        let node = Dht::new(config).await.unwrap();
        // A seed nothing is listening on, so the lookup would otherwise run
        // for the full 30s deadline.
        node.inner.routing_table.add_node(DhtNode::new(NodeId::random(), Endpoint::parse("127.0.0.1", 1).unwrap()));

        let handle = node.find_nodes_async(NodeId::random());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        node.stop();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use krpc_encoding::{decode, encode, DecodeFailureKind, Endpoint, Envelope, KrpcError, MessageKind, NodeId, Query};

use crate::errors::{Error, ErrorKind};
use crate::send::RequestTransport;
use crate::transaction::ActiveTransactions;

/// Datagrams larger than this are dropped unread (§4.10).
pub const MAX_DATAGRAM: usize = 1500;

/// What a query produced: either a reply to send back, or nothing (the
/// handler already replied itself, e.g. `ping`'s trivial ack can be built
/// without extra state). In this design the handler always produces one of
/// the two outcomes below.
pub enum QueryOutcome {
    Reply(krpc_encoding::Response),
    Error(KrpcError),
}

/// Injected by the owning `Dht` session to answer inbound traffic. Kept
/// synchronous: every operation it needs (routing table lookups, token
/// generation) is a plain lock acquisition, never a network wait, matching
/// §5's "callbacks MUST NOT block" requirement for `on_info_hash`.
pub trait InboundHandler: Send + Sync {
    /// A query arrived from `sender`. Produce the reply to send back.
    fn handle_query(&self, query: Query, sender: Endpoint) -> QueryOutcome;

    /// Any node observed on the wire (querier or responder) is offered to
    /// the routing table here.
    fn observe(&self, id: NodeId, sender: Endpoint);
}

/// Counters exposed for observability; incremented by the receive loop.
#[derive(Default)]
pub struct Counters {
    pub oversized_dropped: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub unmatched_responses: AtomicU64,
}

/// Owns the UDP socket (C10's transport half): the single reader of the
/// socket runs in [`KRPCNode::spawn_receive_loop`]; outbound sends happen
/// either from that loop (replies) or from a [`RequestTransport`] clone
/// used by lookups — both go through the same underlying socket, which
/// tolerates concurrent `send_to` calls.
pub struct KRPCNode {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
    pub counters: Arc<Counters>,
}

impl KRPCNode {
    pub async fn bind(addr: SocketAddr) -> Result<KRPCNode, Error> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ErrorKind::BindFailed { port: addr.port(), cause: e.to_string() })?;
        Ok(KRPCNode {
            socket: Arc::new(socket),
            transactions: ActiveTransactions::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket
            .local_addr()
            .map_err(|e| ErrorKind::BindFailed { port: 0, cause: e.to_string() }.into())
    }

    pub fn request_transport(&self) -> RequestTransport {
        RequestTransport::new(self.socket.clone(), self.transactions.clone())
    }

    /// Spawns the single receive-loop task. Dropping the returned handle's
    /// corresponding socket (i.e. dropping `KRPCNode`) does not itself stop
    /// the loop; the caller cancels it (typically by aborting the
    /// `JoinHandle`) when the session shuts down.
    pub fn spawn_receive_loop(&self, handler: Arc<dyn InboundHandler>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let transactions = self.transactions.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM + 1];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("udp recv error: {}", e);
                        continue;
                    }
                };
                if len > MAX_DATAGRAM {
                    counters.oversized_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let sender = match Endpoint::new(from) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                dispatch(&buf[..len], sender, &socket, &transactions, &handler, &counters).await;
            }
        })
    }
}

async fn dispatch(
    bytes: &[u8],
    sender: Endpoint,
    socket: &UdpSocket,
    transactions: &ActiveTransactions,
    handler: &Arc<dyn InboundHandler>,
    counters: &Counters,
) {
    let envelope = match decode(bytes) {
        Ok(e) => e,
        Err(failure) => {
            counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(tid) = failure.tid {
                let error = match failure.kind {
                    DecodeFailureKind::UnknownMethod => KrpcError::method_unknown(),
                    DecodeFailureKind::Malformed => KrpcError::protocol("Protocol Error"),
                };
                let reply = Envelope::error(tid, error);
                send_reply(socket, sender, &reply).await;
            }
            return;
        }
    };

    match envelope.kind.clone() {
        MessageKind::Query(query) => {
            handler.observe(query.sender_id(), sender);
            let outcome = handler.handle_query(query, sender);
            let reply = match outcome {
                QueryOutcome::Reply(response) => Envelope::response(envelope.tid, response),
                QueryOutcome::Error(err) => Envelope::error(envelope.tid, err),
            };
            send_reply(socket, sender, &reply).await;
        }
        MessageKind::Response(response) => {
            let tid = envelope.tid.clone();
            let responder = response.id;
            // Only offer the responder to the routing table once `complete`
            // has confirmed this reply actually matches a pending,
            // endpoint-verified transaction — a spoofed or stale reply must
            // never reach the routing table (§4.10).
            if transactions.complete(&tid, sender, envelope) {
                handler.observe(responder, sender);
            } else {
                counters.unmatched_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
        MessageKind::Error(_) => {
            let tid = envelope.tid.clone();
            if !transactions.complete(&tid, sender, envelope) {
                counters.unmatched_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn send_reply(socket: &UdpSocket, to: Endpoint, envelope: &Envelope) {
    match encode(envelope) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, to.socket_addr()).await {
                log::warn!("failed to send reply to {}: {}", to, e);
            }
        }
        Err(e) => log::warn!("failed to encode reply to {}: {}", to, e),
    }
}

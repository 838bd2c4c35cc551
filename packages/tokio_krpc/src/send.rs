use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;

use krpc_encoding::{
    encode, AnnouncePeerResponse, Endpoint, Envelope, FindNodeResponse, GetPeersResponse,
    MessageKind, NodeId, PingResponse, Query, Response, Token, Txid,
};

use crate::errors::{Error, ErrorKind};
use crate::transaction::ActiveTransactions;

const TID_LEN: usize = 2;
const MAX_REGISTER_ATTEMPTS: u32 = 8;

fn random_tid() -> Txid {
    let mut bytes = [0u8; TID_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.to_vec()
}

/// Typed `ping`/`find_node`/`get_peers`/`announce_peer` query helpers used
/// by both the `Dht` session and `Lookup`. Each call mints a fresh
/// transaction id, registers it, sends the encoded query, and awaits the
/// matching response with a caller-supplied deadline.
///
/// Cheap to clone: the socket and transaction registry are both shared via
/// `Arc`, so every concurrent lookup step gets its own handle.
#[derive(Clone)]
pub struct RequestTransport {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
}

impl RequestTransport {
    pub fn new(socket: Arc<UdpSocket>, transactions: ActiveTransactions) -> RequestTransport {
        RequestTransport { socket, transactions }
    }

    async fn request(&self, to: Endpoint, query: Query, timeout: Duration) -> Result<Envelope, Error> {
        let mut last_err = None;
        for _ in 0..MAX_REGISTER_ATTEMPTS {
            let tid = random_tid();
            match self.transactions.register(tid.clone(), to) {
                Ok(pending) => {
                    let envelope = Envelope::query(tid, query);
                    let bytes = encode(&envelope).map_err(|e| ErrorKind::EncodeFailed { cause: e.to_string() })?;
                    self.send_raw(to.socket_addr(), &bytes).await?;
                    return pending.wait(timeout).await;
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::TransactionIdExhausted { attempts: MAX_REGISTER_ATTEMPTS }.into()))
    }

    async fn send_raw(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), Error> {
        self.socket
            .send_to(bytes, to)
            .await
            .map(|_| ())
            .map_err(|e| ErrorKind::SendFailed { to: to.to_string(), cause: e.to_string() }.into())
    }

    pub async fn ping(&self, local_id: NodeId, to: Endpoint, timeout: Duration) -> Result<PingResponse, Error> {
        let envelope = self.request(to, Query::Ping { id: local_id }, timeout).await?;
        into_response(envelope).map(PingResponse::from)
    }

    pub async fn find_node(
        &self,
        local_id: NodeId,
        to: Endpoint,
        target: NodeId,
        timeout: Duration,
    ) -> Result<FindNodeResponse, Error> {
        let envelope = self.request(to, Query::FindNode { id: local_id, target }, timeout).await?;
        into_response(envelope).map(FindNodeResponse::from)
    }

    pub async fn get_peers(
        &self,
        local_id: NodeId,
        to: Endpoint,
        info_hash: NodeId,
        timeout: Duration,
    ) -> Result<GetPeersResponse, Error> {
        let envelope = self.request(to, Query::GetPeers { id: local_id, info_hash }, timeout).await?;
        into_response(envelope).map(GetPeersResponse::from)
    }

    pub async fn announce_peer(
        &self,
        local_id: NodeId,
        to: Endpoint,
        info_hash: NodeId,
        port: u16,
        token: Token,
        implied_port: bool,
        timeout: Duration,
    ) -> Result<AnnouncePeerResponse, Error> {
        let query = Query::AnnouncePeer { id: local_id, info_hash, port, token, implied_port };
        let envelope = self.request(to, query, timeout).await?;
        into_response(envelope).map(AnnouncePeerResponse::from)
    }
}

fn into_response(envelope: Envelope) -> Result<Response, Error> {
    match envelope.kind {
        MessageKind::Response(r) => Ok(r),
        MessageKind::Error(e) => Err(ErrorKind::RemoteError { code: e.code, message: e.message }.into()),
        MessageKind::Query(_) => Err(ErrorKind::UnexpectedReply.into()),
    }
}

//! The KRPC wire codec (C3): bencoded dictionaries in, typed DHT messages
//! out. The wire shapes (`Query`, the response variants, the envelope
//! itself) are `#[derive(Serialize, Deserialize)]` types tagged the way
//! `serde_bencode` expects — `#[serde(tag = "y")]` for the query/response/
//! error split, `#[serde(tag = "q", content = "a")]` for the query method,
//! `#[serde(untagged)]` for the response shape, since which fields a
//! response carries depends on which query it answers and serde picks the
//! first variant that parses. A response/query that fails to parse this way
//! still needs its `"t"` salvaged for an error reply, so `decode` makes one
//! extra pass over a generic `Value` first: that pass also enforces the
//! nesting-depth bound and lets us tell "unknown method" apart from other
//! malformed input before the strict typed parse ever runs.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bencode::value::Value;

use crate::errors::ErrorKind;
use crate::node_id::NodeId;
use crate::node_info::{self, NodeInfo};
use crate::peer_info;

pub type Txid = Vec<u8>;
pub type Token = Vec<u8>;

/// Bencode has no boolean; BEP 43's `"ro"` and `announce_peer`'s
/// `"implied_port"` are wire integers 0/1. Encode goes through `bool`'s own
/// `Serialize` (which `serde_bencode` maps onto an integer); only the
/// decode direction needs help turning that integer back into a `bool`.
fn deserialize_int_as_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = i64::deserialize(deserializer)?;
    Ok(value != 0)
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A fully decoded KRPC envelope: the `"t"`/`"y"`/`"v"` fields common to
/// every message, plus the payload keyed by `"y"`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub tid: Txid,
    pub kind: MessageKind,
    pub version: Option<Vec<u8>>,
    /// BEP 42 security-extension field: the querier's external address as
    /// seen by the responder, carried on response envelopes. Decoded when
    /// present but never set by this node's own encoder — this node does
    /// not implement BEP 42 node-id verification, only passes the field
    /// through undamaged when relaying/round-tripping real traffic.
    pub ip: Option<SocketAddr>,
    /// BEP 43 read-only DHT node flag (a top-level `"ro"` key, not nested
    /// under `"a"`). Decoded when present; never set on encode, since this
    /// node always answers queries rather than running read-only.
    pub read_only: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Query(Query),
    Response(Response),
    Error(KrpcError),
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    #[serde(rename = "ping")]
    Ping { id: NodeId },
    #[serde(rename = "find_node")]
    FindNode { id: NodeId, target: NodeId },
    #[serde(rename = "get_peers")]
    GetPeers { id: NodeId, info_hash: NodeId },
    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        port: u16,
        #[serde(with = "serde_bytes")]
        token: Token,
        #[serde(default, deserialize_with = "deserialize_int_as_bool")]
        implied_port: bool,
    },
}

impl Query {
    pub fn sender_id(&self) -> NodeId {
        match *self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => id,
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// The wire shape of a `"r"` dictionary: serde tries each variant in
/// order and keeps the first that parses, so the more specific shapes
/// (carrying `nodes`/`values`) come before the catch-all `OnlyId`. This
/// relies on `encode_response` always emitting `"nodes"` (even empty) for
/// any response built from `nodes`, so a bare `{id}` ack can never be
/// mistaken for one.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(untagged)]
enum ResponseWire {
    NextHop {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
        token: Option<Token>,
        #[serde(with = "node_info::compact_nodes_v4")]
        nodes: Vec<NodeInfo>,
        #[serde(default, rename = "nodes6", skip_serializing_if = "Vec::is_empty", with = "node_info::compact_nodes_v6")]
        nodes6: Vec<NodeInfo>,
    },
    GetPeersValues {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
        token: Option<Token>,
        #[serde(rename = "values", with = "peer_info::compact_peers")]
        values: Vec<SocketAddr>,
    },
    OnlyId {
        id: NodeId,
    },
}

impl From<ResponseWire> for Response {
    fn from(wire: ResponseWire) -> Self {
        match wire {
            ResponseWire::NextHop { id, token, nodes, nodes6 } => {
                let mut all = nodes;
                all.extend(nodes6);
                Response { id, token, nodes: Some(all), values: None }
            }
            ResponseWire::GetPeersValues { id, token, values } => {
                Response { id, token, nodes: None, values: Some(values) }
            }
            ResponseWire::OnlyId { id } => Response { id, token: None, nodes: None, values: None },
        }
    }
}

impl From<Response> for ResponseWire {
    fn from(response: Response) -> Self {
        match (response.nodes, response.values) {
            (Some(nodes), _) => {
                let (v4, v6) = node_info::partition_by_family(&nodes);
                ResponseWire::NextHop { id: response.id, token: response.token, nodes: v4, nodes6: v6 }
            }
            (None, Some(values)) => ResponseWire::GetPeersValues { id: response.id, token: response.token, values },
            (None, None) => ResponseWire::OnlyId { id: response.id },
        }
    }
}

/// The generic shape of a `"r"` dictionary. Which fields are meaningful
/// depends on which query this answers — see the `From` impls below that
/// narrow this into the typed responses of spec §3. This is the type the
/// rest of the workspace builds and matches on; [`ResponseWire`] is purely
/// the on-the-wire encoding of it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub id: NodeId,
    pub token: Option<Token>,
    pub nodes: Option<Vec<NodeInfo>>,
    pub values: Option<Vec<SocketAddr>>,
}

/// `{code, message}`, wire-encoded as the two-element list BEP 5 specifies
/// rather than a dict — a hand-written `Serialize`/`Deserialize` pair
/// instead of a derive, since no bencode-native "tuple struct as list with
/// named field access" shape exists.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub fn generic() -> KrpcError {
        KrpcError { code: 201, message: "Generic Error".to_string() }
    }
    pub fn server() -> KrpcError {
        KrpcError { code: 202, message: "Server Error".to_string() }
    }
    pub fn protocol(message: &str) -> KrpcError {
        KrpcError { code: 203, message: message.to_string() }
    }
    pub fn bad_token() -> KrpcError {
        KrpcError { code: 203, message: "Bad token".to_string() }
    }
    pub fn method_unknown() -> KrpcError {
        KrpcError { code: 204, message: "Method Unknown".to_string() }
    }
}

impl Serialize for KrpcError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.code)?;
        tuple.serialize_element(&self.message)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for KrpcError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (code, message) = <(i64, String)>::deserialize(deserializer)?;
        Ok(KrpcError { code, message })
    }
}

// --- typed responses (spec §3's DhtMessage response variants) ----------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PingResponse {
    pub responder_id: NodeId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindNodeResponse {
    pub responder_id: NodeId,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetPeersResponse {
    pub responder_id: NodeId,
    pub token: Option<Token>,
    pub nodes: Vec<NodeInfo>,
    pub values: Vec<SocketAddr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnnouncePeerResponse {
    pub responder_id: NodeId,
}

impl From<Response> for PingResponse {
    fn from(r: Response) -> Self {
        PingResponse { responder_id: r.id }
    }
}

impl From<Response> for AnnouncePeerResponse {
    fn from(r: Response) -> Self {
        AnnouncePeerResponse { responder_id: r.id }
    }
}

impl From<Response> for FindNodeResponse {
    fn from(r: Response) -> Self {
        FindNodeResponse {
            responder_id: r.id,
            nodes: r.nodes.unwrap_or_default(),
        }
    }
}

impl From<Response> for GetPeersResponse {
    fn from(r: Response) -> Self {
        GetPeersResponse {
            responder_id: r.id,
            token: r.token,
            nodes: r.nodes.unwrap_or_default(),
            values: r.values.unwrap_or_default(),
        }
    }
}

impl Response {
    pub fn ping(id: NodeId) -> Response {
        Response { id, token: None, nodes: None, values: None }
    }

    pub fn find_node(id: NodeId, nodes: Vec<NodeInfo>) -> Response {
        Response { id, token: None, nodes: Some(nodes), values: None }
    }

    pub fn get_peers_with_nodes(id: NodeId, token: Token, nodes: Vec<NodeInfo>) -> Response {
        Response { id, token: Some(token), nodes: Some(nodes), values: None }
    }

    pub fn get_peers_with_values(id: NodeId, token: Token, values: Vec<SocketAddr>) -> Response {
        Response { id, token: Some(token), nodes: None, values: Some(values) }
    }

    pub fn announce_peer(id: NodeId) -> Response {
        Response { id, token: None, nodes: None, values: None }
    }
}

// --- envelope constructors ------------------------------------------------

impl Envelope {
    pub fn query(tid: Txid, query: Query) -> Envelope {
        Envelope { tid, kind: MessageKind::Query(query), version: None, ip: None, read_only: false }
    }

    pub fn response(tid: Txid, response: Response) -> Envelope {
        Envelope { tid, kind: MessageKind::Response(response), version: None, ip: None, read_only: false }
    }

    pub fn error(tid: Txid, error: KrpcError) -> Envelope {
        Envelope { tid, kind: MessageKind::Error(error), version: None, ip: None, read_only: false }
    }
}

/// `serde(with = ...)` helper for the envelope's optional compact `"ip"`
/// field (BEP 42).
mod compact_addr {
    use super::*;

    pub fn serialize<S: Serializer>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => serde_bytes::Bytes::new(&peer_info::encode_peer(addr)).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SocketAddr>, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Ok(peer_info::decode_peer(&bytes))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "y")]
enum WirePayload {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },
    #[serde(rename = "r")]
    Response { r: ResponseWire },
    #[serde(rename = "e")]
    Error { e: KrpcError },
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
struct WireEnvelope {
    #[serde(rename = "t", with = "serde_bytes")]
    t: Txid,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    v: Option<Vec<u8>>,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none", with = "compact_addr")]
    ip: Option<SocketAddr>,
    #[serde(flatten)]
    payload: WirePayload,
    #[serde(rename = "ro", default, skip_serializing_if = "is_false", deserialize_with = "deserialize_int_as_bool")]
    ro: bool,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let kind = match wire.payload {
            WirePayload::Query { query } => MessageKind::Query(query),
            WirePayload::Response { r } => MessageKind::Response(r.into()),
            WirePayload::Error { e } => MessageKind::Error(e),
        };
        Envelope { tid: wire.t, kind, version: wire.v, ip: wire.ip, read_only: wire.ro }
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        let payload = match &envelope.kind {
            MessageKind::Query(query) => WirePayload::Query { query: query.clone() },
            MessageKind::Response(response) => WirePayload::Response { r: response.clone().into() },
            MessageKind::Error(error) => WirePayload::Error { e: error.clone() },
        };
        WireEnvelope {
            t: envelope.tid.clone(),
            v: envelope.version.clone(),
            ip: envelope.ip,
            payload,
            ro: envelope.read_only,
        }
    }
}

/// Why a decode failed, so `dispatch()` (in `tokio_krpc`) can pick the
/// right wire error: `UnknownMethod` gets KRPC error 204, everything else
/// gets the generic 203 (§4.3/§7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeFailureKind {
    UnknownMethod,
    Malformed,
}

/// A decode failure that, when the transaction id could be salvaged,
/// carries enough information for the caller to send back a protocol
/// error (§7: "Respond with `Error{203, ...}` if `tid` is recoverable,
/// else drop").
#[derive(Debug)]
pub struct DecodeFailure {
    pub tid: Option<Txid>,
    pub kind: DecodeFailureKind,
    pub cause: failure::Error,
}

/// Bound on dictionary/list nesting enforced before any typed decode is
/// attempted (§4.3: "must bound recursion depth (recommended: reject
/// nesting > 64)"). This is a property of the codec, not of whatever the
/// underlying bencode crate happens to tolerate.
const MAX_DECODE_DEPTH: usize = 64;

fn check_depth(value: &Value, depth: usize) -> Result<(), failure::Error> {
    if depth > MAX_DECODE_DEPTH {
        return Err(ErrorKind::DecodeError { cause: "bencode nesting exceeds maximum depth".to_string() }.into());
    }
    match value {
        Value::Dict(entries) => {
            for nested in entries.values() {
                check_depth(nested, depth + 1)?;
            }
            Ok(())
        }
        Value::List(items) => {
            for nested in items {
                check_depth(nested, depth + 1)?;
            }
            Ok(())
        }
        Value::Bytes(_) | Value::Int(_) => Ok(()),
    }
}

const KNOWN_METHODS: [&[u8]; 4] = [b"ping", b"find_node", b"get_peers", b"announce_peer"];

pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeFailure> {
    let probe = serde_bencode::from_bytes::<Value>(bytes).map_err(|e| DecodeFailure {
        tid: None,
        kind: DecodeFailureKind::Malformed,
        cause: ErrorKind::DecodeError { cause: e.to_string() }.into(),
    })?;

    let probe_tid = as_dict(&probe).and_then(|d| d.get(b"t".as_slice())).and_then(as_bytes).map(|b| b.to_vec());

    check_depth(&probe, 0).map_err(|cause| DecodeFailure { tid: probe_tid.clone(), kind: DecodeFailureKind::Malformed, cause })?;

    let dict = as_dict(&probe).ok_or_else(|| DecodeFailure {
        tid: probe_tid.clone(),
        kind: DecodeFailureKind::Malformed,
        cause: ErrorKind::DecodeError { cause: "top level bencode value is not a dictionary".to_string() }.into(),
    })?;

    let is_unknown_method = dict.get(b"y".as_slice()).and_then(as_bytes) == Some(b"q".as_slice())
        && dict
            .get(b"q".as_slice())
            .and_then(as_bytes)
            .map(|method| !KNOWN_METHODS.contains(&method))
            .unwrap_or(false);

    serde_bencode::from_bytes::<WireEnvelope>(bytes)
        .map(Envelope::from)
        .map_err(|e| DecodeFailure {
            tid: probe_tid,
            kind: if is_unknown_method { DecodeFailureKind::UnknownMethod } else { DecodeFailureKind::Malformed },
            cause: ErrorKind::DecodeError { cause: e.to_string() }.into(),
        })
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, failure::Error> {
    let wire: WireEnvelope = envelope.into();
    serde_bencode::to_bytes(&wire).map_err(|e| ErrorKind::EncodeError { cause: e.to_string() }.into())
}

fn as_dict(value: &Value) -> Option<&BTreeMap<Vec<u8>, Value>> {
    match value {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

fn as_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

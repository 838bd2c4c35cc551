//! Identifiers, endpoints, and the bencoded KRPC wire format shared by the
//! routing table and the transport layer.

mod endpoint;
mod errors;
mod message;
mod node_id;
mod node_info;
mod peer_info;

pub use endpoint::{Endpoint, FamilyPreference};
pub use errors::{Error, ErrorKind, Result};
pub use message::{
    decode, encode, AnnouncePeerResponse, DecodeFailure, DecodeFailureKind, Envelope,
    FindNodeResponse, GetPeersResponse, KrpcError, MessageKind, PingResponse, Query, Response,
    Token, Txid,
};
pub use node_id::{NodeId, NODE_ID_LEN};
pub use node_info::NodeInfo;
pub use peer_info::{decode_peer, encode_peer};

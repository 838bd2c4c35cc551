//! The passive Mainline DHT crawler core: a Kademlia-style node that joins
//! the network, answers queries, drives iterative lookups, and harvests
//! info-hashes from passing `get_peers`/`announce_peer` traffic.
//!
//! Wire codec, identifiers, and routing table live in their own crates
//! (`krpc_encoding`, `routing_table`, `tokio_krpc`); this crate assembles
//! them into the token manager (C6), lookup engine (C8), bootstrap
//! procedure (C9), and the `Dht` session (C10) applications drive.

mod bootstrap;
mod config;
mod dht;
mod errors;
mod lookup;
mod token;

pub use config::DhtConfig;
pub use dht::Dht;
pub use errors::{Error, ErrorKind, Result};
pub use lookup::LookupOutcome;
pub use token::{DhtToken, TokenManager};

pub use krpc_encoding::{Endpoint, NodeId};
pub use routing_table::DhtNode;

//! The Kademlia routing table (C4/C5): k-buckets keyed by common-prefix
//! length with the local node id, plus closest-k selection. Synchronous and
//! network-free — eviction decisions that require pinging a stale node are
//! surfaced to the caller via [`InsertOutcome::NeedsEvictionCheck`] rather
//! than performed here.

mod bucket;
mod node;
mod table;

pub use bucket::{KBucket, K};
pub use node::{DhtNode, NodeStatus};
pub use table::{InsertOutcome, RoutingTable};

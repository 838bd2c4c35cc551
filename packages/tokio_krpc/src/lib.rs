//! The UDP transport (C10's socket half) and per-query transaction
//! tracking (C7). A single receive loop owns the socket; outbound queries
//! go through [`send::RequestTransport`], matched back to their waiter by
//! [`transaction::ActiveTransactions`].

mod errors;
mod node;
mod send;
mod transaction;

pub use errors::{Error, ErrorKind, Result};
pub use node::{Counters, InboundHandler, KRPCNode, QueryOutcome, MAX_DATAGRAM};
pub use send::RequestTransport;
pub use transaction::{ActiveTransactions, PendingTransaction};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use krpc_encoding::{Endpoint, Envelope, Txid};

use crate::errors::{Error, ErrorKind};

struct PendingEntry {
    sender: oneshot::Sender<Envelope>,
    expected: Endpoint,
}

/// C7: maps outstanding transaction ids to the query awaiting a response.
/// An entry's TTL is enforced by the caller wrapping [`PendingTransaction::wait`]
/// in its own deadline; dropping a `PendingTransaction` without it resolving
/// (cancellation, caller-side timeout) removes the entry here too.
#[derive(Clone)]
pub struct ActiveTransactions {
    inner: Arc<Mutex<HashMap<Txid, PendingEntry>>>,
}

impl ActiveTransactions {
    pub fn new() -> ActiveTransactions {
        ActiveTransactions { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Registers a fresh transaction id, rejecting a collision so the
    /// caller can regenerate (spec §4.7: "regenerating on conflict").
    pub fn register(&self, tid: Txid, expected: Endpoint) -> Result<PendingTransaction, Error> {
        let mut map = self.inner.lock();
        if map.contains_key(&tid) {
            return Err(ErrorKind::DuplicateTransaction.into());
        }
        let (sender, receiver) = oneshot::channel();
        map.insert(tid.clone(), PendingEntry { sender, expected });
        Ok(PendingTransaction { tid, transactions: self.clone(), receiver: Some(receiver) })
    }

    /// Delivers a response or error envelope to whoever registered `tid`,
    /// provided it arrived from the endpoint the query was sent to.
    /// Returns `false` when the transaction is unknown (stale/spoofed
    /// reply, dropped silently by the caller) or the sender mismatches.
    pub fn complete(&self, tid: &Txid, from: Endpoint, envelope: Envelope) -> bool {
        let mut map = self.inner.lock();
        match map.get(tid) {
            Some(entry) if entry.expected == from => {}
            _ => return false,
        }
        let entry = map.remove(tid).expect("checked above");
        entry.sender.send(envelope).is_ok()
    }

    pub fn cancel(&self, tid: &Txid) {
        self.inner.lock().remove(tid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A single in-flight query's registration. Resolves when a matching
/// response/error envelope is delivered via [`ActiveTransactions::complete`],
/// or when `wait`'s deadline elapses.
pub struct PendingTransaction {
    tid: Txid,
    transactions: ActiveTransactions,
    receiver: Option<oneshot::Receiver<Envelope>>,
}

impl PendingTransaction {
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, Error> {
        let receiver = self.receiver.take().expect("wait called exactly once");
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(ErrorKind::Cancelled.into()),
            Err(_) => Err(ErrorKind::Timeout.into()),
        }
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        self.transactions.cancel(&self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::{Envelope, KrpcError};

    fn endpoint() -> Endpoint {
        Endpoint::parse("127.0.0.1", 6881).unwrap()
    }

    #[tokio::test]
    async fn complete_delivers_to_matching_registration() {
        let transactions = ActiveTransactions::new();
        let pending = transactions.register(b"aa".to_vec(), endpoint()).unwrap();
        let envelope = Envelope::error(b"aa".to_vec(), KrpcError::generic());
        assert!(transactions.complete(&b"aa".to_vec(), endpoint(), envelope.clone()));
        let received = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn complete_rejects_endpoint_mismatch() {
        let transactions = ActiveTransactions::new();
        let pending = transactions.register(b"bb".to_vec(), endpoint()).unwrap();
        let other = Endpoint::parse("127.0.0.2", 6881).unwrap();
        let envelope = Envelope::error(b"bb".to_vec(), KrpcError::generic());
        assert!(!transactions.complete(&b"bb".to_vec(), other, envelope));
        assert_eq!(transactions.len(), 1);
        drop(pending);
        assert_eq!(transactions.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let transactions = ActiveTransactions::new();
        let _first = transactions.register(b"cc".to_vec(), endpoint()).unwrap();
        assert!(transactions.register(b"cc".to_vec(), endpoint()).is_err());
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_arrives() {
        let transactions = ActiveTransactions::new();
        let pending = transactions.register(b"dd".to_vec(), endpoint()).unwrap();
        let result = pending.wait(Duration::from_millis(20)).await;
        assert!(result.is_err());
        assert_eq!(transactions.len(), 0);
    }
}

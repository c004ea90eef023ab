//! Pending-query table — correlates in-flight requests with responses.
//!
//! A response may arrive on any channel of the target peer; correlation is
//! by request id only. An entry lives from enqueue until a matching
//! response, the target peer's disconnect, or shutdown — whichever comes
//! first resolves the caller's completion exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use trellis_core::RpcError;

/// What a completed query yields: the optional result bytes, or the wire
/// error to re-raise.
pub type Completion = Result<Option<Vec<u8>>, RpcError>;

struct PendingEntry {
    target: String,
    tx: oneshot::Sender<Completion>,
}

pub struct PendingQueries {
    /// Monotonic id source, seeded at a random offset per runtime.
    next_id: AtomicU64,
    entries: DashMap<u64, PendingEntry>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(rand::random()),
            entries: DashMap::new(),
        }
    }

    /// Allocate a fresh id and register a completion handle targeting `peer`.
    pub fn allocate(&self, peer: &str) -> (u64, oneshot::Receiver<Completion>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingEntry {
                target: peer.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    /// Resolve the query `id`. Returns false for unknown ids — late
    /// responses after a timeout are silently discarded this way.
    pub fn complete(&self, id: u64, completion: Completion) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(completion);
                true
            }
            None => false,
        }
    }

    /// Drop the entry without resolving it (the caller timed out and is
    /// no longer listening).
    pub fn remove(&self, id: u64) {
        self.entries.remove(&id);
    }

    /// Fail every query targeted at `peer`.
    pub fn fail_peer(&self, peer: &str, error: RpcError) {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.value().target == peer)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            self.complete(id, Err(error.clone()));
        }
    }

    /// Fail every query, regardless of target. Used at shutdown.
    pub fn fail_all(&self, error: RpcError) {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.complete(id, Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingQueries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::ErrorKind;

    #[tokio::test]
    async fn complete_resolves_the_caller_once() {
        let pending = PendingQueries::new();
        let (id, rx) = pending.allocate("peer-a");

        assert!(pending.complete(id, Ok(Some(vec![1, 2]))));
        assert_eq!(rx.await.unwrap().unwrap(), Some(vec![1, 2]));

        // A late duplicate is discarded.
        assert!(!pending.complete(id, Ok(None)));
    }

    #[tokio::test]
    async fn ids_are_unique_across_a_window() {
        let pending = PendingQueries::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let (id, _rx) = pending.allocate("p");
            assert!(seen.insert(id), "duplicate id {id}");
            pending.remove(id);
        }
    }

    #[tokio::test]
    async fn fail_peer_only_touches_that_peers_queries() {
        let pending = PendingQueries::new();
        let (id_a, rx_a) = pending.allocate("a");
        let (_id_b, mut rx_b) = pending.allocate("b");

        pending.fail_peer("a", RpcError::peer_disconnected("a"));

        let err = rx_a.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerDisconnected);
        assert!(rx_b.try_recv().is_err(), "b's query must stay pending");
        assert_eq!(pending.len(), 1);
        let _ = id_a;
    }

    #[tokio::test]
    async fn fail_all_resolves_everything_with_shutdown() {
        let pending = PendingQueries::new();
        let (_ia, rx_a) = pending.allocate("a");
        let (_ib, rx_b) = pending.allocate("b");

        pending.fail_all(RpcError::shutdown());

        assert_eq!(rx_a.await.unwrap().unwrap_err().kind, ErrorKind::Shutdown);
        assert_eq!(rx_b.await.unwrap().unwrap_err().kind, ErrorKind::Shutdown);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn removed_entries_never_resolve() {
        let pending = PendingQueries::new();
        let (id, mut rx) = pending.allocate("a");
        pending.remove(id);
        assert!(!pending.complete(id, Ok(None)));
        assert!(rx.try_recv().is_err());
    }
}

//! The pending-entry map: the rendezvous between the Reply Router and the
//! Orchestrator task awaiting a job's replies.
//!
//! A concurrent map from `search_id` to a bounded reply channel, created at
//! issue time and removed at finalize. The Reply Router performs
//! non-blocking sends; the Orchestrator reads with a deadline. Correlation
//! runs entirely through `search_id` — no broker-level correlation id is
//! used.

use dashmap::DashMap;
use query_harness_core::models::SearchReply;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One registered slot: which job it belongs to, and where to deliver a
/// reply once it arrives.
pub struct PendingEntry {
    pub job_id: Uuid,
    pub reply_tx: mpsc::Sender<SearchReply>,
}

#[derive(Default)]
pub struct PendingMap {
    inner: DashMap<Uuid, PendingEntry>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, search_id: Uuid, entry: PendingEntry) {
        self.inner.insert(search_id, entry);
    }

    /// Non-blocking delivery. Returns `true` if a waiting entry was found
    /// and the send succeeded, `false` if the `search_id` is unknown/late
    /// or the channel was full (both acceptable drops per the reply
    /// router's contract).
    pub fn deliver(&self, search_id: Uuid, reply: SearchReply) -> bool {
        match self.inner.get(&search_id) {
            Some(entry) => entry.reply_tx.try_send(reply).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, search_id: &Uuid) -> Option<PendingEntry> {
        self.inner.remove(search_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_harness_core::models::{SearchErrorReply, SearchReply};

    fn error_reply(search_id: Uuid) -> SearchReply {
        SearchReply::Error(SearchErrorReply {
            search_id,
            error_message: "boom".into(),
            error_code: "E".into(),
            service_instance_id: "svc-1".into(),
        })
    }

    #[tokio::test]
    async fn delivers_to_registered_entry() {
        let map = PendingMap::new();
        let (tx, mut rx) = mpsc::channel(1);
        let search_id = Uuid::new_v4();
        map.register(
            search_id,
            PendingEntry {
                job_id: Uuid::new_v4(),
                reply_tx: tx,
            },
        );

        assert!(map.deliver(search_id, error_reply(search_id)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.search_id(), search_id);
    }

    #[test]
    fn unknown_search_id_is_a_no_op() {
        let map = PendingMap::new();
        let unknown = Uuid::new_v4();
        assert!(!map.deliver(unknown, error_reply(unknown)));
        assert!(map.is_empty());
    }

    #[test]
    fn remove_drops_the_entry() {
        let map = PendingMap::new();
        let (tx, _rx) = mpsc::channel(1);
        let search_id = Uuid::new_v4();
        map.register(
            search_id,
            PendingEntry {
                job_id: Uuid::new_v4(),
                reply_tx: tx,
            },
        );
        assert_eq!(map.len(), 1);
        assert!(map.remove(&search_id).is_some());
        assert!(map.is_empty());
        assert!(map.remove(&search_id).is_none());
    }
}

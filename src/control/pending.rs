//! Single-shot delivery slots for request/response correlation on the
//! control stream (§3, §8 invariant 3: every pending request is either
//! delivered exactly once or times out — never both, never neither).
//!
//! Grounded on `dispatcher::streams`' map (a `HashMap` from
//! correlation key to a channel half), narrowed from a multi-shot
//! `mpsc` to a single-shot `oneshot` since each request id here expects
//! exactly one reply.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::protocol::message::Message;

/// Registry of in-flight requests keyed by request id. Cleaned up on
/// delivery, on timeout, and (via `remove`) on connection teardown.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<DashMap<String, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Register `request_id` and wait up to `wait` for a matching reply
    /// delivered via `deliver`. The slot is removed whether this
    /// succeeds, times out, or the sender is dropped.
    pub async fn wait_for(&self, request_id: String, wait: Duration) -> Option<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id.clone(), tx);
        let result = match timeout(wait, rx).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) | Err(_) => None,
        };
        self.slots.remove(&request_id);
        result
    }

    /// Register a slot without waiting on it yet. Split out from
    /// `wait_for` for producers that must write the request to the wire
    /// *after* the slot exists, so a reply that lands before the writer
    /// gets around to awaiting can never be dropped as "unknown request".
    pub fn register(&self, request_id: String) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id, tx);
        rx
    }

    /// Wait on a slot obtained from `register`, cleaning it up
    /// regardless of outcome.
    pub async fn await_response(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Message>,
        wait: Duration,
    ) -> Option<Message> {
        let result = match timeout(wait, rx).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) | Err(_) => None,
        };
        self.slots.remove(request_id);
        result
    }

    /// Deliver `message` to the slot registered under `request_id`, if
    /// one is still waiting. Returns `false` if there was no match (the
    /// request already timed out, or the id was never registered) so
    /// the router can log an orphaned reply.
    pub fn deliver(&self, request_id: &str, message: Message) -> bool {
        if let Some((_, tx)) = self.slots.remove(request_id) {
            tx.send(message).is_ok()
        } else {
            false
        }
    }

    /// Number of requests currently awaiting a reply. Exposed for
    /// status reporting, not load-bearing for correctness.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(ts: i64) -> Message {
        Message::Ping { timestamp: ts }
    }

    #[tokio::test]
    async fn delivers_to_the_matching_slot() {
        let pending = PendingRequests::new();
        let pending2 = pending.clone();
        let handle = tokio::spawn(async move {
            pending2
                .wait_for("req-1".into(), Duration::from_secs(1))
                .await
        });
        tokio::task::yield_now().await;
        assert!(pending.deliver("req-1", ping(1)));
        let result = handle.await.unwrap();
        assert!(matches!(result, Some(Message::Ping { timestamp: 1 })));
    }

    #[tokio::test]
    async fn times_out_and_cleans_up_when_no_reply_arrives() {
        let pending = PendingRequests::new();
        let result = pending
            .wait_for("req-2".into(), Duration::from_millis(20))
            .await;
        assert!(result.is_none());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn delivering_to_an_unknown_request_id_is_a_no_op() {
        let pending = PendingRequests::new();
        assert!(!pending.deliver("never-registered", ping(1)));
    }

    #[tokio::test]
    async fn delivered_request_cannot_be_delivered_twice() {
        let pending = PendingRequests::new();
        let pending2 = pending.clone();
        let handle = tokio::spawn(async move {
            pending2
                .wait_for("req-3".into(), Duration::from_secs(1))
                .await
        });
        tokio::task::yield_now().await;
        assert!(pending.deliver("req-3", ping(1)));
        handle.await.unwrap();
        assert!(!pending.deliver("req-3", ping(2)));
    }
}

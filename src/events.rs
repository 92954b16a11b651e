//! Client-wide event bus: a closed `ClientEvent` enum fanned out to any
//! number of subscribers.
//!
//! Grounded on `tokio::sync::broadcast`, the same primitive reached for
//! anywhere fan-out pub/sub is needed (the heartbeat ack channel in
//! `tunnel::heartbeat` is the single-consumer cousin of this).
//! A late subscriber only sees events emitted after it subscribes —
//! `broadcast` has no replay buffer, which is exactly the semantics
//! wanted here.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connecting {
        attempt: u32,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    Reconnecting {
        attempt: u32,
        delay: std::time::Duration,
    },
    TunnelOpened {
        tunnel_id: String,
        name: String,
    },
    TunnelClosed {
        tunnel_id: String,
    },
    TunnelError {
        tunnel_id: Option<String>,
        message: String,
    },
    ConnectionProxied {
        tunnel_id: String,
        remote_addr: String,
    },
    CaptureRecorded {
        tunnel_id: String,
        exchange_id: String,
    },
    /// Emitted every 2s per active tunnel (§5 scheduling model) so a
    /// subscriber can chart live throughput without polling `/api/tunnels`.
    TrafficUpdate {
        tunnel_id: String,
        bytes_sent: u64,
        bytes_received: u64,
    },
    /// Mirrors a `tracing` event onto the bus so an embedding application
    /// can surface logs without attaching its own subscriber layer.
    Log {
        level: String,
        message: String,
    },
    ShuttingDown,
}

/// Owns the send side of the broadcast channel; `subscribe` hands out
/// receivers. Cloning an `EventEmitter` shares the same underlying
/// channel (mirrors `broadcast::Sender`'s own `Clone`).
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fan the event out to every current subscriber. Never blocks the
    /// caller: if a subscriber's queue is full, `broadcast` drops its
    /// oldest entries rather than applying backpressure here.
    pub fn emit(&self, event: ClientEvent) {
        // No receivers is the common case when nothing is watching; not
        // an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_emitted_after_subscribing() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(ClientEvent::Connected);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ClientEvent::Connected));
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_past_events() {
        let emitter = EventEmitter::new();
        emitter.emit(ClientEvent::Connected);
        let mut rx = emitter.subscribe();
        emitter.emit(ClientEvent::ShuttingDown);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ClientEvent::ShuttingDown));
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new();
        emitter.emit(ClientEvent::Connected);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_the_same_event() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();
        emitter.emit(ClientEvent::TunnelClosed {
            tunnel_id: "t1".into(),
        });
        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert!(matches!(ea, ClientEvent::TunnelClosed { .. }));
        assert!(matches!(eb, ClientEvent::TunnelClosed { .. }));
    }
}

//! Control-stream reader/dispatcher.
//!
//! A single task owns the read half of the control stream and decodes
//! one `Message` at a time, matching the `dispatcher` module's shape:
//! one read loop, dispatch by tag, and a single shared writer that every
//! producer (this loop's own Pong replies, the tunnel layer's requests,
//! the keepalive ping ticker) funnels through — grounded on
//! `tunnel::writer`'s "all producers share one `FrameSender` clone".

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::codec;
use crate::control::pending::PendingRequests;
use crate::error::SessionError;
use crate::events::{ClientEvent, EventEmitter};
use crate::protocol::message::Message;
use crate::tunnel::manager::TunnelManager;

/// Handed to every producer that needs to send a control-plane message;
/// writes are serialized by the single task draining the other end.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl ControlSender {
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Spawn the task that owns the write half and drains `ControlSender`s.
/// Returns the handle producers clone; the task exits (and stops
/// accepting further sends, though `send` stays infallible-looking by
/// design — callers check the session's overall health, not this
/// channel) once the underlying write fails or every sender is dropped.
pub fn spawn_writer<W>(mut writer: W) -> ControlSender
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(error) = codec::encode_to(&mut writer, &message).await {
                tracing::warn!(%error, "control writer stopped");
                break;
            }
        }
    });
    ControlSender { tx }
}

/// Why the control loop stopped reading, distinct from a hard error:
/// both are routine and drive the reconnect loop differently.
#[derive(Debug)]
pub enum RouterExit {
    ServerShutdown { reason: Option<String> },
    StreamClosed,
}

/// Drive the control-stream read loop until the peer closes the stream,
/// sends `ServerShutdown`, or a protocol/codec error occurs.
pub async fn run<R>(
    mut reader: R,
    sender: ControlSender,
    pending: PendingRequests,
    tunnels: TunnelManager,
    events: EventEmitter,
    last_pong_millis: Arc<AtomicI64>,
) -> Result<RouterExit, SessionError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let message: Message = match codec::decode(&mut reader).await {
            Ok(message) => message,
            Err(crate::codec::CodecError::ShortRead) => return Ok(RouterExit::StreamClosed),
            Err(error) => return Err(SessionError::Codec(error)),
        };
        tracing::trace!(tag = message.tag(), "control message received");

        match message {
            Message::Ping { timestamp } => {
                sender.send(Message::Pong { timestamp });
            }
            Message::Pong { .. } => {
                let now = now_millis();
                last_pong_millis.store(now, Ordering::Relaxed);
            }
            Message::TunnelCreated { ref request_id, .. } => {
                let delivered = pending.deliver(request_id, message.clone());
                if !delivered {
                    tracing::debug!(request_id, "TunnelCreated for an unknown/expired request");
                }
            }
            Message::TunnelError {
                ref tunnel_id,
                ref code,
                ref error,
                ..
            } => {
                tracing::warn!(tunnel_id, code, error, "server reported a tunnel error");
                events.emit(ClientEvent::TunnelError {
                    tunnel_id: Some(tunnel_id.clone()),
                    message: error.clone(),
                });
            }
            Message::TunnelClose { ref tunnel_id, .. }
            | Message::TunnelClosed { ref tunnel_id, .. } => {
                tunnels.remove(tunnel_id);
                events.emit(ClientEvent::TunnelClosed {
                    tunnel_id: tunnel_id.clone(),
                });
            }
            Message::NewConnection { .. }
            | Message::ConnectionAccept { .. }
            | Message::ConnectionClose { .. } => {
                tracing::debug!(tag = message.tag(), "informational connection event");
            }
            Message::Error {
                ref code,
                ref error,
                fatal,
                ..
            } => {
                tracing::error!(code, error, fatal, "server error message");
                events.emit(ClientEvent::TunnelError {
                    tunnel_id: None,
                    message: error.clone(),
                });
                if fatal {
                    return Err(SessionError::Disconnected);
                }
            }
            Message::ServerShutdown { reason, .. } => {
                return Ok(RouterExit::ServerShutdown { reason });
            }
            // Auth/AuthResult/JoinSession/JoinSessionResult only ever
            // appear during the synchronous handshake performed before
            // this loop starts; seeing one here means the peer replayed
            // it, which is a protocol violation.
            other => {
                tracing::warn!(tag = other.tag(), "unexpected message on an open control stream");
            }
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::TunnelKind;

    #[tokio::test]
    async fn ping_gets_a_pong_reply() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(server);
        let sender = spawn_writer(write_half);
        let pending = PendingRequests::new();
        let tunnels = TunnelManager::new();
        let events = EventEmitter::new();
        let last_pong = Arc::new(AtomicI64::new(0));

        let router = tokio::spawn(run(
            read_half,
            sender,
            pending,
            tunnels,
            events,
            last_pong,
        ));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        codec::encode_to(&mut client_write, &Message::Ping { timestamp: 1 })
            .await
            .unwrap();
        let reply: Message = codec::decode(&mut client_read).await.unwrap();
        assert!(matches!(reply, Message::Pong { .. }));

        drop(client_write);
        let _ = router.await;
    }

    #[tokio::test]
    async fn tunnel_created_is_delivered_to_the_matching_pending_request() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(server);
        let sender = spawn_writer(write_half);
        let pending = PendingRequests::new();
        let pending2 = pending.clone();
        let tunnels = TunnelManager::new();
        let events = EventEmitter::new();
        let last_pong = Arc::new(AtomicI64::new(0));

        let router = tokio::spawn(run(read_half, sender, pending2, tunnels, events, last_pong));

        let waiter = tokio::spawn({
            let pending = pending.clone();
            async move {
                pending
                    .wait_for("req-1".into(), std::time::Duration::from_secs(1))
                    .await
            }
        });

        let (_client_read, mut client_write) = tokio::io::split(client);
        tokio::task::yield_now().await;
        codec::encode_to(
            &mut client_write,
            &Message::TunnelCreated {
                timestamp: 1,
                request_id: "req-1".into(),
                tunnel_id: "t-1".into(),
                tunnel_type: TunnelKind::Http,
                url: Some("https://x.example.test".into()),
                remote_addr: None,
                remote_port: None,
            },
        )
        .await
        .unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Some(Message::TunnelCreated { .. })));

        drop(client_write);
        let _ = router.await;
    }

    #[tokio::test]
    async fn server_shutdown_stops_the_loop_with_the_reason() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(server);
        let sender = spawn_writer(write_half);
        let pending = PendingRequests::new();
        let tunnels = TunnelManager::new();
        let events = EventEmitter::new();
        let last_pong = Arc::new(AtomicI64::new(0));

        let router = tokio::spawn(run(read_half, sender, pending, tunnels, events, last_pong));

        let (_client_read, mut client_write) = tokio::io::split(client);
        codec::encode_to(
            &mut client_write,
            &Message::ServerShutdown {
                timestamp: 1,
                reason: Some("maintenance".into()),
            },
        )
        .await
        .unwrap();

        let exit = router.await.unwrap().unwrap();
        match exit {
            RouterExit::ServerShutdown { reason } => assert_eq!(reason.as_deref(), Some("maintenance")),
            RouterExit::StreamClosed => panic!("expected ServerShutdown"),
        }
    }
}

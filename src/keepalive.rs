//! Ping/pong liveness (§4.6).
//!
//! Grounded on `tunnel::heartbeat`'s task: a `tokio::select!`
//! loop ticking on an interval, sending a ping and tracking whether an
//! ack/pong came back in time. Generalized from its
//! reconnect-triggering-by-return-value to an explicit disconnect
//! signal, since this module no longer owns the socket directly (a
//! `ControlSender` does).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::control::router::ControlSender;
use crate::protocol::message::Message;

/// Disconnect if no pong has landed in this long, i.e. three missed
/// beats at the configured interval.
const PONG_TIMEOUT_MULTIPLE: u32 = 3;
const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 3;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Runs until told to stop or until it decides the connection is dead,
/// at which point it sends `true` on `disconnect` and returns. `interval`
/// is `ClientConfig::keepalive_interval_secs`; the pong timeout scales
/// with it so a slower-configured interval doesn't trip early.
pub async fn run(
    sender: ControlSender,
    last_pong_millis: Arc<AtomicI64>,
    shutdown: watch::Receiver<bool>,
    disconnect: watch::Sender<bool>,
    interval: Duration,
) {
    run_with_interval(sender, last_pong_millis, shutdown, disconnect, interval).await;
}

async fn run_with_interval(
    sender: ControlSender,
    last_pong_millis: Arc<AtomicI64>,
    mut shutdown: watch::Receiver<bool>,
    disconnect: watch::Sender<bool>,
    ping_interval: Duration,
) {
    last_pong_millis.store(now_millis(), Ordering::Relaxed);
    let mut ticker = interval(ping_interval);
    ticker.tick().await; // consume the immediate first tick
    let mut consecutive_failures: u32 = 0;
    let pong_timeout_millis = ping_interval.as_millis() as i64 * PONG_TIMEOUT_MULTIPLE as i64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ok = sender.send(Message::Ping { timestamp: now_millis() });
                if ok {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    tracing::warn!(consecutive_failures, "ping send failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                        tracing::warn!("too many consecutive ping send failures, disconnecting");
                        let _ = disconnect.send(true);
                        return;
                    }
                }

                let last = last_pong_millis.load(Ordering::Relaxed);
                let silence = now_millis() - last;
                if silence > pong_timeout_millis {
                    tracing::warn!(silence_ms = silence, "pong timeout, disconnecting");
                    let _ = disconnect.send(true);
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

pub fn shared_last_pong() -> Arc<AtomicI64> {
    Arc::new(AtomicI64::new(now_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_sender() -> (ControlSender, mpsc::UnboundedReceiver<Message>) {
        // ControlSender only exposes a constructor via spawn_writer, so
        // build one over an in-memory duplex pipe and read the encoded
        // messages back out on the other end.
        let (client, server) = tokio::io::duplex(4096);
        let (_read, write_half) = tokio::io::split(server);
        let sender = crate::control::router::spawn_writer(write_half);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut read_half, _write) = tokio::io::split(client);
            loop {
                match crate::codec::decode::<_, Message>(&mut read_half).await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        (sender, rx)
    }

    #[tokio::test]
    async fn sends_a_ping_on_every_tick() {
        let (sender, mut rx) = test_sender();
        let (disc_tx, mut disc_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_pong = Arc::new(AtomicI64::new(now_millis()));

        tokio::spawn(run_with_interval(
            sender,
            last_pong,
            shutdown_rx,
            disc_tx,
            Duration::from_millis(10),
        ));

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Ping { .. }));
        assert!(!*disc_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn disconnects_after_prolonged_pong_silence() {
        let (sender, _rx) = test_sender();
        let (disc_tx, mut disc_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // last_pong far in the past relative to a tiny interval forces
        // the timeout branch almost immediately.
        let last_pong = Arc::new(AtomicI64::new(0));

        tokio::spawn(run_with_interval(
            sender,
            last_pong,
            shutdown_rx,
            disc_tx,
            Duration::from_millis(5),
        ));

        disc_rx.changed().await.unwrap();
        assert!(*disc_rx.borrow());
    }
}

//! Top-level orchestrator wiring `reconnect::run` to `transport::session`
//! (§4.7, §4.3).
//!
//! Grounded on `app::run`: build the shared state once,
//! hand it to the connection loop, and let that loop own reconnects for
//! the lifetime of the process. `transport::session::connect` only
//! performs the handshake and returns once every worker for that epoch
//! is spawned (see its module doc), so this is the layer that awaits
//! `ConnectOutcome::disconnected` and feeds a fresh attempt back into
//! `reconnect::run` — which is also what resets backoff to `initial` on
//! every new epoch rather than carrying it across the whole process
//! lifetime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::capture::CaptureManager;
use crate::config::ClientConfig;
use crate::dialer::ResolvedAddrCache;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventEmitter};
use crate::reconnect::{self, BackoffConfig, TokenRefresher};
use crate::transport::session::{self, SessionContext};
use crate::tunnel::manager::TunnelManager;

/// How often the per-tunnel traffic-stats emitter ticks (§5 scheduling
/// model: "one per-tunnel traffic-stats emitter (tick 2 s)").
const TRAFFIC_TICK: Duration = Duration::from_secs(2);

/// Owns every piece of shared state that survives across reconnects —
/// the active-tunnel map, the capture buffers, the dialer cache, and the
/// event bus — plus the configuration driving the connection loop.
/// Cloning the individual pieces (not `Client` itself, which is consumed
/// by `run`) is how the inspector and any embedding application observe
/// the same state the connection loop is mutating.
pub struct Client {
    config: ClientConfig,
    events: EventEmitter,
    tunnels: TunnelManager,
    capture: CaptureManager,
    dialer_cache: Arc<ResolvedAddrCache>,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    client_id: String,
}

impl Client {
    pub fn new(config: ClientConfig, token_refresher: Option<Arc<dyn TokenRefresher>>) -> Self {
        let capture = CaptureManager::new(config.capture_ring_capacity, config.capture_enabled);
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            config,
            events: EventEmitter::new(),
            tunnels: TunnelManager::new(),
            capture,
            dialer_cache: ResolvedAddrCache::new(),
            token_refresher,
        }
    }

    pub fn events(&self) -> EventEmitter {
        self.events.clone()
    }

    pub fn tunnels(&self) -> TunnelManager {
        self.tunnels.clone()
    }

    pub fn capture(&self) -> CaptureManager {
        self.capture.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dialer_cache(&self) -> Arc<ResolvedAddrCache> {
        self.dialer_cache.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Drive the connection for the life of the process: connect, wait
    /// for the epoch to end, reconnect with fresh backoff, repeat — until
    /// `shutdown` is signalled, `reconnect_disabled` is set and the
    /// session drops, or the reconnect loop gives up for good (token
    /// expiry with no refresher, or attempts exhausted).
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let traffic_handle = tokio::spawn(run_traffic_emitter(
            self.tunnels.clone(),
            self.events.clone(),
            shutdown.clone(),
        ));

        let result = run_connection_loop(
            self.config,
            self.events.clone(),
            self.tunnels,
            self.capture,
            self.dialer_cache,
            self.token_refresher,
            self.client_id,
            shutdown,
        )
        .await;

        traffic_handle.abort();
        self.events.emit(ClientEvent::ShuttingDown);
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection_loop(
    config: ClientConfig,
    events: EventEmitter,
    tunnels: TunnelManager,
    capture: CaptureManager,
    dialer_cache: Arc<ResolvedAddrCache>,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    client_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    let backoff = BackoffConfig {
        initial: Duration::from_secs(config.reconnect_initial_secs),
        max: Duration::from_secs(config.reconnect_max_secs),
        max_attempts: config.reconnect_max_attempts,
    };
    let keepalive_interval = Duration::from_secs(config.keepalive_interval_secs);
    let user_agent = format!("retun-client/{}", env!("CARGO_PKG_VERSION"));
    let mut stored_token = config.auth_token.clone();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let outcome_slot: Arc<tokio::sync::Mutex<Option<session::ConnectOutcome>>> =
            Arc::new(tokio::sync::Mutex::new(None));

        let connect_result = tokio::select! {
            result = reconnect::run(
                backoff,
                token_refresher.clone(),
                &config.server_url,
                &mut stored_token,
                &events,
                |token| {
                    let ctx = SessionContext {
                        tunnels: tunnels.clone(),
                        capture: capture.clone(),
                        dialer_cache: dialer_cache.clone(),
                        events: events.clone(),
                        tunnel_specs: config.tunnels.clone(),
                        data_sessions: config.data_sessions,
                        compression: config.compression,
                        tls: false,
                        max_capture_body: config.capture_max_body_bytes,
                        client_id: client_id.clone(),
                        user_agent: user_agent.clone(),
                        keepalive_interval,
                    };
                    let server_url = config.server_url.clone();
                    let slot = outcome_slot.clone();
                    async move {
                        let outcome = session::connect(&ctx, &server_url, token).await?;
                        *slot.lock().await = Some(outcome);
                        Ok(())
                    }
                },
            ) => result,
            _ = shutdown.changed() => return Ok(()),
        };

        connect_result?;

        let outcome = outcome_slot
            .lock()
            .await
            .take()
            .expect("reconnect::run only returns Ok(()) after the connect closure stashed its outcome");
        let mut disconnected = outcome.disconnected.clone();

        tokio::select! {
            _ = wait_for_disconnect(&mut disconnected) => {}
            _ = shutdown.changed() => {
                outcome.teardown().await;
                return Ok(());
            }
        }

        outcome.teardown().await;
        // §4.7 step 2: the server reports tunnels afresh on the next
        // epoch, so stale entries from this one must not survive it.
        tunnels.clear();

        if config.reconnect_disabled {
            return Ok(());
        }
    }
}

async fn wait_for_disconnect(disconnected: &mut watch::Receiver<bool>) {
    while !*disconnected.borrow() {
        if disconnected.changed().await.is_err() {
            return;
        }
    }
}

/// Ticks every `TRAFFIC_TICK` and emits a `TrafficUpdate` per active
/// tunnel with its current cumulative byte counters, giving a subscriber
/// (the inspector or an embedding application) a live throughput view
/// without polling `/api/tunnels` on its own schedule.
async fn run_traffic_emitter(
    tunnels: TunnelManager,
    events: EventEmitter,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(TRAFFIC_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for tunnel in tunnels.snapshot() {
                    events.emit(ClientEvent::TrafficUpdate {
                        tunnel_id: tunnel.tunnel_id.clone(),
                        bytes_sent: tunnel.bytes_out.load(std::sync::atomic::Ordering::Relaxed),
                        bytes_received: tunnel.bytes_in.load(std::sync::atomic::Ordering::Relaxed),
                    });
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(server_url: String) -> ClientConfig {
        ClientConfig {
            server_url,
            auth_token: "tok".into(),
            tunnels: vec![],
            data_sessions: 1,
            compression: false,
            reconnect_initial_secs: 1,
            reconnect_max_secs: 2,
            reconnect_max_attempts: 2,
            reconnect_disabled: false,
            keepalive_interval_secs: 30,
            capture_enabled: true,
            capture_max_body_bytes: 1024,
            capture_ring_capacity: 10,
            inspector_port: 4040,
            inspector_disabled: true,
            log_level: "info".into(),
            log_json: false,
            config_file: None,
        }
    }

    /// A loopback port nothing is listening on, so dials fail with a fast
    /// `ECONNREFUSED` instead of waiting out the full dial timeout.
    async fn closed_loopback_port() -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_against_an_unreachable_server() {
        let port = closed_loopback_port().await;
        let client = Client::new(sample_config(format!("tcp://127.0.0.1:{port}")), None);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(10), client.run(shutdown_rx)).await;
        assert!(matches!(
            result,
            Ok(Err(ClientError::MaxAttemptsExceeded(2)))
        ));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop_before_any_connect_attempt() {
        let client = Client::new(sample_config("tcp://127.0.0.1:1".into()), None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), client.run(shutdown_rx)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}

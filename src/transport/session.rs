//! The §4.3 connect sequence: dial, negotiate, multiplex, authenticate,
//! join data sessions, and re-request configured tunnels.
//!
//! Grounded on `tunnel::client::connect_and_run` for the
//! overall shape (dial with timeout, tune the socket, optionally wrap
//! TLS, spawn the writer/heartbeat/dispatcher trio) and on
//! `tunnel::mod::run`'s outer loop for the "this function performs one
//! handshake and returns, the caller handles backoff" contract that
//! `reconnect::run` already expects. The single control session here
//! plays the role of that module's `conn_idx == 0` connection; the data
//! sessions are new, since that protocol has no second
//! connection class.
//!
//! `connect` itself only performs the handshake (§4.3 steps 1-9) and
//! returns once every worker is spawned — it does not wait for
//! disconnect. That is the caller's job (see `crate::client`), so that
//! `reconnect::run`'s `Ok(())` early-return and backoff-reset semantics
//! apply per attempt rather than per connection lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::capture::CaptureManager;
use crate::codec;
use crate::config::TunnelArg;
use crate::control::pending::PendingRequests;
use crate::control::router::{self, ControlSender, RouterExit};
use crate::dialer::{self, ResolvedAddrCache};
use crate::error::{AuthError, SessionError};
use crate::events::{ClientEvent, EventEmitter};
use crate::keepalive;
use crate::protocol::message::Message;
use crate::tunnel::manager::{ActiveTunnel, TunnelManager};
use crate::tunnel::stream_handler::{self, HandlerContext};
use crate::transport::boxed_stream::{box_stream, BoxedStream};
use crate::transport::compress;
use crate::transport::mux::{self, MuxConnection};
use crate::transport::tls;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const TUNNEL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;
const JOIN_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(1000),
];

/// Shared state threaded through every session spawned for one connect
/// attempt; owned by `crate::client::Client` and handed in by reference
/// so `connect` doesn't need its own copies.
#[derive(Clone)]
pub struct SessionContext {
    pub tunnels: TunnelManager,
    pub capture: CaptureManager,
    pub dialer_cache: Arc<ResolvedAddrCache>,
    pub events: EventEmitter,
    pub tunnel_specs: Vec<TunnelArg>,
    pub data_sessions: u32,
    pub compression: bool,
    pub tls: bool,
    pub max_capture_body: usize,
    pub client_id: String,
    pub user_agent: String,
    pub keepalive_interval: Duration,
}

/// Everything the caller needs after a successful connect: a signal for
/// "this session epoch is over, time to reconnect" and the handles to
/// tear down before the next attempt.
pub struct ConnectOutcome {
    pub disconnected: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectOutcome {
    /// §4.7 step 1-3: stop every worker spawned for this epoch before
    /// the next `connect` attempt builds a fresh one. Graceful workers
    /// (keepalive) see `shutdown` first; everything else is aborted,
    /// which also drops its socket and unblocks any peer still reading.
    pub async fn teardown(self) {
        let _ = self.shutdown.send(true);
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct ServerAddr {
    host: String,
    port: u16,
    tls: bool,
}

fn parse_server_url(server_url: &str, want_tls: bool) -> Result<ServerAddr, SessionError> {
    let url = url::Url::parse(server_url)
        .map_err(|e| SessionError::InvalidServerUrl(format!("{server_url}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidServerUrl(format!("{server_url}: missing host")))?
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| SessionError::InvalidServerUrl(format!("{server_url}: missing port")))?;
    let tls = match url.scheme() {
        "tls" | "tcps" => true,
        "tcp" => false,
        other => return Err(SessionError::InvalidServerUrl(format!("unknown scheme {other:?}"))),
    } || want_tls;
    Ok(ServerAddr { host, port, tls })
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(())
}

async fn dial_server(addr: &ServerAddr) -> Result<TcpStream, SessionError> {
    let target: SocketAddr = tokio::net::lookup_host((addr.host.as_str(), addr.port))
        .await
        .map_err(SessionError::Dial)?
        .next()
        .ok_or_else(|| {
            SessionError::InvalidServerUrl(format!("{}:{} did not resolve", addr.host, addr.port))
        })?;
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| SessionError::DialTimeout(DIAL_TIMEOUT))??;
    tune_socket(&stream).map_err(SessionError::Dial)?;
    Ok(stream)
}

/// Dial the raw connection and run it through TLS + compression
/// negotiation, producing one type-erased stream regardless of which
/// combination was negotiated (§4.3 steps 1-2).
async fn establish_raw_stream(
    addr: &ServerAddr,
    tls_config: &Arc<tokio_rustls::rustls::ClientConfig>,
    compression: bool,
) -> Result<BoxedStream, SessionError> {
    let tcp = dial_server(addr).await?;
    let mut boxed: BoxedStream = if addr.tls {
        let tls_stream = tls::connect(tls_config.clone(), &addr.host, tcp).await?;
        box_stream(tls_stream)
    } else {
        box_stream(tcp)
    };

    let negotiated = compress::negotiate(&mut boxed, compression)
        .await
        .map_err(SessionError::Dial)?;
    if negotiated {
        Ok(box_stream(compress::CompressedStream::wrap(boxed)))
    } else {
        Ok(boxed)
    }
}

/// Drives one `MuxConnection` to completion, dispatching every inbound
/// stream to `stream_handler::handle_stream` through a bounded worker
/// pool. Per §4.3 "stream acceptor": the pool gates concurrency but
/// never drops a stream — an overflowing stream still gets spawned, it
/// just does so without holding a permit.
fn spawn_stream_acceptor(
    mut conn: MuxConnection<BoxedStream>,
    ctx: HandlerContext,
    disconnect: watch::Sender<bool>,
) -> JoinHandle<()> {
    let pool_size = std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(16);
    let permits = Arc::new(Semaphore::new(pool_size));

    tokio::spawn(async move {
        loop {
            match conn.accept().await {
                Some(Ok(stream)) => {
                    let ctx = ctx.clone();
                    let permits = permits.clone();
                    let io = stream.compat();
                    tokio::spawn(async move {
                        let _permit = permits.try_acquire_owned().ok();
                        stream_handler::handle_stream(io, ctx).await;
                    });
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "multiplexer connection error, disconnecting");
                    let _ = disconnect.send(true);
                    return;
                }
                None => {
                    tracing::debug!("multiplexer connection closed, disconnecting");
                    let _ = disconnect.send(true);
                    return;
                }
            }
        }
    })
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn random_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Perform the Auth handshake over a freshly opened control stream
/// (§4.3 steps 5-6). Returns the session identity the server assigned.
async fn authenticate<S>(
    stream: &mut S,
    token: String,
    client_id: &str,
    user_agent: &str,
) -> Result<AuthIdentity, SessionError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    codec::encode_to(
        stream,
        &Message::Auth {
            timestamp: now_millis(),
            token,
            client_id: client_id.to_string(),
            user_agent: user_agent.to_string(),
        },
    )
    .await?;

    let reply: Message = timeout(AUTH_TIMEOUT, codec::decode(stream))
        .await
        .map_err(|_| SessionError::Auth(AuthError::Timeout))??;

    match reply {
        Message::AuthResult {
            success: true,
            client_id,
            session_id,
            session_secret,
            ..
        } => Ok(AuthIdentity {
            client_id: client_id.unwrap_or_default(),
            session_id: session_id.unwrap_or_default(),
            session_secret: session_secret.unwrap_or_default(),
        }),
        Message::AuthResult {
            success: false,
            code,
            error,
            ..
        } => {
            if code.as_deref() == Some(crate::protocol::message::error_code::TOKEN_EXPIRED) {
                Err(SessionError::Auth(AuthError::TokenExpired))
            } else {
                Err(SessionError::Auth(AuthError::Denied(
                    error.unwrap_or_else(|| "authentication rejected".into()),
                )))
            }
        }
        other => Err(SessionError::Auth(AuthError::Denied(format!(
            "unexpected reply to Auth: {}",
            other.tag()
        )))),
    }
}

struct AuthIdentity {
    client_id: String,
    session_secret: String,
    #[allow(dead_code)]
    session_id: String,
}

/// One attempt at bringing up a data session (§4.3 step 8): dial,
/// negotiate, multiplex, join, then hand off to the stream acceptor.
/// A `JoinSessionResult{success: false}` surfaces as `JoinRejected` so
/// the retry wrapper can distinguish it from a terminal transport error.
async fn open_data_session_once(
    addr: &ServerAddr,
    tls_config: &Arc<tokio_rustls::rustls::ClientConfig>,
    ctx: &SessionContext,
    handler_ctx: HandlerContext,
    identity_client_id: &str,
    session_secret: &str,
    disconnect: watch::Sender<bool>,
) -> Result<JoinHandle<()>, SessionError> {
    let stream = establish_raw_stream(addr, tls_config, ctx.compression).await?;
    let (conn, mut control) = MuxConnection::new(stream, yamux::Mode::Client);
    let acceptor = spawn_stream_acceptor(conn, handler_ctx, disconnect);

    match join_handshake(&mut control, identity_client_id, session_secret).await {
        Ok(true) => Ok(acceptor),
        Ok(false) => {
            acceptor.abort();
            Err(SessionError::JoinRejected)
        }
        Err(error) => {
            acceptor.abort();
            Err(error)
        }
    }
}

/// Open a temporary stream, exchange `JoinSession`/`JoinSessionResult`,
/// and close it again. Returns the server's accept/reject decision;
/// transport-level failures (dial already happened by the time this
/// runs, so only codec/timeout errors reach here) are returned as-is.
async fn join_handshake(
    control: &mut yamux::Control,
    client_id: &str,
    secret: &str,
) -> Result<bool, SessionError> {
    let stream = control
        .open_stream()
        .await
        .map_err(|e| SessionError::Mux(e.to_string()))?;
    let mut handshake = stream.compat();

    codec::encode_to(
        &mut handshake,
        &Message::JoinSession {
            timestamp: now_millis(),
            client_id: client_id.to_string(),
            secret: secret.to_string(),
        },
    )
    .await?;
    let reply: Message = timeout(JOIN_TIMEOUT, codec::decode(&mut handshake))
        .await
        .map_err(|_| SessionError::JoinRejected)??;
    let _ = handshake.shutdown().await;

    match reply {
        Message::JoinSessionResult { success, .. } => Ok(success),
        other => Err(SessionError::Mux(format!(
            "unexpected reply to JoinSession: {}",
            other.tag()
        ))),
    }
}

async fn open_data_session_with_retry(
    addr: &ServerAddr,
    tls_config: &Arc<tokio_rustls::rustls::ClientConfig>,
    ctx: &SessionContext,
    handler_ctx: HandlerContext,
    identity_client_id: &str,
    session_secret: &str,
    disconnect: watch::Sender<bool>,
) -> Result<JoinHandle<()>, SessionError> {
    let mut last_err = None;
    for delay in std::iter::once(Duration::ZERO).chain(JOIN_RETRY_DELAYS) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match open_data_session_once(
            addr,
            tls_config,
            ctx,
            handler_ctx.clone(),
            identity_client_id,
            session_secret,
            disconnect.clone(),
        )
        .await
        {
            Ok(handle) => return Ok(handle),
            Err(SessionError::JoinRejected) => {
                last_err = Some(SessionError::JoinRejected);
                continue;
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or(SessionError::JoinRejected))
}

async fn request_tunnel(
    sender: &ControlSender,
    pending: &PendingRequests,
    tunnel: &TunnelArg,
) -> Option<Message> {
    let request_id = random_request_id();
    let rx = pending.register(request_id.clone());
    let sent = sender.send(Message::TunnelRequest {
        timestamp: now_millis(),
        request_id: request_id.clone(),
        tunnel_type: tunnel.kind,
        name: tunnel.name.clone(),
        local_port: tunnel.local_port,
        remote_port: tunnel.remote_port,
        subdomain: None,
    });
    if !sent {
        return None;
    }
    pending
        .await_response(&request_id, rx, TUNNEL_RESPONSE_TIMEOUT)
        .await
}

/// Run the full §4.3 connect sequence and return once every worker for
/// this epoch is spawned. Matches the `connect: FnMut(String) ->
/// Result<(), SessionError>` shape `reconnect::run` expects.
pub async fn connect(
    ctx: &SessionContext,
    server_url: &str,
    token: String,
) -> Result<ConnectOutcome, SessionError> {
    let addr = parse_server_url(server_url, ctx.tls)?;
    let tls_config = tls::build_client_config();

    let (disconnect_tx, disconnect_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let handler_ctx = HandlerContext {
        tunnels: ctx.tunnels.clone(),
        dialer_cache: ctx.dialer_cache.clone(),
        capture: ctx.capture.clone(),
        max_capture_body: ctx.max_capture_body,
        events: ctx.events.clone(),
    };

    // Step 1-3: dial, negotiate compression, start the multiplexer. The
    // acceptor must be spawned before the handshake: yamux's connection
    // only makes progress (including on a stream this side opened
    // itself) while something is polling it via `accept`.
    let control_stream = establish_raw_stream(&addr, &tls_config, ctx.compression).await?;
    let (control_conn, mut control_handle) = MuxConnection::new(control_stream, yamux::Mode::Client);
    handles.push(spawn_stream_acceptor(
        control_conn,
        handler_ctx.clone(),
        disconnect_tx.clone(),
    ));
    handles.push(tokio::spawn(mux::run_keepalive(
        control_handle.clone(),
        mux::MUX_KEEPALIVE_INTERVAL,
        shutdown_rx.clone(),
    )));

    // Step 4-6: open the control stream and authenticate over it before
    // splitting it into the long-lived reader/writer halves.
    let mut control_io = control_handle
        .open_stream()
        .await
        .map_err(|e| SessionError::Mux(e.to_string()))?
        .compat();
    let identity = authenticate(&mut control_io, token, &ctx.client_id, &ctx.user_agent).await?;

    // Step 7: control-reader, keepalive. The stream acceptor spawned
    // above already covers "stream-accept" for this session.
    let (control_read, control_write) = tokio::io::split(control_io);
    let sender = router::spawn_writer(control_write);
    let pending = PendingRequests::new();
    let last_pong = keepalive::shared_last_pong();

    let router_task = {
        let sender = sender.clone();
        let pending = pending.clone();
        let tunnels = ctx.tunnels.clone();
        let events = ctx.events.clone();
        let last_pong = last_pong.clone();
        let disconnect_tx = disconnect_tx.clone();
        tokio::spawn(async move {
            let outcome = router::run(control_read, sender, pending, tunnels, events.clone(), last_pong).await;
            match outcome {
                Ok(RouterExit::ServerShutdown { reason }) => {
                    events.emit(ClientEvent::Disconnected { reason });
                    // Give the server a moment to finish closing its
                    // side before this epoch's teardown races it.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(RouterExit::StreamClosed) => {
                    events.emit(ClientEvent::Disconnected { reason: None });
                }
                Err(error) => {
                    events.emit(ClientEvent::Disconnected {
                        reason: Some(error.to_string()),
                    });
                }
            }
            let _ = disconnect_tx.send(true);
        })
    };
    handles.push(router_task);
    handles.push(tokio::spawn(keepalive::run(
        sender.clone(),
        last_pong,
        shutdown_rx,
        disconnect_tx.clone(),
        ctx.keepalive_interval,
    )));

    // Step 8: data sessions, each authenticated independently via
    // JoinSession against the identity AuthResult just handed us.
    for index in 0..ctx.data_sessions {
        match open_data_session_with_retry(
            &addr,
            &tls_config,
            ctx,
            handler_ctx.clone(),
            &identity.client_id,
            &identity.session_secret,
            disconnect_tx.clone(),
        )
        .await
        {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                tracing::warn!(%error, data_session = index, "data session failed to open");
            }
        }
    }

    // Step 9: re-request every configured tunnel.
    for tunnel in &ctx.tunnel_specs {
        match request_tunnel(&sender, &pending, tunnel).await {
            Some(Message::TunnelCreated {
                tunnel_id,
                tunnel_type,
                url,
                remote_addr,
                remote_port,
                ..
            }) => {
                let active = ctx.tunnels.insert(ActiveTunnel {
                    tunnel_id,
                    name: tunnel.name.clone(),
                    kind: tunnel_type,
                    local_host: tunnel.local_host.clone(),
                    local_port: tunnel.local_port,
                    url,
                    remote_addr,
                    remote_port,
                    bytes_in: std::sync::atomic::AtomicU64::new(0),
                    bytes_out: std::sync::atomic::AtomicU64::new(0),
                    connections_total: std::sync::atomic::AtomicU64::new(0),
                    connections_active: std::sync::atomic::AtomicU64::new(0),
                });
                ctx.events.emit(ClientEvent::TunnelOpened {
                    tunnel_id: active.tunnel_id.clone(),
                    name: active.name.clone(),
                });
                // §4.8: warm the resolved-address cache in the
                // background so the first real request doesn't pay for
                // the happy-eyeballs race.
                let dialer_cache = ctx.dialer_cache.clone();
                let local_host = tunnel.local_host.clone();
                let local_port = tunnel.local_port;
                tokio::spawn(async move {
                    let _ = dialer::dial(&dialer_cache, &local_host, local_port).await;
                });
            }
            Some(Message::TunnelError { code, error, .. }) => {
                tracing::warn!(code, error, name = %tunnel.name, "tunnel request rejected");
            }
            Some(other) => {
                tracing::warn!(tag = other.tag(), "unexpected reply to TunnelRequest");
            }
            None => {
                tracing::warn!(name = %tunnel.name, "tunnel request timed out");
            }
        }
    }

    Ok(ConnectOutcome {
        disconnected: disconnect_rx,
        shutdown: shutdown_tx,
        handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_tls_schemes() {
        let tcp = parse_server_url("tcp://tunnel.example.test:7000", false).unwrap();
        assert_eq!(tcp.host, "tunnel.example.test");
        assert_eq!(tcp.port, 7000);
        assert!(!tcp.tls);

        let tls = parse_server_url("tls://tunnel.example.test:7000", false).unwrap();
        assert!(tls.tls);
    }

    #[test]
    fn config_level_tls_flag_upgrades_a_plain_scheme() {
        let addr = parse_server_url("tcp://tunnel.example.test:7000", true).unwrap();
        assert!(addr.tls);
    }

    #[test]
    fn rejects_a_url_missing_a_port() {
        assert!(parse_server_url("tcp://tunnel.example.test", false).is_err());
    }

    #[test]
    fn rejects_an_unknown_scheme() {
        assert!(parse_server_url("ftp://tunnel.example.test:21", false).is_err());
    }

    #[test]
    fn random_request_ids_are_unique_and_well_formed() {
        let id = random_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_request_id());
    }
}

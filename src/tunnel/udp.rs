//! UDP proxy framing (§4.5): datagrams carried as length-prefixed frames
//! on a reliable byte stream, headered with a 2-byte length and an
//! 8-byte opaque "address hash" the server uses to tell peers apart.
//!
//! Grounded on the `prism-tunnel` client's `handle_stream` UDP branch
//! (manual `read_u32`/`write_u32` framing around a real `UdpSocket`,
//! two tasks joined with `tokio::try_join!`); the header widths here
//! differ (2+8 bytes, not 4) to match this protocol's frame layout.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::dialer::ResolvedAddrCache;
use crate::tunnel::manager::ActiveTunnel;

const HEADER_SIZE: usize = 10;
const MAX_DATAGRAM_SIZE: usize = 65507;
/// Read timeouts are a cancellation-check tool here, not errors (§4.5).
const UDP_RECV_DEADLINE: Duration = Duration::from_secs(30);

/// Drive one UDP-tunnel stream until either direction hits EOF/I-O
/// error; closing the UDP socket (by returning, dropping it) unblocks
/// whichever side is still parked in `recv_from`/`read_exact`.
pub async fn handle<S>(stream: BufReader<S>, tunnel: Arc<ActiveTunnel>, dialer_cache: Arc<ResolvedAddrCache>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::warn!(%error, "failed to bind local udp socket");
            return;
        }
    };
    let local_addr = (tunnel.local_host.clone(), tunnel.local_port);
    if let Err(error) = probe_connect(&socket, &local_addr).await {
        tracing::warn!(%error, "udp local target unreachable");
        return;
    }
    let _ = &dialer_cache;

    let socket = Arc::new(socket);
    let last_addr_hash = Arc::new(std::sync::Mutex::new([0u8; 8]));

    let (stream_read, stream_write) = tokio::io::split(stream);

    let to_udp = stream_to_udp(stream_read, socket.clone(), tunnel.clone(), last_addr_hash.clone());
    let to_stream = udp_to_stream(stream_write, socket, tunnel, last_addr_hash);

    let _ = tokio::join!(to_udp, to_stream);
}

async fn probe_connect(socket: &UdpSocket, target: &(String, u16)) -> std::io::Result<()> {
    socket.connect((target.0.as_str(), target.1)).await
}

async fn stream_to_udp<R>(
    mut reader: R,
    socket: Arc<UdpSocket>,
    tunnel: Arc<ActiveTunnel>,
    last_addr_hash: Arc<std::sync::Mutex<[u8; 8]>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&header[2..10]);
        *last_addr_hash.lock().unwrap() = hash;

        if len > MAX_DATAGRAM_SIZE {
            tracing::warn!(len, "udp frame exceeds max datagram size, closing");
            break;
        }
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        if socket.send(&payload).await.is_err() {
            break;
        }
        tunnel.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }
}

async fn udp_to_stream<W>(
    mut writer: W,
    socket: Arc<UdpSocket>,
    tunnel: Arc<ActiveTunnel>,
    last_addr_hash: Arc<std::sync::Mutex<[u8; 8]>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = match timeout(UDP_RECV_DEADLINE, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
            // Deadline elapsed is a cancellation-check point, not an
            // error; loop again.
            Err(_) => continue,
        };

        let hash = *last_addr_hash.lock().unwrap();
        let mut frame = Vec::with_capacity(HEADER_SIZE + received);
        frame.extend_from_slice(&(received as u16).to_be_bytes());
        frame.extend_from_slice(&hash);
        frame.extend_from_slice(&buf[..received]);

        if writer.write_all(&frame).await.is_err() {
            break;
        }
        tunnel
            .bytes_out
            .fetch_add(received as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::TunnelKind;
    use std::sync::atomic::AtomicU64;
    use tokio::net::UdpSocket as TokioUdpSocket;

    fn sample_tunnel(port: u16) -> Arc<ActiveTunnel> {
        Arc::new(ActiveTunnel {
            tunnel_id: "u1".into(),
            name: "game".into(),
            kind: TunnelKind::Udp,
            local_host: "127.0.0.1".into(),
            local_port: port,
            url: None,
            remote_addr: None,
            remote_port: None,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn stream_frame_is_delivered_as_a_single_udp_datagram() {
        let local = TokioUdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = local.local_addr().unwrap().port();
        let tunnel = sample_tunnel(port);

        let (client_side, server_side) = tokio::io::duplex(4096);
        let server_side = BufReader::new(server_side);
        let handler = tokio::spawn(handle(server_side, tunnel, ResolvedAddrCache::new()));

        let mut client_side = client_side;
        let payload = b"ping";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&[7u8; 8]);
        frame.extend_from_slice(payload);
        client_side.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, peer) = local.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], payload);

        local.send_to(b"pong", peer).await.unwrap();
        let mut response_header = [0u8; HEADER_SIZE];
        client_side.read_exact(&mut response_header).await.unwrap();
        let len = u16::from_be_bytes([response_header[0], response_header[1]]) as usize;
        assert_eq!(len, 4);
        assert_eq!(&response_header[2..10], &[7u8; 8]);
        let mut response_body = vec![0u8; len];
        client_side.read_exact(&mut response_body).await.unwrap();
        assert_eq!(response_body, b"pong");

        drop(client_side);
        let _ = tokio::time::timeout(Duration::from_secs(5), handler).await;
    }
}

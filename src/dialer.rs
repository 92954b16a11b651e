//! Local dialer (§4.8): connects proxied streams to the local service a
//! tunnel points at, using a Happy-Eyeballs-style race between IPv4 and
//! a staggered IPv6 attempt, with a small process-wide cache of which
//! address family won last time for a given port.
//!
//! Grounded on `safe_dns::DnsCache` (TTL- and
//! capacity-bounded `RwLock<HashMap>`, entries evicted on lookup
//! failure), generalized here from a DNS answer cache to a "which local
//! address won" cache since `localhost` resolution is the only lookup
//! this layer ever does.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::DialError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const IPV6_STAGGER: Duration = Duration::from_millis(50);

/// Caches, per local port, which loopback address family last
/// succeeded, so repeat dials to a stable local service skip the race.
#[derive(Default)]
pub struct ResolvedAddrCache {
    winners: RwLock<HashMap<u16, IpAddr>>,
}

impl ResolvedAddrCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get(&self, port: u16) -> Option<IpAddr> {
        self.winners.read().unwrap().get(&port).copied()
    }

    fn record(&self, port: u16, addr: IpAddr) {
        self.winners.write().unwrap().insert(port, addr);
    }

    /// Drop a cached winner after a dial to it fails, so the next call
    /// re-races instead of repeatedly trying a dead address.
    fn evict(&self, port: u16) {
        self.winners.write().unwrap().remove(&port);
    }
}

/// Dial the local service behind `host:port`. When `host` resolves to
/// loopback ambiguity (i.e. is literally `localhost`), race IPv4
/// immediately against IPv6 started `IPV6_STAGGER` later, keep whichever
/// connects first, and drop the other. Any other host is dialed
/// directly without a cache.
pub async fn dial(
    cache: &ResolvedAddrCache,
    host: &str,
    port: u16,
) -> Result<TcpStream, DialError> {
    if host != "localhost" {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| DialError::Connect(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "unparseable host:port"),
            ))?;
        return dial_one(addr).await;
    }

    if let Some(winner) = cache.get(port) {
        match dial_one(SocketAddr::new(winner, port)).await {
            Ok(stream) => return Ok(stream),
            Err(_) => cache.evict(port),
        }
    }

    happy_eyeballs(cache, port).await
}

/// Races an immediate IPv4 dial against an IPv6 dial started
/// `IPV6_STAGGER` later, via two spawned tasks so neither leg blocks the
/// other once one wins. Whichever answers first wins; the other keeps
/// running in the background and its socket is simply dropped.
async fn happy_eyeballs(cache: &ResolvedAddrCache, port: u16) -> Result<TcpStream, DialError> {
    let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port);

    let mut v4_task = tokio::spawn(dial_one(v4));
    let mut v6_task = tokio::spawn(async move {
        tokio::time::sleep(IPV6_STAGGER).await;
        dial_one(v6).await
    });

    let mut v4_result: Option<Result<TcpStream, DialError>> = None;
    let mut v6_result: Option<Result<TcpStream, DialError>> = None;

    loop {
        tokio::select! {
            r = &mut v4_task, if v4_result.is_none() => {
                v4_result = Some(r.expect("dial task panicked"));
            }
            r = &mut v6_task, if v6_result.is_none() => {
                v6_result = Some(r.expect("dial task panicked"));
            }
        }

        if matches!(v4_result, Some(Ok(_))) {
            cache.record(port, v4.ip());
            return Ok(v4_result.unwrap().unwrap());
        }
        if matches!(v6_result, Some(Ok(_))) {
            cache.record(port, v6.ip());
            return Ok(v6_result.unwrap().unwrap());
        }
        if let (Some(Err(_)), Some(Err(_))) = (&v4_result, &v6_result) {
            let v4_err = v4_result.unwrap().unwrap_err().to_string();
            let v6_err = v6_result.unwrap().unwrap_err().to_string();
            return Err(DialError::HappyEyeballsFailed {
                v4: v4_err,
                v6: v6_err,
            });
        }
    }
}

async fn dial_one(addr: SocketAddr) -> Result<TcpStream, DialError> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream
                .set_nodelay(true)
                .map_err(|e| DialError::Connect(addr, e))?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(DialError::Connect(addr, e)),
        Err(_) => Err(DialError::Timeout(DIAL_TIMEOUT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_real_loopback_listener_by_explicit_ip() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let cache = ResolvedAddrCache::new();
        let stream = dial(&cache, "127.0.0.1", port).await.unwrap();
        drop(stream);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn localhost_races_and_connects_when_ipv4_listener_is_up() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let cache = ResolvedAddrCache::new();
        let stream = dial(&cache, "localhost", port).await.unwrap();
        drop(stream);
        accept.await.unwrap();
        assert_eq!(
            cache.get(port),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[tokio::test]
    async fn dial_to_a_closed_port_fails() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cache = ResolvedAddrCache::new();
        let result = dial(&cache, "127.0.0.1", port).await;
        assert!(result.is_err());
    }
}

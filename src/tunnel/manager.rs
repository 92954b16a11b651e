//! Registry of tunnels active on the current session (§3, §4.4).
//!
//! Grounded on `state::ProxyMetrics` (atomic counters read
//! without locking) and `state::AppState` (shared, cheaply-cloned
//! handle), generalized from one global metrics struct to a concurrent
//! map of per-tunnel metrics keyed by tunnel id, using `dashmap` the way
//! `aether-hub` and the `bore`/`manhpham90vn` tunnel servers do for their
//! connection tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::sleep;

use crate::protocol::message::TunnelKind;

/// A tunnel the server has created on this client's behalf.
pub struct ActiveTunnel {
    pub tunnel_id: String,
    pub name: String,
    pub kind: TunnelKind,
    pub local_host: String,
    pub local_port: u16,
    pub url: Option<String>,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
}

impl ActiveTunnel {
    pub fn record_open(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, in_bytes: u64, out_bytes: u64) {
        self.bytes_in.fetch_add(in_bytes, Ordering::Relaxed);
        self.bytes_out.fetch_add(out_bytes, Ordering::Relaxed);
    }
}

/// How long `lookup_with_retry` will keep polling before giving up
/// (§4.4: a stream can arrive slightly before `TunnelCreated` is
/// processed locally, since the two travel over different streams).
const LOOKUP_RETRY_ATTEMPTS: u32 = 50;
const LOOKUP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Default)]
pub struct TunnelManager {
    tunnels: Arc<DashMap<String, Arc<ActiveTunnel>>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, tunnel: ActiveTunnel) -> Arc<ActiveTunnel> {
        let tunnel = Arc::new(tunnel);
        self.tunnels.insert(tunnel.tunnel_id.clone(), tunnel.clone());
        tunnel
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<ActiveTunnel>> {
        self.tunnels.get(tunnel_id).map(|entry| entry.clone())
    }

    /// Poll for a tunnel that may not have been registered yet. Used by
    /// the stream acceptor, which can race ahead of the control-stream
    /// handler that inserts the tunnel on `TunnelCreated`.
    pub async fn lookup_with_retry(&self, tunnel_id: &str) -> Option<Arc<ActiveTunnel>> {
        for attempt in 0..LOOKUP_RETRY_ATTEMPTS {
            if let Some(tunnel) = self.get(tunnel_id) {
                return Some(tunnel);
            }
            if attempt + 1 < LOOKUP_RETRY_ATTEMPTS {
                sleep(LOOKUP_RETRY_INTERVAL).await;
            }
        }
        None
    }

    /// Remove and return the tunnel, e.g. on `TunnelClosed` or session
    /// teardown. Returning the removed entry lets the caller snapshot
    /// final byte counts before it emits `ClientEvent::TunnelClosed`.
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<ActiveTunnel>> {
        self.tunnels.remove(tunnel_id).map(|(_, tunnel)| tunnel)
    }

    pub fn clear(&self) -> Vec<Arc<ActiveTunnel>> {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<ActiveTunnel>> {
        self.tunnels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> ActiveTunnel {
        ActiveTunnel {
            tunnel_id: id.into(),
            name: "web".into(),
            kind: TunnelKind::Http,
            local_host: "127.0.0.1".into(),
            local_port: 8080,
            url: Some("https://web.example.test".into()),
            remote_addr: None,
            remote_port: None,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let manager = TunnelManager::new();
        manager.insert(sample("t1"));
        let tunnel = manager.get("t1").unwrap();
        assert_eq!(tunnel.name, "web");
    }

    #[tokio::test]
    async fn lookup_with_retry_finds_a_tunnel_inserted_after_the_call_starts() {
        let manager = TunnelManager::new();
        let manager2 = manager.clone();
        let handle = tokio::spawn(async move { manager2.lookup_with_retry("late").await });
        sleep(Duration::from_millis(30)).await;
        manager.insert(sample("late"));
        let result = handle.await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn remove_returns_the_final_snapshot() {
        let manager = TunnelManager::new();
        let tunnel = manager.insert(sample("t2"));
        tunnel.record_bytes(10, 20);
        let removed = manager.remove("t2").unwrap();
        assert_eq!(removed.bytes_in.load(Ordering::Relaxed), 10);
        assert!(manager.get("t2").is_none());
    }
}

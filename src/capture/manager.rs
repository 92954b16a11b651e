//! Tunnel id → `RingBuffer<CapturedExchange>` map (§4.9 Manager).
//!
//! Grounded on the `state::AppState`/`ProxyMetrics` sharing
//! pattern (one cheaply-cloned handle threaded through every task),
//! using `dashmap` for the per-tunnel buffer table the same way
//! `tunnel::manager::TunnelManager` does for active tunnels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::http::CapturedExchange;
use super::ring_buffer::RingBuffer;

#[derive(Clone)]
pub struct CaptureManager {
    buffers: Arc<DashMap<String, Arc<RingBuffer<CapturedExchange>>>>,
    capacity_per_tunnel: usize,
    enabled: Arc<AtomicBool>,
}

impl CaptureManager {
    pub fn new(capacity_per_tunnel: usize, enabled: bool) -> Self {
        Self {
            buffers: Arc::new(DashMap::new()),
            capacity_per_tunnel,
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Reflects the server-issued capability bit; toggled at connect
    /// time, not something the client decides on its own.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn get_or_create(&self, tunnel_id: &str) -> Arc<RingBuffer<CapturedExchange>> {
        self.buffers
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Arc::new(RingBuffer::new(self.capacity_per_tunnel)))
            .clone()
    }

    pub fn record(&self, tunnel_id: &str, exchange: CapturedExchange) {
        self.get_or_create(tunnel_id).append(exchange);
    }

    pub fn lookup(&self, id: &str) -> Option<CapturedExchange> {
        self.buffers
            .iter()
            .find_map(|entry| entry.value().lookup(id))
    }

    /// Visit every buffer under the map's own locking; used by the
    /// inspector's list/summary endpoints which must scan all tunnels.
    pub fn for_each<F: FnMut(&str, &RingBuffer<CapturedExchange>)>(&self, mut visitor: F) {
        for entry in self.buffers.iter() {
            visitor(entry.key(), entry.value());
        }
    }

    pub fn clear_all(&self) {
        for entry in self.buffers.iter() {
            entry.value().clear();
        }
    }
}

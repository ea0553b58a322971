//! Process-wide metrics registry.
//!
//! Counters are cumulative since process start and never reset; the control
//! plane computes deltas from streamed snapshots. Gauges move both ways but
//! stay bounded by the flows that exist. Everything on the hot path is an
//! atomic; the only lock is the latency sample window, touched once per
//! completed flow.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Most recent flow latencies kept for the avg/p99 aggregates.
const LATENCY_WINDOW: usize = 1024;
/// EWMA smoothing divisor for per-backend latency.
const EWMA_WEIGHT: u64 = 8;

/// Cloneable handle shared by every task in the process.
#[derive(Clone, Default)]
pub struct DataPlaneMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rejected_rate_limited: AtomicU64,
    rejected_no_backend: AtomicU64,
    udp_sessions_created: AtomicU64,
    udp_sessions_active: AtomicI64,
    udp_sessions_swept: AtomicU64,
    udp_packets_dropped: AtomicU64,
    latency: Mutex<LatencyWindow>,
    backends: DashMap<SocketAddr, Arc<BackendCounters>>,
}

/// Per-backend counters; created on first use and kept for the lifetime of
/// the process so cumulative totals survive pool reconfiguration.
#[derive(Debug, Default)]
pub struct BackendCounters {
    address: String,
    active_connections: AtomicI64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    // Microseconds, EWMA-smoothed. Racy read-modify-write is acceptable: a
    // lost update skews the estimate by one sample.
    avg_latency_micros: AtomicU64,
}

impl BackendCounters {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn flow_started(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_finished(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, latency_ms: f64) {
        let sample = (latency_ms * 1_000.0) as u64;
        let old = self.avg_latency_micros.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            old - old / EWMA_WEIGHT + sample / EWMA_WEIGHT
        };
        self.avg_latency_micros.store(new, Ordering::Relaxed);
    }

    pub fn active(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_micros.load(Ordering::Relaxed) as f64 / 1_000.0
    }
}

#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }
}

impl LatencyWindow {
    fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    fn aggregates(&self) -> (f64, f64) {
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = (sorted.len() * 99).div_ceil(100);
        let p99 = sorted[rank.saturating_sub(1).min(sorted.len() - 1)];
        (avg, p99)
    }
}

/// Point-in-time view of every aggregate, consumed by the RPC metrics
/// stream.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rejected_rate_limited: u64,
    pub rejected_no_backend: u64,
    pub udp_sessions_created: u64,
    pub udp_sessions_active: i64,
    pub udp_sessions_swept: u64,
    pub udp_packets_dropped: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub backends: Vec<BackendSnapshot>,
}

#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub address: String,
    pub active_connections: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
}

impl DataPlaneMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-backend counters, created on first reference.
    pub fn backend(&self, addr: SocketAddr) -> Arc<BackendCounters> {
        self.inner
            .backends
            .entry(addr)
            .or_insert_with(|| {
                Arc::new(BackendCounters {
                    address: addr.to_string(),
                    ..BackendCounters::default()
                })
            })
            .clone()
    }

    pub fn flow_started(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_finished(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// Bytes ferried client-to-backend.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.inner.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes ferried backend-to-client.
    pub fn record_bytes_received(&self, bytes: u64) {
        self.inner.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self) {
        self.inner
            .rejected_rate_limited
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_backend(&self) {
        self.inner.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.inner.udp_sessions_created.fetch_add(1, Ordering::Relaxed);
        self.inner.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_sessions_swept(&self, count: u64) {
        self.inner.udp_sessions_swept.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_udp_drop(&self) {
        self.inner.udp_packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Whole-flow latency, fed to both the global window and the backend
    /// EWMA.
    pub fn record_latency_ms(&self, latency_ms: f64) {
        self.inner.latency.lock().push(latency_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg_latency_ms, p99_latency_ms) = self.inner.latency.lock().aggregates();
        let mut backends: Vec<BackendSnapshot> = self
            .inner
            .backends
            .iter()
            .map(|entry| BackendSnapshot {
                address: entry.value().address().to_string(),
                active_connections: entry.value().active(),
                total_requests: entry.value().total(),
                failed_requests: entry.value().failed(),
                avg_latency_ms: entry.value().avg_latency_ms(),
            })
            .collect();
        backends.sort_by(|a, b| a.address.cmp(&b.address));

        MetricsSnapshot {
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            rejected_rate_limited: self.inner.rejected_rate_limited.load(Ordering::Relaxed),
            rejected_no_backend: self.inner.rejected_no_backend.load(Ordering::Relaxed),
            udp_sessions_created: self.inner.udp_sessions_created.load(Ordering::Relaxed),
            udp_sessions_active: self.inner.udp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_swept: self.inner.udp_sessions_swept.load(Ordering::Relaxed),
            udp_packets_dropped: self.inner.udp_packets_dropped.load(Ordering::Relaxed),
            avg_latency_ms,
            p99_latency_ms,
            backends,
        }
    }
}

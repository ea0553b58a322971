//! Shared data-plane state and configuration apply.
//!
//! `ProxyState` owns the published snapshot, the balancer built from it,
//! the per-backend breakers, the admission limiter, the NAT table, and the
//! metrics registry. Snapshots are copy-on-write: handler tasks clone the
//! `Arc` once at flow start and never observe a torn pool. Applying a new
//! snapshot only swaps pointers and adjusts policy objects; it never blocks
//! the hot path.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use l4_balance::{Backend, BackendSlot, LoadBalancer, SelectError};
use l4_metrics::DataPlaneMetrics;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerMap;
use crate::config::{BreakerParams, ConfigSnapshot, RateLimitParams};
use crate::nat::NatTable;
use crate::rate_limit::RateLimiter;

/// Caps the breaker-denied reselection loop independently of pool size.
const MAX_SELECT_ATTEMPTS: usize = 64;

pub struct ProxyState {
    snapshot: ArcSwapOption<ConfigSnapshot>,
    balancer: ArcSwapOption<LoadBalancer>,
    breakers: BreakerMap,
    limiter: RateLimiter,
    nat: NatTable,
    metrics: DataPlaneMetrics,
    configured: Notify,
    drain: DrainControl,
    tcp_listen: watch::Sender<Option<SocketAddr>>,
    udp_listen: watch::Sender<Option<SocketAddr>>,
}

/// Drain progresses in two steps: `started` stops acceptors immediately,
/// `abort` fires at the deadline and tears down whatever is still running.
struct DrainControl {
    draining: AtomicBool,
    started: CancellationToken,
    abort: CancellationToken,
}

impl Default for ProxyState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyState {
    pub fn new() -> Self {
        let (tcp_listen, _) = watch::channel(None);
        let (udp_listen, _) = watch::channel(None);
        Self {
            snapshot: ArcSwapOption::empty(),
            balancer: ArcSwapOption::empty(),
            breakers: BreakerMap::new(BreakerParams {
                error_threshold: 5,
                open_for: Duration::from_secs(30),
            }),
            limiter: RateLimiter::new(RateLimitParams {
                requests_per_second: 1_000.0,
                burst: 100.0,
            }),
            nat: NatTable::default(),
            metrics: DataPlaneMetrics::new(),
            configured: Notify::new(),
            drain: DrainControl {
                draining: AtomicBool::new(false),
                started: CancellationToken::new(),
                abort: CancellationToken::new(),
            },
            tcp_listen,
            udp_listen,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshot.load_full()
    }

    pub fn balancer(&self) -> Option<Arc<LoadBalancer>> {
        self.balancer.load_full()
    }

    pub fn breakers(&self) -> &BreakerMap {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn metrics(&self) -> &DataPlaneMetrics {
        &self.metrics
    }

    pub fn is_configured(&self) -> bool {
        self.snapshot.load().is_some()
    }

    /// Park until the first snapshot is published.
    pub async fn wait_for_config(&self) {
        while !self.is_configured() {
            let notified = self.configured.notified();
            if self.is_configured() {
                return;
            }
            notified.await;
        }
    }

    /// Replace the full snapshot. The caller has already validated it; this
    /// step only rebuilds derived state and publishes.
    pub fn apply_config(&self, snapshot: ConfigSnapshot) {
        let addrs: Vec<SocketAddr> = snapshot.backends.iter().map(|b| b.addr).collect();
        self.breakers.apply(snapshot.breaker, &addrs);
        self.limiter.set_params(snapshot.rate_limit);
        for backend in &snapshot.backends {
            // Materialize per-backend counters so the metrics stream shows
            // zeroed entries for fresh addresses.
            let _ = self.metrics.backend(backend.addr);
        }

        let balancer = LoadBalancer::new(snapshot.backends.clone(), snapshot.algorithm);
        self.balancer.store(Some(Arc::new(balancer)));

        let tcp_listen = snapshot.tcp_listen;
        let udp_listen = snapshot.udp_listen;
        self.snapshot.store(Some(Arc::new(snapshot)));

        // Acceptors rebind only when the address actually changed.
        self.tcp_listen.send_if_modified(|current| {
            if *current == Some(tcp_listen) {
                false
            } else {
                *current = Some(tcp_listen);
                true
            }
        });
        self.udp_listen.send_if_modified(|current| {
            if *current == udp_listen {
                false
            } else {
                *current = udp_listen;
                true
            }
        });

        self.configured.notify_waiters();
        info!(backends = addrs.len(), "configuration snapshot published");
    }

    /// Replace only the backend pool and health map (`ReloadBackends`).
    /// Fails if no snapshot exists yet. A reload that keeps the same
    /// addresses and weights is a pure health update and toggles flags in
    /// place, preserving selection state and counters.
    pub fn apply_backends(&self, backends: Vec<Backend>) -> Result<usize, NotConfigured> {
        let current = self.snapshot.load_full().ok_or(NotConfigured)?;
        let loaded = backends.len();

        let same_pool = current.backends.len() == backends.len()
            && backends.iter().all(|b| {
                current
                    .backends
                    .iter()
                    .any(|c| c.addr == b.addr && c.weight == b.weight)
            });
        let mut next = (*current).clone();
        next.backends = backends;
        if same_pool {
            let health: Vec<(SocketAddr, bool)> =
                next.backends.iter().map(|b| (b.addr, b.healthy)).collect();
            self.apply_backend_health(&health);
            self.snapshot.store(Some(Arc::new(next)));
        } else {
            self.apply_config(next);
        }
        Ok(loaded)
    }

    /// Toggle health flags in place, without touching the pool, counters,
    /// or selection state.
    pub fn apply_backend_health(&self, health: &[(SocketAddr, bool)]) -> usize {
        let Some(balancer) = self.balancer.load_full() else {
            return 0;
        };
        let mut applied = 0;
        for (addr, healthy) in health {
            if balancer.set_healthy(*addr, *healthy) {
                applied += 1;
            } else {
                debug!(%addr, "health update for unknown backend ignored");
            }
        }
        applied
    }

    /// Select a backend for a new flow: load-balance over healthy backends,
    /// re-consulting with breaker-denied backends excluded, until the pool
    /// is exhausted. `exclude` is shared with the caller so connect-failed
    /// backends stay excluded across retries.
    pub fn admit_backend(
        &self,
        balancer: &LoadBalancer,
        client_ip: IpAddr,
        exclude: &mut Vec<SocketAddr>,
    ) -> Result<Arc<BackendSlot>, SelectError> {
        let attempts = balancer.slots().len().min(MAX_SELECT_ATTEMPTS);
        for _ in 0..=attempts {
            let slot = balancer.select(Some(client_ip), exclude)?;
            if self.breakers.allow(slot.addr()) {
                return Ok(slot);
            }
            balancer.release(&slot);
            exclude.push(slot.addr());
        }
        Err(SelectError::NoBackendsAvailable)
    }

    pub fn is_draining(&self) -> bool {
        self.drain.draining.load(Ordering::Relaxed)
    }

    /// Fires when acceptors must stop taking new flows.
    pub fn drain_started(&self) -> CancellationToken {
        self.drain.started.clone()
    }

    /// Fires when still-running flows must abort.
    pub fn drain_abort(&self) -> CancellationToken {
        self.drain.abort.clone()
    }

    /// Graceful drain: stop admission now, wait for flows to finish until
    /// the deadline, then abort the rest. Returns the number of flows
    /// aborted at the deadline.
    pub async fn begin_drain(&self, grace: Duration) -> DrainOutcome {
        let deadline = Instant::now() + grace;
        if self.drain.draining.swap(true, Ordering::SeqCst) {
            warn!("drain requested while already draining");
        }
        self.drain.started.cancel();

        let nat_drain = self.nat.drain(deadline);
        let tcp_drain = async {
            while self.metrics.active_connections() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        let (forced_sessions, _) = tokio::join!(nat_drain, tcp_drain);

        let aborted_connections = self.metrics.active_connections().max(0) as usize;
        self.drain.abort.cancel();

        DrainOutcome {
            aborted: aborted_connections + forced_sessions,
            clean: aborted_connections == 0 && forced_sessions == 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainOutcome {
    /// Flows (TCP connections plus UDP sessions) aborted at the deadline.
    pub aborted: usize,
    pub clean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("proxy is not configured yet")]
pub struct NotConfigured;

impl ProxyState {
    /// Watch the TCP listen address for acceptor rebinds.
    pub fn tcp_listen_watch(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.tcp_listen.subscribe()
    }

    pub fn udp_listen_watch(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.udp_listen.subscribe()
    }

    /// One idle sweep over the NAT table; the TTL is the current snapshot's
    /// idle timeout.
    pub fn sweep_sessions(&self, now: Instant) -> usize {
        let ttl = self
            .snapshot
            .load()
            .as_ref()
            .map(|s| s.timeouts.idle)
            .unwrap_or(Duration::from_secs(60));
        let swept = self.nat.sweep(now, ttl);
        if swept > 0 {
            self.metrics.record_sessions_swept(swept as u64);
            debug!(swept, "collected idle UDP sessions");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use l4_balance::Algorithm;

    use super::*;
    use crate::config::Timeouts;

    fn snapshot(backend_ports: &[u16]) -> ConfigSnapshot {
        ConfigSnapshot {
            tcp_listen: "127.0.0.1:18080".parse().unwrap(),
            udp_listen: None,
            backends: backend_ports
                .iter()
                .map(|port| {
                    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
                    Backend {
                        address: addr.to_string(),
                        addr,
                        weight: 100,
                        healthy: true,
                        health_check: Default::default(),
                    }
                })
                .collect(),
            algorithm: Algorithm::RoundRobin,
            session_affinity: false,
            rate_limit: RateLimitParams {
                requests_per_second: 1_000.0,
                burst: 100.0,
            },
            timeouts: Timeouts {
                connect: Duration::from_secs(5),
                idle: Duration::from_secs(60),
                read: Duration::from_secs(30),
            },
            breaker: BreakerParams {
                error_threshold: 3,
                open_for: Duration::from_secs(30),
            },
        }
    }

    #[test]
    fn snapshot_publication_is_atomic_and_pinned() {
        let state = ProxyState::new();
        assert!(!state.is_configured());
        state.apply_config(snapshot(&[9001, 9002]));
        let pinned = state.snapshot().expect("configured");
        state.apply_config(snapshot(&[9003]));
        // The pinned snapshot is unchanged; new loads see the new pool.
        assert_eq!(pinned.backends.len(), 2);
        assert_eq!(state.snapshot().unwrap().backends.len(), 1);
    }

    #[test]
    fn listen_watch_fires_only_on_change() {
        let state = ProxyState::new();
        let mut rx = state.tcp_listen_watch();
        state.apply_config(snapshot(&[9001]));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();
        // Same listen address: no rebind signal.
        state.apply_config(snapshot(&[9001, 9002]));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn admit_backend_skips_breaker_denied_backends() {
        let state = ProxyState::new();
        state.apply_config(snapshot(&[9001, 9002]));
        let balancer = state.balancer().unwrap();
        let denied: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let now = Instant::now();
        for _ in 0..3 {
            state.breakers().on_failure_at(denied, now);
        }
        for _ in 0..5 {
            let client: IpAddr = "10.1.1.1".parse().unwrap();
            let slot = state
                .admit_backend(&balancer, client, &mut Vec::new())
                .expect("one healthy");
            assert_ne!(slot.addr(), denied);
            balancer.release(&slot);
        }
    }

    #[test]
    fn admit_backend_fails_when_all_denied() {
        let state = ProxyState::new();
        state.apply_config(snapshot(&[9001, 9002]));
        let balancer = state.balancer().unwrap();
        let now = Instant::now();
        for port in [9001u16, 9002] {
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            for _ in 0..3 {
                state.breakers().on_failure_at(addr, now);
            }
        }
        let client: IpAddr = "10.1.1.1".parse().unwrap();
        assert_eq!(
            state
                .admit_backend(&balancer, client, &mut Vec::new())
                .unwrap_err(),
            SelectError::NoBackendsAvailable
        );
    }

    #[test]
    fn health_updates_do_not_replace_the_pool() {
        let state = ProxyState::new();
        state.apply_config(snapshot(&[9001, 9002]));
        let balancer = state.balancer().unwrap();
        let sick: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(state.apply_backend_health(&[(sick, false)]), 1);
        // Same balancer object; flag flipped in place.
        assert!(Arc::ptr_eq(&balancer, &state.balancer().unwrap()));
        assert_eq!(balancer.healthy_count(), 1);
        assert_eq!(state.apply_backend_health(&[(sick, true)]), 1);
        assert_eq!(balancer.healthy_count(), 2);
    }

    #[test]
    fn reload_backends_requires_configuration() {
        let state = ProxyState::new();
        assert_eq!(state.apply_backends(vec![]).unwrap_err(), NotConfigured);
    }

    #[test]
    fn health_only_reload_keeps_the_balancer() {
        let state = ProxyState::new();
        state.apply_config(snapshot(&[9001, 9002]));
        let balancer = state.balancer().unwrap();

        let mut reloaded = snapshot(&[9001, 9002]).backends;
        reloaded[0].healthy = false;
        assert_eq!(state.apply_backends(reloaded).unwrap(), 2);

        assert!(Arc::ptr_eq(&balancer, &state.balancer().unwrap()));
        assert_eq!(balancer.healthy_count(), 1);
        assert!(!state.snapshot().unwrap().backends[0].healthy);
    }

    #[test]
    fn pool_changing_reload_rebuilds_the_balancer() {
        let state = ProxyState::new();
        state.apply_config(snapshot(&[9001, 9002]));
        let balancer = state.balancer().unwrap();

        assert_eq!(state.apply_backends(snapshot(&[9001]).backends).unwrap(), 1);
        assert!(!Arc::ptr_eq(&balancer, &state.balancer().unwrap()));
        assert_eq!(state.snapshot().unwrap().backends.len(), 1);
    }
}

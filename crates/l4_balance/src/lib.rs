//! Backend pool and load-balancing algorithms.
//!
//! A [`LoadBalancer`] is built once per configuration snapshot and shared by
//! every handler task spawned under that snapshot. Selection is safe for
//! concurrent callers: round-robin and least-connections use atomics, the
//! smooth weighted scheduler takes a short critical section, and the
//! consistent-hash ring is immutable after construction. Health toggles flip
//! an atomic flag in place so the pool itself is never torn.

mod ring;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::ring::{hash_ip, HashRing};

/// Health-check descriptor carried on each backend for diagnostic symmetry
/// with the control plane. The data plane never probes; only the healthy
/// flag is consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub path: String,
}

/// Immutable backend descriptor as it arrives from configuration.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Address label as configured (`host:port`).
    pub address: String,
    /// Resolved socket address; unique within a snapshot.
    pub addr: SocketAddr,
    pub weight: u32,
    pub healthy: bool,
    pub health_check: HealthCheck,
}

/// Shared per-backend state inside a pool. Handler tasks hold an
/// `Arc<BackendSlot>` for the flow's lifetime, so bookkeeping survives a
/// snapshot swap mid-flow.
#[derive(Debug)]
pub struct BackendSlot {
    address: String,
    addr: SocketAddr,
    weight: u32,
    health_check: HealthCheck,
    healthy: AtomicBool,
    active: AtomicU64,
}

impl BackendSlot {
    fn new(backend: Backend) -> Self {
        Self {
            address: backend.address,
            addr: backend.addr,
            weight: backend.weight.max(1),
            health_check: backend.health_check,
            healthy: AtomicBool::new(backend.healthy),
            active: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The configured `host:port` label.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health_check(&self) -> &HealthCheck {
        &self.health_check
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Flows currently pinned to this backend.
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Selection algorithm. Names are authoritative: unknown strings are a
/// configuration error, never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
    ConsistentHash,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Weighted => "weighted",
            Self::LeastConnections => "least_connections",
            Self::ConsistentHash => "consistent_hash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown load-balancing algorithm {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted" | "weighted_round_robin" => Ok(Self::Weighted),
            "least_connections" => Ok(Self::LeastConnections),
            "consistent_hash" => Ok(Self::ConsistentHash),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no backends available")]
    NoBackendsAvailable,
}

/// One pool of backends plus the selection state for a single algorithm.
#[derive(Debug)]
pub struct LoadBalancer {
    slots: Vec<Arc<BackendSlot>>,
    algorithm: Algorithm,
    cursor: AtomicUsize,
    // Smooth weighted round-robin current weights, indexed like `slots`.
    smooth: Mutex<Vec<i64>>,
    ring: HashRing,
}

impl LoadBalancer {
    pub fn new(backends: Vec<Backend>, algorithm: Algorithm) -> Self {
        let labels: Vec<String> = backends.iter().map(|b| b.address.clone()).collect();
        let slots: Vec<Arc<BackendSlot>> = backends
            .into_iter()
            .map(|b| Arc::new(BackendSlot::new(b)))
            .collect();
        let smooth = Mutex::new(vec![0i64; slots.len()]);
        let ring = HashRing::build(&labels);
        Self {
            slots,
            algorithm,
            cursor: AtomicUsize::new(0),
            smooth,
            ring,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn slots(&self) -> &[Arc<BackendSlot>] {
        &self.slots
    }

    pub fn slot(&self, addr: SocketAddr) -> Option<&Arc<BackendSlot>> {
        self.slots.iter().find(|s| s.addr == addr)
    }

    pub fn healthy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_healthy()).count()
    }

    /// Toggle a backend's health flag in place. Returns false if the address
    /// is not part of this pool.
    pub fn set_healthy(&self, addr: SocketAddr, healthy: bool) -> bool {
        match self.slot(addr) {
            Some(slot) => {
                slot.set_healthy(healthy);
                true
            }
            None => false,
        }
    }

    /// Select one backend for a new flow, skipping unhealthy backends and
    /// any address in `exclude` (used to re-consult after a circuit-breaker
    /// denial or a connect failure). The chosen slot's active-connection
    /// counter is incremented; balance it with [`LoadBalancer::release`] on
    /// flow completion.
    pub fn select(
        &self,
        client: Option<IpAddr>,
        exclude: &[SocketAddr],
    ) -> Result<Arc<BackendSlot>, SelectError> {
        let eligible: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_healthy() && !exclude.contains(&slot.addr))
            .map(|(idx, _)| idx)
            .collect();
        if eligible.is_empty() {
            return Err(SelectError::NoBackendsAvailable);
        }

        let idx = match self.algorithm {
            Algorithm::RoundRobin => self.round_robin(&eligible),
            Algorithm::Weighted => self.smooth_weighted(&eligible),
            Algorithm::LeastConnections => self.least_connections(&eligible),
            Algorithm::ConsistentHash => match client {
                Some(ip) => self.consistent_hash(ip, &eligible),
                // No address to pin on (should not happen for socket flows);
                // degrade to round-robin over the eligible set.
                None => self.round_robin(&eligible),
            },
        };

        let slot = &self.slots[idx];
        slot.active.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(slot))
    }

    /// Decrement the active-connection counter taken by `select`.
    pub fn release(&self, slot: &BackendSlot) {
        let _ = slot
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn round_robin(&self, eligible: &[usize]) -> usize {
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        eligible[tick % eligible.len()]
    }

    // Smooth weighted round-robin: every eligible backend gains its weight,
    // the largest current weight wins and pays back the eligible weight sum.
    // Interleaves rather than bursting all of one backend's share.
    fn smooth_weighted(&self, eligible: &[usize]) -> usize {
        let mut smooth = self.smooth.lock();
        let mut total: i64 = 0;
        let mut best = eligible[0];
        for &idx in eligible {
            let weight = i64::from(self.slots[idx].weight);
            smooth[idx] += weight;
            total += weight;
            if smooth[idx] > smooth[best] {
                best = idx;
            }
        }
        smooth[best] -= total;
        best
    }

    fn least_connections(&self, eligible: &[usize]) -> usize {
        let mut best = eligible[0];
        let mut best_active = self.slots[best].active_connections();
        for &idx in &eligible[1..] {
            let active = self.slots[idx].active_connections();
            if active < best_active {
                best = idx;
                best_active = active;
            }
        }
        best
    }

    fn consistent_hash(&self, ip: IpAddr, eligible: &[usize]) -> usize {
        let mut mask = vec![false; self.slots.len()];
        for &idx in eligible {
            mask[idx] = true;
        }
        self.ring
            .select(hash_ip(ip), |idx| mask[idx])
            // eligible is non-empty, so the walk always terminates on a slot
            .unwrap_or(eligible[0])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;

    fn backend(port: u16, weight: u32) -> Backend {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        Backend {
            address: addr.to_string(),
            addr,
            weight,
            healthy: true,
            health_check: HealthCheck::default(),
        }
    }

    fn pool(weights: &[u32], algorithm: Algorithm) -> LoadBalancer {
        let backends = weights
            .iter()
            .enumerate()
            .map(|(i, w)| backend(9000 + i as u16, *w))
            .collect();
        LoadBalancer::new(backends, algorithm)
    }

    #[test]
    fn algorithm_names_are_authoritative() {
        assert_eq!("round_robin".parse(), Ok(Algorithm::RoundRobin));
        assert_eq!("weighted".parse(), Ok(Algorithm::Weighted));
        assert_eq!("weighted_round_robin".parse(), Ok(Algorithm::Weighted));
        assert_eq!("least_connections".parse(), Ok(Algorithm::LeastConnections));
        assert_eq!("consistent_hash".parse(), Ok(Algorithm::ConsistentHash));
        assert_eq!(
            "ip_hash".parse::<Algorithm>(),
            Err(UnknownAlgorithm("ip_hash".to_string()))
        );
    }

    #[test]
    fn empty_pool_reports_no_backends() {
        let lb = pool(&[], Algorithm::RoundRobin);
        assert_eq!(
            lb.select(None, &[]).unwrap_err(),
            SelectError::NoBackendsAvailable
        );
    }

    #[test]
    fn all_unhealthy_reports_no_backends() {
        let lb = pool(&[100, 100], Algorithm::RoundRobin);
        for slot in lb.slots() {
            slot.set_healthy(false);
        }
        assert_eq!(
            lb.select(None, &[]).unwrap_err(),
            SelectError::NoBackendsAvailable
        );
    }

    #[test]
    fn round_robin_is_exact_over_any_window() {
        let lb = pool(&[100, 100, 100], Algorithm::RoundRobin);
        let mut counts = [0usize; 3];
        let mut order = Vec::new();
        for _ in 0..9 {
            let slot = lb.select(None, &[]).unwrap();
            let idx = lb.slots().iter().position(|s| s.addr() == slot.addr()).unwrap();
            counts[idx] += 1;
            order.push(idx);
            lb.release(&slot);
        }
        assert_eq!(counts, [3, 3, 3]);
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn round_robin_never_returns_unhealthy() {
        let lb = pool(&[100, 100, 100], Algorithm::RoundRobin);
        let sick = lb.slots()[1].addr();
        lb.set_healthy(sick, false);
        for _ in 0..30 {
            let slot = lb.select(None, &[]).unwrap();
            assert_ne!(slot.addr(), sick);
            lb.release(&slot);
        }
    }

    #[test]
    fn weighted_matches_proportions_in_one_cycle() {
        let lb = pool(&[5, 3, 2], Algorithm::Weighted);
        let mut counts = [0usize; 3];
        for _ in 0..10 {
            let slot = lb.select(None, &[]).unwrap();
            let idx = lb.slots().iter().position(|s| s.addr() == slot.addr()).unwrap();
            counts[idx] += 1;
            lb.release(&slot);
        }
        assert_eq!(counts, [5, 3, 2]);
    }

    #[test]
    fn weighted_interleaves_rather_than_bursting() {
        let lb = pool(&[4, 1], Algorithm::Weighted);
        let mut order = Vec::new();
        for _ in 0..5 {
            let slot = lb.select(None, &[]).unwrap();
            let idx = lb.slots().iter().position(|s| s.addr() == slot.addr()).unwrap();
            order.push(idx);
            lb.release(&slot);
        }
        // Smooth scheduling places the light backend mid-cycle, not last.
        assert_eq!(order.iter().filter(|&&i| i == 0).count(), 4);
        assert_ne!(order, vec![0, 0, 0, 0, 1]);
    }

    #[test]
    fn least_connections_prefers_idle_and_breaks_ties_by_index() {
        let lb = pool(&[100, 100, 100], Algorithm::LeastConnections);
        // All idle: tie broken by lowest index.
        let first = lb.select(None, &[]).unwrap();
        assert_eq!(first.addr(), lb.slots()[0].addr());
        // First now has one active flow; next pick is index 1.
        let second = lb.select(None, &[]).unwrap();
        assert_eq!(second.addr(), lb.slots()[1].addr());
        // Release the first; it ties with index 2 and wins by order.
        lb.release(&first);
        let third = lb.select(None, &[]).unwrap();
        assert_eq!(third.addr(), lb.slots()[0].addr());
    }

    #[test]
    fn exclusion_forces_reselection() {
        let lb = pool(&[100, 100], Algorithm::LeastConnections);
        let denied = lb.slots()[0].addr();
        for _ in 0..5 {
            let slot = lb.select(None, &[denied]).unwrap();
            assert_ne!(slot.addr(), denied);
            lb.release(&slot);
        }
        let both = [lb.slots()[0].addr(), lb.slots()[1].addr()];
        assert_eq!(
            lb.select(None, &both).unwrap_err(),
            SelectError::NoBackendsAvailable
        );
    }

    fn assignments(lb: &LoadBalancer, ips: u32) -> HashMap<IpAddr, SocketAddr> {
        let mut map = HashMap::new();
        for i in 0..ips {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0A00_0000u32 + i));
            let slot = lb.select(Some(ip), &[]).unwrap();
            map.insert(ip, slot.addr());
            lb.release(&slot);
        }
        map
    }

    #[test]
    fn consistent_hash_is_stable_per_client() {
        let lb = pool(&[100, 100, 100], Algorithm::ConsistentHash);
        let first = assignments(&lb, 200);
        let second = assignments(&lb, 200);
        assert_eq!(first, second);
    }

    #[test]
    fn consistent_hash_remaps_only_the_removed_arc() {
        let before_lb = pool(&[100, 100, 100], Algorithm::ConsistentHash);
        let before = assignments(&before_lb, 1_000);
        let removed = before_lb.slots()[1].addr();

        // Rebuild the pool without the middle backend, as a snapshot apply
        // would after the control plane drops it.
        let survivors: Vec<Backend> = before_lb
            .slots()
            .iter()
            .filter(|s| s.addr() != removed)
            .map(|s| Backend {
                address: s.address().to_string(),
                addr: s.addr(),
                weight: s.weight(),
                healthy: true,
                health_check: HealthCheck::default(),
            })
            .collect();
        let after_lb = LoadBalancer::new(survivors, Algorithm::ConsistentHash);
        let after = assignments(&after_lb, 1_000);

        let mut moved = 0usize;
        for (ip, old_backend) in &before {
            if *old_backend == removed {
                moved += 1;
            } else {
                assert_eq!(after[ip], *old_backend, "surviving arc moved for {ip}");
            }
        }
        // Only clients on the removed backend remap: roughly 1/3 of keys.
        assert!(moved > 0 && moved < 1_000 / 2, "moved {moved} of 1000");
    }

    #[test]
    fn consistent_hash_walks_past_unhealthy_backends() {
        let lb = pool(&[100, 100, 100], Algorithm::ConsistentHash);
        let before = assignments(&lb, 500);
        let sick = lb.slots()[2].addr();
        lb.set_healthy(sick, false);
        let after = assignments(&lb, 500);
        for (ip, backend) in &after {
            assert_ne!(*backend, sick);
            if before[ip] != sick {
                assert_eq!(*backend, before[ip], "healthy arc moved for {ip}");
            }
        }
    }

    #[test]
    fn release_saturates_at_zero() {
        let lb = pool(&[100], Algorithm::RoundRobin);
        let slot = lb.select(None, &[]).unwrap();
        lb.release(&slot);
        lb.release(&slot);
        assert_eq!(slot.active_connections(), 0);
    }
}

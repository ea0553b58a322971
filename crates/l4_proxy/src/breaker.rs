//! Per-backend circuit breakers.
//!
//! One breaker per backend address. Transitions are serialized by a short
//! per-backend critical section; in particular the Open → HalfOpen edge
//! admits exactly one probe, so a flapping backend sees a single trial
//! connection per open interval while competing callers are told to pick
//! another backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::BreakerParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Core {
    state: State,
    consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Breaker for a single backend address.
#[derive(Debug)]
pub struct CircuitBreaker {
    core: Mutex<Core>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                state: State::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a new flow may target this backend. Returning true while
    /// Open implies the Open interval elapsed and this caller is the single
    /// half-open probe.
    fn allow_at(&self, now: Instant) -> bool {
        let mut core = self.core.lock();
        match core.state {
            State::Closed => true,
            State::Open { until } if now >= until => {
                core.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
            State::Open { .. } => false,
            State::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    false
                } else {
                    core.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    fn on_success(&self) {
        let mut core = self.core.lock();
        core.consecutive_failures = 0;
        if matches!(core.state, State::HalfOpen { .. }) {
            core.state = State::Closed;
        }
    }

    fn on_failure_at(&self, now: Instant, params: BreakerParams) {
        let mut core = self.core.lock();
        match core.state {
            State::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= params.error_threshold {
                    core.state = State::Open {
                        until: now + params.open_for,
                    };
                }
            }
            State::HalfOpen { .. } => {
                core.consecutive_failures += 1;
                core.state = State::Open {
                    until: now + params.open_for,
                };
            }
            // Late failure report from a flow admitted before the trip;
            // the open deadline stays where the trip put it.
            State::Open { .. } => {}
        }
    }

    fn state(&self) -> BreakerState {
        match self.core.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { until } => BreakerState::Open { until },
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn consecutive_failures(&self) -> u32 {
        self.core.lock().consecutive_failures
    }
}

/// All breakers, keyed by backend address. Parameters come from the current
/// snapshot; per-backend state survives reconfiguration for addresses that
/// stay in the pool.
pub struct BreakerMap {
    breakers: DashMap<SocketAddr, Arc<CircuitBreaker>>,
    params: RwLock<BreakerParams>,
}

impl BreakerMap {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            breakers: DashMap::new(),
            params: RwLock::new(params),
        }
    }

    /// Align the map with a new snapshot: fresh Closed breakers for new
    /// addresses, removed addresses dropped. A flow still running on the
    /// old snapshot that reports an outcome for a dropped address lazily
    /// re-creates a Closed entry, which is harmless.
    pub fn apply(&self, params: BreakerParams, addrs: &[SocketAddr]) {
        *self.params.write() = params;
        self.breakers.retain(|addr, _| addrs.contains(addr));
        for addr in addrs {
            self.breakers
                .entry(*addr)
                .or_insert_with(|| Arc::new(CircuitBreaker::new()));
        }
    }

    pub fn allow(&self, addr: SocketAddr) -> bool {
        self.allow_at(addr, Instant::now())
    }

    pub fn allow_at(&self, addr: SocketAddr, now: Instant) -> bool {
        self.entry(addr).allow_at(now)
    }

    pub fn on_success(&self, addr: SocketAddr) {
        self.entry(addr).on_success();
    }

    pub fn on_failure(&self, addr: SocketAddr) {
        self.on_failure_at(addr, Instant::now());
    }

    pub fn on_failure_at(&self, addr: SocketAddr, now: Instant) {
        let params = *self.params.read();
        self.entry(addr).on_failure_at(now, params);
    }

    pub fn state(&self, addr: SocketAddr) -> Option<BreakerState> {
        self.breakers.get(&addr).map(|b| b.state())
    }

    pub fn consecutive_failures(&self, addr: SocketAddr) -> u32 {
        self.breakers
            .get(&addr)
            .map(|b| b.consecutive_failures())
            .unwrap_or(0)
    }

    fn entry(&self, addr: SocketAddr) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(addr)
            .or_insert_with(|| Arc::new(CircuitBreaker::new()))
            .clone()
    }
}

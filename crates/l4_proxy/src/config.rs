//! Configuration model.
//!
//! Two layers exist on purpose. The [`LocalConfig`] bootstrap file only
//! seeds what the process needs before the control plane speaks to it: the
//! RPC bind address and the shutdown grace. The authoritative
//! [`ConfigSnapshot`] always arrives over RPC and is validated here before
//! it can replace the published snapshot.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use l4_balance::{Algorithm, Backend, HealthCheck};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_RATE_LIMIT_RPS: f64 = 1_000.0;
const DEFAULT_RATE_LIMIT_BURST: f64 = 100.0;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_OPEN_SECS: u64 = 30;
const DEFAULT_BACKEND_WEIGHT: u32 = 100;

/// One immutable configuration version. Handler tasks pin the snapshot they
/// were spawned with; new flows observe the latest published snapshot.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub tcp_listen: SocketAddr,
    pub udp_listen: Option<SocketAddr>,
    pub backends: Vec<Backend>,
    pub algorithm: Algorithm,
    pub session_affinity: bool,
    pub rate_limit: RateLimitParams,
    pub timeouts: Timeouts,
    pub breaker: BreakerParams,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitParams {
    pub requests_per_second: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub idle: Duration,
    pub read: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerParams {
    pub error_threshold: u32,
    pub open_for: Duration,
}

/// Rejected RPC configuration. The message is surfaced verbatim in the
/// acknowledgement; the prior snapshot stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownAlgorithm(#[from] l4_balance::UnknownAlgorithm),
    #[error("invalid {field} address {value:?}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("duplicate backend address {0:?}")]
    DuplicateBackend(String),
    #[error("backend list is empty")]
    EmptyBackends,
    #[error("backend {address:?} has negative weight {weight}")]
    NegativeWeight { address: String, weight: i32 },
}

impl ConfigSnapshot {
    pub fn from_proto(pb: l4_rpc::ProxyConfig) -> Result<Self, ConfigError> {
        let listen = pb.listen.unwrap_or_default();
        let tcp_listen = parse_addr("listen.tcp", &listen.tcp_address)?;
        let udp_listen = if listen.udp_address.is_empty() {
            None
        } else {
            Some(parse_addr("listen.udp", &listen.udp_address)?)
        };

        let backends = backends_from_proto(pb.backends)?;

        let lb = pb.load_balancing.unwrap_or_default();
        let algorithm = if lb.algorithm.is_empty() {
            Algorithm::RoundRobin
        } else {
            lb.algorithm.parse()?
        };

        let traffic = pb.traffic.unwrap_or_default();
        let rate_limit = traffic
            .rate_limit
            .map(|rl| RateLimitParams {
                requests_per_second: positive_or(rl.requests_per_second, DEFAULT_RATE_LIMIT_RPS),
                burst: positive_or(rl.burst, DEFAULT_RATE_LIMIT_BURST),
            })
            .unwrap_or(RateLimitParams {
                requests_per_second: DEFAULT_RATE_LIMIT_RPS,
                burst: DEFAULT_RATE_LIMIT_BURST,
            });
        let timeouts = traffic
            .timeout
            .map(|t| Timeouts {
                connect: secs_or(t.connect_seconds, DEFAULT_CONNECT_TIMEOUT_SECS),
                idle: secs_or(t.idle_seconds, DEFAULT_IDLE_TIMEOUT_SECS),
                read: secs_or(t.read_seconds, DEFAULT_READ_TIMEOUT_SECS),
            })
            .unwrap_or(Timeouts {
                connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
                idle: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
                read: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            });

        let breaker = pb
            .circuit_breaker
            .map(|cb| BreakerParams {
                error_threshold: if cb.error_threshold > 0 {
                    cb.error_threshold as u32
                } else {
                    DEFAULT_BREAKER_THRESHOLD
                },
                open_for: secs_or(cb.timeout_seconds, DEFAULT_BREAKER_OPEN_SECS),
            })
            .unwrap_or(BreakerParams {
                error_threshold: DEFAULT_BREAKER_THRESHOLD,
                open_for: Duration::from_secs(DEFAULT_BREAKER_OPEN_SECS),
            });

        Ok(Self {
            tcp_listen,
            udp_listen,
            backends,
            algorithm,
            session_affinity: lb.session_affinity,
            rate_limit,
            timeouts,
            breaker,
        })
    }
}

/// Validate a backend list from either `UpdateConfig` or `ReloadBackends`.
pub fn backends_from_proto(pb: Vec<l4_rpc::Backend>) -> Result<Vec<Backend>, ConfigError> {
    if pb.is_empty() {
        return Err(ConfigError::EmptyBackends);
    }

    let mut seen = HashSet::new();
    let mut backends = Vec::with_capacity(pb.len());
    for backend in pb {
        let addr = parse_addr("backend", &backend.address)?;
        if !seen.insert(addr) {
            return Err(ConfigError::DuplicateBackend(backend.address));
        }
        if backend.weight < 0 {
            return Err(ConfigError::NegativeWeight {
                address: backend.address,
                weight: backend.weight,
            });
        }
        let weight = if backend.weight == 0 {
            DEFAULT_BACKEND_WEIGHT
        } else {
            backend.weight as u32
        };
        let health_check = backend
            .health_check
            .map(|hc| HealthCheck {
                interval_seconds: hc.interval_seconds,
                timeout_seconds: hc.timeout_seconds,
                path: hc.path,
            })
            .unwrap_or_default();
        backends.push(Backend {
            address: backend.address,
            addr,
            weight,
            healthy: backend.healthy,
            health_check,
        });
    }
    Ok(backends)
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

fn positive_or(value: i32, default: f64) -> f64 {
    if value > 0 {
        f64::from(value)
    } else {
        default
    }
}

fn secs_or(value: u32, default: u64) -> Duration {
    Duration::from_secs(if value > 0 { u64::from(value) } else { default })
}

/// Process bootstrap configuration, read from the `--config` file. The RPC
/// channel remains authoritative for everything traffic-related.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_control_listen")]
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            listen_addr: default_control_listen(),
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_grace_secs: default_drain_grace_secs(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            control: ControlSection::default(),
            shutdown: ShutdownSection::default(),
        }
    }
}

fn default_control_listen() -> SocketAddr {
    "127.0.0.1:50051".parse().expect("static address")
}

fn default_drain_grace_secs() -> u64 {
    30
}

impl LocalConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: LocalConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.shutdown.drain_grace_secs == 0 {
            bail!("shutdown.drain_grace_secs must be > 0");
        }
        Ok(())
    }
}

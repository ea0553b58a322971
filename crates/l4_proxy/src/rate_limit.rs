//! Flow-admission rate limiting.
//!
//! A single global token bucket gates new flows: TCP accepts and UDP
//! session creation, never individual datagrams inside an established
//! session. Per-client buckets can be layered on top; the store holding
//! them is bounded so an address sweep cannot grow memory without limit.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitParams;

const CLIENT_BUCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Classic token bucket with lazy refill and fractional tokens.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_second: f64, burst: f64, now: Instant) -> Self {
        let capacity = burst.max(0.0);
        Self {
            capacity,
            refill_rate: requests_per_second.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now
            .saturating_duration_since(self.last_refill)
            .as_secs_f64();
        if elapsed <= f64::EPSILON {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire_at(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill(now);
        let needed = f64::from(tokens);
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Swap in new parameters; the accumulated balance survives, clipped to
    /// the new capacity.
    pub fn set_params_at(&mut self, requests_per_second: f64, burst: f64, now: Instant) {
        self.refill(now);
        self.capacity = burst.max(0.0);
        self.refill_rate = requests_per_second.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    #[cfg(test)]
    fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

#[derive(Debug)]
struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Bounded per-client bucket store: oldest-inserted entries are evicted at
/// capacity and idle entries are collected opportunistically.
#[derive(Debug)]
struct ClientBuckets {
    params: RateLimitParams,
    entries: HashMap<IpAddr, ClientEntry>,
    insertion_order: VecDeque<IpAddr>,
    capacity: usize,
}

impl ClientBuckets {
    fn new(params: RateLimitParams, capacity: usize) -> Self {
        Self {
            params,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn try_acquire_at(&mut self, client: IpAddr, tokens: u32, now: Instant) -> bool {
        self.gc_idle(now);
        if !self.entries.contains_key(&client) {
            while self.entries.len() >= self.capacity {
                match self.insertion_order.pop_front() {
                    Some(old) => {
                        self.entries.remove(&old);
                    }
                    None => break,
                }
            }
            self.entries.insert(
                client,
                ClientEntry {
                    bucket: TokenBucket::new(
                        self.params.requests_per_second,
                        self.params.burst,
                        now,
                    ),
                    last_seen: now,
                },
            );
            self.insertion_order.push_back(client);
        }
        let entry = match self.entries.get_mut(&client) {
            Some(entry) => entry,
            None => return false,
        };
        entry.last_seen = now;
        entry.bucket.try_acquire_at(tokens, now)
    }

    fn gc_idle(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now.saturating_duration_since(entry.last_seen) <= CLIENT_BUCKET_IDLE_TIMEOUT
        });
        if self.entries.len() < before {
            self.insertion_order.retain(|ip| self.entries.contains_key(ip));
        }
    }
}

/// Shared admission gate. Interior mutability keeps call sites free of lock
/// plumbing; the critical sections are a handful of arithmetic operations.
pub struct RateLimiter {
    global: Mutex<TokenBucket>,
    per_client: Option<Mutex<ClientBuckets>>,
}

impl RateLimiter {
    pub fn new(params: RateLimitParams) -> Self {
        Self {
            global: Mutex::new(TokenBucket::new(
                params.requests_per_second,
                params.burst,
                Instant::now(),
            )),
            per_client: None,
        }
    }

    /// Layer optional per-client buckets over the global gate.
    pub fn with_per_client(mut self, params: RateLimitParams, max_clients: usize) -> Self {
        self.per_client = Some(Mutex::new(ClientBuckets::new(params, max_clients)));
        self
    }

    pub fn try_acquire(&self, client: Option<IpAddr>) -> bool {
        self.try_acquire_at(client, 1, Instant::now())
    }

    pub fn try_acquire_at(&self, client: Option<IpAddr>, tokens: u32, now: Instant) -> bool {
        if !self.global.lock().try_acquire_at(tokens, now) {
            return false;
        }
        if let (Some(buckets), Some(ip)) = (self.per_client.as_ref(), client) {
            if !buckets.lock().try_acquire_at(ip, tokens, now) {
                return false;
            }
        }
        true
    }

    /// Apply new snapshot parameters. The global balance is preserved,
    /// clipped to the new burst capacity.
    pub fn set_params(&self, params: RateLimitParams) {
        self.set_params_at(params, Instant::now());
    }

    pub fn set_params_at(&self, params: RateLimitParams, now: Instant) {
        self.global
            .lock()
            .set_params_at(params.requests_per_second, params.burst, now);
    }
}

//! UDP session table.
//!
//! Maps each client address to its session: the chosen backend, a dedicated
//! upstream ephemeral socket, and the cancellation token of the session's
//! reply pump. The pump owns cleanup on every exit path, so the table only
//! ever removes entries and cancels tokens. Reply steering is structural:
//! a datagram arriving on a session's upstream socket can only be forwarded
//! to that session's client address.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use l4_balance::BackendSlot;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Upper bound on concurrent sessions; bounds table memory and ephemeral
/// port consumption.
pub const MAX_SESSIONS: usize = 100_000;
/// How often the sweeper wakes to collect idle sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session table is full")]
    TableFull,
    #[error("session table is draining")]
    Draining,
    #[error("no backends available")]
    NoBackendsAvailable,
    #[error("session socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// One client-to-backend binding.
#[derive(Debug)]
pub struct Session {
    client: SocketAddr,
    backend: Arc<BackendSlot>,
    upstream: Arc<UdpSocket>,
    epoch: Instant,
    // Milliseconds since `epoch`.
    last_activity: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    replied: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        client: SocketAddr,
        backend: Arc<BackendSlot>,
        upstream: Arc<UdpSocket>,
        epoch: Instant,
        cancel: CancellationToken,
    ) -> Self {
        let now_ms = epoch.elapsed().as_millis() as u64;
        Self {
            client,
            backend,
            upstream,
            epoch,
            last_activity: AtomicU64::new(now_ms),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            replied: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn backend(&self) -> &Arc<BackendSlot> {
        &self.backend
    }

    pub fn upstream(&self) -> &Arc<UdpSocket> {
        &self.upstream
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_activity.store(now_ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// True exactly once, on the session's first backend reply.
    pub fn mark_first_reply(&self) -> bool {
        !self.replied.swap(true, Ordering::Relaxed)
    }

    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Relaxed)
    }

    pub fn traffic(&self) -> (u64, u64, u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.packets_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.packets_received.load(Ordering::Relaxed),
        )
    }
}

pub struct NatTable {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    epoch: Instant,
    max_sessions: usize,
    accepting: AtomicBool,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }
}

impl NatTable {
    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            epoch: Instant::now(),
            max_sessions: max_sessions.max(1),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, client: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(client).map(|entry| entry.clone())
    }

    /// Returns the existing session for `client`, or builds one with
    /// `create`. Concurrent first packets race; the loser's session is
    /// cancelled (its pump tears it down) and the winner is returned, so
    /// the mapping stays bijective per client address.
    pub async fn get_or_create<F, Fut>(
        &self,
        client: SocketAddr,
        create: F,
    ) -> Result<Arc<Session>, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>, SessionError>>,
    {
        if let Some(existing) = self.get(&client) {
            return Ok(existing);
        }
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(SessionError::Draining);
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::TableFull);
        }

        let session = create().await?;
        match self.sessions.entry(client) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                session.cancel.cancel();
                Ok(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Remove the entry for `session` unless another session already took
    /// the slot (insert race loser cleaning up after itself).
    pub fn remove_if_same(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(&session.client, |_, current| Arc::ptr_eq(current, session));
    }

    /// Collect sessions idle longer than `ttl`. Each collected session is
    /// cancelled; its reply pump releases the socket and bookkeeping.
    pub fn sweep(&self, now: Instant, ttl: Duration) -> usize {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().idle_for(now) > ttl {
                expired.push(*entry.key());
            }
        }
        let mut swept = 0;
        for client in expired {
            if let Some((_, session)) = self.sessions.remove(&client) {
                session.cancel.cancel();
                swept += 1;
            }
        }
        swept
    }

    /// Stop admitting new sessions, let existing ones idle out until
    /// `deadline`, then force-close the rest. Returns the number of
    /// sessions force-closed.
    pub async fn drain(&self, deadline: Instant) -> usize {
        self.accepting.store(false, Ordering::Relaxed);
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let mut forced = 0;
        let remaining: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        for client in remaining {
            if let Some((_, session)) = self.sessions.remove(&client) {
                session.cancel.cancel();
                forced += 1;
            }
        }
        forced
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use l4_balance::{Algorithm, Backend, HealthCheck, LoadBalancer};

    use super::*;

    async fn test_session(table: &NatTable, client: SocketAddr) -> Arc<Session> {
        let backend_addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let lb = LoadBalancer::new(
            vec![Backend {
                address: backend_addr.to_string(),
                addr: backend_addr,
                weight: 100,
                healthy: true,
                health_check: HealthCheck::default(),
            }],
            Algorithm::RoundRobin,
        );
        let slot = lb.select(None, &[]).unwrap();
        let upstream = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(Session::new(
            client,
            slot,
            upstream,
            table.epoch(),
            CancellationToken::new(),
        ))
    }

    fn client(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_sessions() {
        let table = NatTable::with_capacity(16);
        let addr = client(4000);
        let first = table
            .get_or_create(addr, || async { Ok(test_session(&table, addr).await) })
            .await
            .unwrap();
        let second = table
            .get_or_create(addr, || async { panic!("must not create twice") })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_sessions() {
        let table = NatTable::with_capacity(1);
        let first = client(4000);
        table
            .get_or_create(first, || async { Ok(test_session(&table, first).await) })
            .await
            .unwrap();
        let second = client(4001);
        let err = table
            .get_or_create(second, || async { Ok(test_session(&table, second).await) })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TableFull));
    }

    #[tokio::test]
    async fn sweep_collects_only_idle_sessions() {
        let table = NatTable::with_capacity(16);
        let idle_addr = client(4000);
        let live_addr = client(4001);
        let idle = table
            .get_or_create(idle_addr, || async { Ok(test_session(&table, idle_addr).await) })
            .await
            .unwrap();
        let live = table
            .get_or_create(live_addr, || async { Ok(test_session(&table, live_addr).await) })
            .await
            .unwrap();

        let ttl = Duration::from_secs(60);
        let later = Instant::now() + Duration::from_secs(90);
        live.touch_at(later);

        assert_eq!(table.sweep(later, ttl), 1);
        assert_eq!(table.len(), 1);
        assert!(idle.cancel_token().is_cancelled());
        assert!(!live.cancel_token().is_cancelled());
        assert!(table.get(&live_addr).is_some());
    }

    #[tokio::test]
    async fn drain_stops_admission_and_force_closes() {
        let table = NatTable::with_capacity(16);
        let addr = client(4000);
        let session = table
            .get_or_create(addr, || async { Ok(test_session(&table, addr).await) })
            .await
            .unwrap();

        let forced = table.drain(Instant::now() + Duration::from_millis(120)).await;
        assert_eq!(forced, 1);
        assert!(session.cancel_token().is_cancelled());
        assert!(table.is_empty());

        let err = table
            .get_or_create(addr, || async { Ok(test_session(&table, addr).await) })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Draining));
    }

    #[tokio::test]
    async fn remove_if_same_ignores_replaced_entries() {
        let table = NatTable::with_capacity(16);
        let addr = client(4000);
        let winner = table
            .get_or_create(addr, || async { Ok(test_session(&table, addr).await) })
            .await
            .unwrap();
        let loser = test_session(&table, addr).await;
        table.remove_if_same(&loser);
        assert!(table.get(&addr).is_some());
        table.remove_if_same(&winner);
        assert!(table.get(&addr).is_none());
    }

    #[tokio::test]
    async fn idle_accounting_tracks_touch() {
        let table = NatTable::with_capacity(16);
        let addr = client(4000);
        let session = test_session(&table, addr).await;
        let now = Instant::now();
        session.touch_at(now);
        assert!(session.idle_for(now + Duration::from_secs(5)) >= Duration::from_secs(4));
        session.touch_at(now + Duration::from_secs(5));
        assert!(session.idle_for(now + Duration::from_secs(5)) < Duration::from_secs(1));
    }
}

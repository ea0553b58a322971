//! TCP proxy engine.
//!
//! One acceptor task owns the listener; each accepted connection runs in
//! its own handler task: admission, backend selection, bounded upstream
//! connect with retries, then a bidirectional relay built from two
//! half-duplex pumps. Teardown always releases the backend slot and the
//! flow gauge, whatever path ended the relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use l4_balance::{BackendSlot, LoadBalancer, SelectError};
use l4_metrics::DataPlaneMetrics;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigSnapshot;
use crate::server::bind_tcp_listener;
use crate::state::ProxyState;

const RELAY_BUFFER_BYTES: usize = 16 * 1024;
/// Upstream connect attempts per flow, breaker denials not included.
const CONNECT_ATTEMPTS: usize = 3;

/// Accept loop. Exits on shutdown or when a drain begins; a changed listen
/// address in a new snapshot rebinds without an acceptance gap.
pub async fn run(state: Arc<ProxyState>, shutdown: CancellationToken) -> Result<()> {
    let mut listen_rx = state.tcp_listen_watch();
    let mut addr = (*listen_rx.borrow_and_update())
        .context("TCP acceptor started without a configured listen address")?;
    let mut listener = bind_tcp_listener(addr)?;
    info!(%addr, "TCP proxy listening");

    let drain = state.drain_started();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = drain.cancelled() => {
                info!("TCP acceptor stopped for drain");
                break;
            }
            changed = listen_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(next) = *listen_rx.borrow_and_update() else {
                    continue;
                };
                if next == addr {
                    continue;
                }
                // Bind the replacement before dropping the old listener so
                // no connection attempt lands in a gap.
                match bind_tcp_listener(next) {
                    Ok(rebound) => {
                        listener = rebound;
                        addr = next;
                        info!(%addr, "TCP listener rebound");
                    }
                    Err(err) => {
                        warn!(%next, error = %err, "rebind failed; keeping current listener");
                    }
                }
            }
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                // Admission: a denied accept is closed with nothing written.
                if !state.limiter().try_acquire(Some(peer.ip())) {
                    state.metrics().record_rate_limit_rejection();
                    drop(client);
                    continue;
                }
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_connection(state, client, peer).await;
                });
            }
        }
    }
    Ok(())
}

struct FlowGuard {
    metrics: DataPlaneMetrics,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.metrics.flow_finished();
    }
}

pub(crate) async fn handle_connection(state: Arc<ProxyState>, mut client: TcpStream, peer: SocketAddr) {
    let Some(snapshot) = state.snapshot() else {
        return;
    };
    let Some(balancer) = state.balancer() else {
        return;
    };
    let metrics = state.metrics().clone();

    metrics.flow_started();
    let _flow = FlowGuard {
        metrics: metrics.clone(),
    };
    let started = Instant::now();

    let Some((mut upstream, slot)) = connect_upstream(&state, &snapshot, &balancer, peer).await
    else {
        return;
    };
    let backend_stats = metrics.backend(slot.addr());
    backend_stats.flow_started();
    debug!(client = %peer, backend = %slot.addr(), "relaying");

    let (outcome, bytes_ferried) = relay(
        &mut client,
        &mut upstream,
        &snapshot,
        &metrics,
        state.drain_abort(),
    )
    .await;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    metrics.record_latency_ms(elapsed_ms);
    backend_stats.record_latency_ms(elapsed_ms);
    backend_stats.flow_finished();
    balancer.release(&slot);

    // A reset or relay error before any byte was ferried counts against
    // the backend; everything else is a successful outcome.
    let failed = matches!(outcome, RelayEnd::UpstreamError) && bytes_ferried == 0;
    if failed {
        state.breakers().on_failure(slot.addr());
        backend_stats.record_failure();
    } else {
        state.breakers().on_success(slot.addr());
    }
    debug!(
        client = %peer,
        backend = %slot.addr(),
        ?outcome,
        bytes = bytes_ferried,
        elapsed_ms,
        "connection closed"
    );
}

async fn connect_upstream(
    state: &ProxyState,
    snapshot: &ConfigSnapshot,
    balancer: &LoadBalancer,
    peer: SocketAddr,
) -> Option<(TcpStream, Arc<BackendSlot>)> {
    let mut exclude: Vec<SocketAddr> = Vec::new();
    for attempt in 0..CONNECT_ATTEMPTS {
        let slot = match state.admit_backend(balancer, peer.ip(), &mut exclude) {
            Ok(slot) => slot,
            Err(SelectError::NoBackendsAvailable) => {
                // Only the first attempt is an admission failure; running
                // out of candidates mid-retry is upstream-error exhaustion
                // and is already counted per backend.
                if attempt == 0 {
                    state.metrics().record_no_backend();
                    debug!(client = %peer, "no backends available");
                }
                return None;
            }
        };
        let connected =
            tokio::time::timeout(snapshot.timeouts.connect, TcpStream::connect(slot.addr())).await;
        match connected {
            Ok(Ok(upstream)) => return Some((upstream, slot)),
            Ok(Err(err)) => {
                debug!(backend = %slot.addr(), error = %err, "upstream connect failed")
            }
            Err(_) => debug!(backend = %slot.addr(), "upstream connect timed out"),
        }
        state.breakers().on_failure(slot.addr());
        state.metrics().backend(slot.addr()).record_failure();
        balancer.release(&slot);
        exclude.push(slot.addr());
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    ClientError,
    UpstreamError,
    ReadTimeout,
    IdleTimeout,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    ReadTimeout,
    ReadError,
    WriteError,
}

/// Two half-duplex pumps sharing an activity clock. The relay ends when
/// either pump returns, the shared idle deadline passes, or the drain abort
/// fires; both sockets close on return.
async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    snapshot: &ConfigSnapshot,
    metrics: &DataPlaneMetrics,
    abort: CancellationToken,
) -> (RelayEnd, u64) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let epoch = Instant::now();
    // Milliseconds since `epoch` of the last byte in either direction.
    let activity = AtomicU64::new(0);
    let ferried = AtomicU64::new(0);

    let client_to_upstream = pump(
        &mut client_read,
        &mut upstream_write,
        snapshot.timeouts.read,
        epoch,
        &activity,
        |n| {
            metrics.record_bytes_sent(n);
            ferried.fetch_add(n, Ordering::Relaxed);
        },
    );
    let upstream_to_client = pump(
        &mut upstream_read,
        &mut client_write,
        snapshot.timeouts.read,
        epoch,
        &activity,
        |n| {
            metrics.record_bytes_received(n);
            ferried.fetch_add(n, Ordering::Relaxed);
        },
    );
    let idle_watchdog = async {
        loop {
            let last = Duration::from_millis(activity.load(Ordering::Relaxed));
            let deadline = epoch + last + snapshot.timeouts.idle;
            tokio::time::sleep_until(deadline.into()).await;
            let last_after = Duration::from_millis(activity.load(Ordering::Relaxed));
            if epoch.elapsed() >= last_after + snapshot.timeouts.idle {
                return;
            }
        }
    };

    let end = tokio::select! {
        end = client_to_upstream => match end {
            PumpEnd::Eof => RelayEnd::ClientClosed,
            PumpEnd::ReadTimeout => RelayEnd::ReadTimeout,
            PumpEnd::ReadError => RelayEnd::ClientError,
            PumpEnd::WriteError => RelayEnd::UpstreamError,
        },
        end = upstream_to_client => match end {
            PumpEnd::Eof => RelayEnd::UpstreamClosed,
            PumpEnd::ReadTimeout => RelayEnd::ReadTimeout,
            PumpEnd::ReadError => RelayEnd::UpstreamError,
            PumpEnd::WriteError => RelayEnd::ClientError,
        },
        _ = idle_watchdog => RelayEnd::IdleTimeout,
        _ = abort.cancelled() => RelayEnd::Aborted,
    };
    (end, ferried.load(Ordering::Relaxed))
}

async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    read_timeout: Duration,
    epoch: Instant,
    activity: &AtomicU64,
    on_bytes: F,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    loop {
        let read = tokio::time::timeout(read_timeout, reader.read(&mut buf)).await;
        let n = match read {
            Err(_) => return PumpEnd::ReadTimeout,
            Ok(Err(_)) => return PumpEnd::ReadError,
            Ok(Ok(0)) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(Ok(n)) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            return PumpEnd::WriteError;
        }
        activity.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        on_bytes(n as u64);
    }
}

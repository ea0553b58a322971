//! UDP proxy engine.
//!
//! A single receive loop owns the listener socket. The first datagram from
//! a client passes admission, picks a backend, and opens a session with its
//! own connected upstream socket and reply pump; later datagrams ride the
//! session. Replies fan in per session, each pump forwarding upstream
//! datagrams back to exactly its own client, in arrival order.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerState;
use crate::nat::{Session, SessionError};
use crate::server::bind_udp_socket;
use crate::state::ProxyState;

const DATAGRAM_BUFFER_BYTES: usize = 64 * 1024;

/// Receive loop. A changed UDP listen address swaps the socket in place;
/// unlike TCP there is no bind-before-drop, so a rebind implies a brief
/// receive gap.
pub async fn run(state: Arc<ProxyState>, shutdown: CancellationToken) -> Result<()> {
    let mut listen_rx = state.udp_listen_watch();
    let mut addr = *listen_rx.borrow_and_update();
    let mut socket = match addr {
        Some(addr) => {
            info!(%addr, "UDP proxy listening");
            Some(Arc::new(bind_udp_socket(addr)?))
        }
        None => {
            info!("UDP proxy disabled (no listen address configured)");
            None
        }
    };

    // During a drain the loop keeps forwarding for established sessions
    // (the NAT table refuses new ones) and stops at the abort deadline.
    let abort = state.drain_abort();
    let mut buf = vec![0u8; DATAGRAM_BUFFER_BYTES];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = abort.cancelled() => {
                info!("UDP receive loop stopped for drain");
                break;
            }
            changed = listen_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *listen_rx.borrow_and_update();
                if next == addr {
                    continue;
                }
                match next {
                    Some(next_addr) => match bind_udp_socket(next_addr) {
                        Ok(rebound) => {
                            socket = Some(Arc::new(rebound));
                            addr = next;
                            info!(addr = %next_addr, "UDP socket rebound");
                        }
                        Err(err) => {
                            warn!(addr = %next_addr, error = %err, "UDP rebind failed; keeping current socket");
                        }
                    },
                    None => {
                        socket = None;
                        addr = None;
                        info!("UDP proxy disabled by configuration");
                    }
                }
            }
            received = recv_from_listener(socket.as_ref(), &mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!(error = %err, "UDP receive failed");
                        continue;
                    }
                };
                let listener = socket.as_ref().map(Arc::clone);
                if let Some(listener) = listener {
                    handle_datagram(&state, &listener, src, &buf[..len]).await;
                }
            }
        }
    }
    Ok(())
}

async fn recv_from_listener(
    socket: Option<&Arc<UdpSocket>>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        // Disabled: park until a snapshot brings a listen address.
        None => std::future::pending().await,
    }
}

async fn handle_datagram(
    state: &Arc<ProxyState>,
    listener: &Arc<UdpSocket>,
    src: SocketAddr,
    payload: &[u8],
) {
    let session = match state.nat().get(&src) {
        Some(session) => session,
        None => {
            // Admission gates session creation, not datagrams inside an
            // established session.
            if !state.limiter().try_acquire(Some(src.ip())) {
                state.metrics().record_rate_limit_rejection();
                state.metrics().record_udp_drop();
                return;
            }
            match open_session(state, listener, src).await {
                Ok(session) => session,
                Err(SessionError::NoBackendsAvailable) => {
                    state.metrics().record_no_backend();
                    state.metrics().record_udp_drop();
                    return;
                }
                Err(err) => {
                    debug!(client = %src, error = %err, "session create failed");
                    state.metrics().record_udp_drop();
                    return;
                }
            }
        }
    };

    match session.upstream().send(payload).await {
        Ok(sent) => {
            session.record_sent(sent as u64);
            state.metrics().record_bytes_sent(sent as u64);
            session.touch();
        }
        Err(err) => {
            debug!(
                client = %src,
                backend = %session.backend().addr(),
                error = %err,
                "upstream send failed; evicting session"
            );
            state.breakers().on_failure(session.backend().addr());
            state.metrics().record_udp_drop();
            state.nat().remove_if_same(&session);
            session.cancel_token().cancel();
        }
    }
}

async fn open_session(
    state: &Arc<ProxyState>,
    listener: &Arc<UdpSocket>,
    src: SocketAddr,
) -> Result<Arc<Session>, SessionError> {
    let balancer = match state.balancer() {
        Some(balancer) => balancer,
        None => return Err(SessionError::NoBackendsAvailable),
    };

    state
        .nat()
        .get_or_create(src, || async {
            let mut exclude = Vec::new();
            let slot = state
                .admit_backend(&balancer, src.ip(), &mut exclude)
                .map_err(|_| SessionError::NoBackendsAvailable)?;

            let upstream = match UdpSocket::bind(unspecified_for(slot.addr())).await {
                Ok(socket) => socket,
                Err(err) => {
                    balancer.release(&slot);
                    return Err(err.into());
                }
            };
            if let Err(err) = upstream.connect(slot.addr()).await {
                balancer.release(&slot);
                return Err(err.into());
            }

            let cancel = CancellationToken::new();
            let session = Arc::new(Session::new(
                src,
                slot,
                Arc::new(upstream),
                state.nat().epoch(),
                cancel,
            ));
            state.metrics().session_opened();
            state.metrics().backend(session.backend().addr()).flow_started();
            debug!(client = %src, backend = %session.backend().addr(), "UDP session opened");

            tokio::spawn(reply_pump(
                Arc::clone(state),
                Arc::clone(listener),
                Arc::clone(&session),
            ));
            Ok(session)
        })
        .await
}

/// Per-session reply pump: forwards backend datagrams to the session's
/// client until cancelled (sweep, drain, eviction, insert-race loss) or the
/// upstream socket errors. Cleanup lives here so every exit path releases
/// the backend slot and the session gauge exactly once.
async fn reply_pump(state: Arc<ProxyState>, listener: Arc<UdpSocket>, session: Arc<Session>) {
    let cancel = session.cancel_token().clone();
    let mut buf = vec![0u8; DATAGRAM_BUFFER_BYTES];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = session.upstream().recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(err) => {
                        debug!(
                            backend = %session.backend().addr(),
                            error = %err,
                            "upstream receive failed"
                        );
                        break;
                    }
                };
                if session.mark_first_reply() {
                    state.breakers().on_success(session.backend().addr());
                }
                match listener.send_to(&buf[..len], session.client()).await {
                    Ok(sent) => {
                        session.record_received(sent as u64);
                        state.metrics().record_bytes_received(sent as u64);
                        session.touch();
                    }
                    Err(err) => {
                        debug!(client = %session.client(), error = %err, "reply send failed");
                        state.metrics().record_udp_drop();
                    }
                }
            }
        }
    }

    state.nat().remove_if_same(&session);
    state.metrics().session_closed();
    state.metrics().backend(session.backend().addr()).flow_finished();
    if let Some(balancer) = state.balancer() {
        balancer.release(session.backend());
    }
    // A probe session that ends without ever seeing a reply must not wedge
    // the breaker in half-open.
    if !session.has_replied()
        && matches!(
            state.breakers().state(session.backend().addr()),
            Some(BreakerState::HalfOpen)
        )
    {
        state.breakers().on_failure(session.backend().addr());
    }
    let (bytes_sent, packets_sent, bytes_received, packets_received) = session.traffic();
    debug!(
        client = %session.client(),
        backend = %session.backend().addr(),
        bytes_sent,
        packets_sent,
        bytes_received,
        packets_received,
        "UDP session closed"
    );
}

fn unspecified_for(backend: SocketAddr) -> SocketAddr {
    match backend {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

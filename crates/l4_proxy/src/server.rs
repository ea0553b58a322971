//! Listener binding and data-plane lifecycle.
//!
//! The process idles until the control plane pushes the first snapshot,
//! then runs three task families under one cancellation tree: the TCP
//! acceptor, the UDP receive loop, and the NAT sweeper. Any task returning
//! an error (a listener bind failure, in practice) tears the data plane
//! down; the binary exits non-zero.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::nat::SWEEP_INTERVAL;
use crate::state::ProxyState;
use crate::{tcp, udp};

const LISTEN_BACKLOG: i32 = 1024;

pub fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("failed creating TCP socket")?;
    // SO_REUSEADDR lets a replacement listener bind while old connections
    // linger in TIME_WAIT, which the no-gap rebind path relies on.
    socket
        .set_reuse_address(true)
        .context("failed setting SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed binding TCP listener to {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .context("failed listening on TCP socket")?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).context("failed converting TCP listener")
}

pub fn bind_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("failed creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed setting SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed binding UDP socket to {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed converting UDP socket")
}

/// Run the forwarding engines until shutdown. Returns once every task
/// family has stopped; an `Err` means a fatal startup failure.
pub async fn run_data_plane(state: Arc<ProxyState>, shutdown: CancellationToken) -> Result<()> {
    info!("waiting for configuration from control plane");
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        _ = state.wait_for_config() => {}
    }
    info!("configuration received; starting proxy engines");

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    {
        let state = Arc::clone(&state);
        let token = shutdown.child_token();
        tasks.spawn(async move { tcp::run(state, token).await });
    }
    {
        let state = Arc::clone(&state);
        let token = shutdown.child_token();
        tasks.spawn(async move { udp::run(state, token).await });
    }
    {
        let state = Arc::clone(&state);
        let token = shutdown.child_token();
        tasks.spawn(async move {
            run_session_sweeper(state, token).await;
            Ok(())
        });
    }

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            joined = tasks.join_next() => match joined {
                // A family exiting cleanly (drain) is not fatal.
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => break Err(err),
                Some(Err(err)) => break Err(anyhow!("proxy task panicked: {err}")),
                None => break Ok(()),
            }
        }
    };

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    result
}

async fn run_session_sweeper(state: Arc<ProxyState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                state.sweep_sessions(Instant::now());
            }
        }
    }
}

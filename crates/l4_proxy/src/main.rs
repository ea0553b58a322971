use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use l4_proxy::rpc::ProxyControlService;
use l4_proxy::{run_data_plane, LocalConfig, ProxyState};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "l4_proxy")]
#[command(about = "Layer-4 TCP/UDP proxy data plane, driven by a control-plane RPC channel")]
struct Args {
    #[arg(long, default_value = "config/dev.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let local = if args.config.exists() {
        LocalConfig::from_file(&args.config)?
    } else {
        info!(path = %args.config.display(), "no bootstrap config file; using defaults");
        LocalConfig::default()
    };

    let state = Arc::new(ProxyState::new());
    let shutdown = CancellationToken::new();

    {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        let grace = Duration::from_secs(local.shutdown.drain_grace_secs);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received; draining");
                state.begin_drain(grace).await;
                shutdown.cancel();
            }
        });
    }

    // The RPC listener binds before anything else; without it the control
    // plane can never configure us, so failure here is fatal.
    let rpc_addr = local.control.listen_addr;
    let rpc_listener = TcpListener::bind(rpc_addr)
        .await
        .with_context(|| format!("failed binding RPC listener on {rpc_addr}"))?;
    info!(addr = %rpc_addr, "control RPC listening");

    let service = ProxyControlService::new(Arc::clone(&state));
    let rpc_shutdown = shutdown.clone();
    let rpc_task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming_shutdown(TcpListenerStream::new(rpc_listener), async move {
                rpc_shutdown.cancelled().await;
            })
            .await
    });

    let result = run_data_plane(Arc::clone(&state), shutdown.clone()).await;
    shutdown.cancel();
    rpc_task
        .await
        .context("RPC server task failed")?
        .context("RPC server error")?;
    result?;

    info!("shutdown complete");
    Ok(())
}

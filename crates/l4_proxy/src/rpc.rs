//! Control-plane RPC service.
//!
//! Thin translation layer between the wire schema and `ProxyState`.
//! Configuration problems are business outcomes, not transport errors:
//! they come back as `success = false` acknowledgements with a message,
//! and the prior snapshot stays in effect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::config::{backends_from_proto, ConfigSnapshot};
use crate::state::ProxyState;
use l4_rpc::{ProxyControl, ProxyControlServer};

/// Cadence of MetricsData emissions on the metrics stream.
const METRICS_STREAM_INTERVAL: Duration = Duration::from_secs(5);

pub struct ProxyControlService {
    state: Arc<ProxyState>,
}

impl ProxyControlService {
    pub fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }

    pub fn into_server(self) -> ProxyControlServer<Self> {
        ProxyControlServer::new(self)
    }
}

#[tonic::async_trait]
impl ProxyControl for ProxyControlService {
    async fn update_config(
        &self,
        request: Request<l4_rpc::ProxyConfig>,
    ) -> Result<Response<l4_rpc::ConfigAck>, Status> {
        match ConfigSnapshot::from_proto(request.into_inner()) {
            Ok(snapshot) => {
                info!(
                    tcp = %snapshot.tcp_listen,
                    udp = ?snapshot.udp_listen,
                    backends = snapshot.backends.len(),
                    algorithm = snapshot.algorithm.as_str(),
                    "applying configuration update"
                );
                self.state.apply_config(snapshot);
                Ok(Response::new(l4_rpc::ConfigAck {
                    success: true,
                    message: "configuration applied".to_string(),
                }))
            }
            Err(err) => {
                warn!(error = %err, "rejected configuration update");
                Ok(Response::new(l4_rpc::ConfigAck {
                    success: false,
                    message: err.to_string(),
                }))
            }
        }
    }

    async fn reload_backends(
        &self,
        request: Request<l4_rpc::BackendList>,
    ) -> Result<Response<l4_rpc::ReloadAck>, Status> {
        let backends = match backends_from_proto(request.into_inner().backends) {
            Ok(backends) => backends,
            Err(err) => {
                warn!(error = %err, "rejected backend reload");
                return Ok(Response::new(l4_rpc::ReloadAck {
                    success: false,
                    message: err.to_string(),
                    backends_loaded: 0,
                }));
            }
        };
        match self.state.apply_backends(backends) {
            Ok(loaded) => {
                info!(backends = loaded, "backend pool reloaded");
                Ok(Response::new(l4_rpc::ReloadAck {
                    success: true,
                    message: "backends reloaded".to_string(),
                    backends_loaded: loaded as i32,
                }))
            }
            Err(err) => Ok(Response::new(l4_rpc::ReloadAck {
                success: false,
                message: err.to_string(),
                backends_loaded: 0,
            })),
        }
    }

    async fn drain_connections(
        &self,
        request: Request<l4_rpc::DrainRequest>,
    ) -> Result<Response<l4_rpc::DrainResponse>, Status> {
        let grace = Duration::from_secs(u64::from(request.into_inner().timeout_seconds.max(1)));
        info!(grace_secs = grace.as_secs(), "draining connections");
        let outcome = self.state.begin_drain(grace).await;
        info!(aborted = outcome.aborted, clean = outcome.clean, "drain finished");
        Ok(Response::new(l4_rpc::DrainResponse {
            success: outcome.clean,
            connections_drained: outcome.aborted as i32,
        }))
    }

    type StreamMetricsStream = ReceiverStream<Result<l4_rpc::MetricsData, Status>>;

    async fn stream_metrics(
        &self,
        request: Request<Streaming<l4_rpc::MetricsAck>>,
    ) -> Result<Response<Self::StreamMetricsStream>, Status> {
        let mut acks = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        let stop = CancellationToken::new();

        // The control plane closing its ack stream ends ours.
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                while let Ok(Some(_ack)) = acks.message().await {}
                stop.cancel();
            });
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_STREAM_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        if tx.send(Ok(metrics_data(&state))).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn metrics_data(state: &ProxyState) -> l4_rpc::MetricsData {
    let snapshot = state.metrics().snapshot();
    l4_rpc::MetricsData {
        active_connections: snapshot.active_connections,
        total_connections: snapshot.total_connections,
        bytes_sent: snapshot.bytes_sent,
        bytes_received: snapshot.bytes_received,
        avg_latency_ms: snapshot.avg_latency_ms,
        p99_latency_ms: snapshot.p99_latency_ms,
        backend_metrics: snapshot
            .backends
            .into_iter()
            .map(|backend| l4_rpc::BackendMetrics {
                address: backend.address,
                active_connections: backend.active_connections,
                total_requests: backend.total_requests,
                failed_requests: backend.failed_requests,
                avg_latency_ms: backend.avg_latency_ms,
            })
            .collect(),
    }
}

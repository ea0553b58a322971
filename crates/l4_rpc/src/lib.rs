//! Generated protocol types for the `proxyctl.ProxyControl` service.

tonic::include_proto!("proxyctl");

pub use proxy_control_client::ProxyControlClient;
pub use proxy_control_server::{ProxyControl, ProxyControlServer};

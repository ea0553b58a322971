pub mod breaker;
pub mod config;
pub mod nat;
pub mod rate_limit;
pub mod rpc;
pub mod server;
pub mod state;
pub mod tcp;
pub mod udp;

pub use config::{ConfigSnapshot, LocalConfig};
pub use server::run_data_plane;
pub use state::ProxyState;

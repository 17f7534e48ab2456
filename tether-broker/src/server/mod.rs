pub mod api_key;
mod http_layers;
pub mod metrics;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;

pub use http_layers::*;
pub use server::{make_app, run_server, BrokerComponents};
pub use state::{ServerConfig, ServerState};

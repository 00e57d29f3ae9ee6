pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod rpc;
pub mod service;
pub mod span;
pub mod util;

pub use error::{Error, Result};

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` overrides the default
/// `navidx=info`; stdout is left to RPC responses.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("navidx=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Chat backend node entry point
//!
//! Usage:
//!   chorus                 # run one node, configured from the environment
//!
//! See `config.rs` for the recognized environment variables.

use tracing::error;
use tracing_subscriber::EnvFilter;

use chorus::config::Config;
use chorus::server;

#[tokio::main]
async fn main() {
    // .env is optional; real deployments inject the environment directly.
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    if let Err(e) = server::run(config).await {
        error!("node failed: {}", e);
        std::process::exit(1);
    }
}

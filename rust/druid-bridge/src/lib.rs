pub mod config;
pub mod datasource;
pub mod error;
pub mod filter;
pub mod models;
pub mod planner;
pub mod query;
pub mod reshape;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod template;
pub mod time;
pub mod transport;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the bridge using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config)?.run().await
}

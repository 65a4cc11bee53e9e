pub mod config;
pub mod datasource;
pub mod db;
pub mod engine;
pub mod error;
pub mod instance;
pub mod models;
pub mod query;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod value;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the bridge using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).run().await
}

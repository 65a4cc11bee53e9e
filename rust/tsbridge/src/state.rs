use crate::{config::AppConfig, query::QueryEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
    /// Cancelled when the process begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, query: QueryEngine) -> Self {
        Self {
            config,
            query,
            shutdown: CancellationToken::new(),
        }
    }
}

//! Seam between the query pipeline and a concrete backing engine.

use crate::{datasource::ConnectionSettings, models::RowSet, query::BoundArguments};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A live session against the backing engine.
///
/// Implementations must tolerate concurrent `query` calls; they serialize or
/// multiplex internally.
#[async_trait]
pub trait Session: Send + Sync {
    async fn query(&self, text: &str, args: &BoundArguments) -> Result<RowSet, EngineError>;

    /// Releases the underlying connection. Called at most once per session.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Opens sessions from decoded connection settings.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Session>, EngineError>;
}

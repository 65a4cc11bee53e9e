use super::BoundArguments;
use crate::engine::Session;
use serde::Serialize;
use tracing::{info, warn};

pub const PROBE_QUERY: &str = "SELECT 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub message: String,
}

impl HealthResult {
    pub fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            message: "Data source is working".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Runs the trivial probe query and expects exactly one single-column row.
pub async fn probe(session: &dyn Session) -> HealthResult {
    let set = match session.query(PROBE_QUERY, &BoundArguments::new()).await {
        Ok(set) => set,
        Err(err) => {
            warn!(error = %err, "health probe failed");
            return HealthResult::error(err.message);
        }
    };

    if set.rows.len() != 1 || set.columns.len() != 1 {
        return HealthResult::error(format!(
            "unexpected probe result: {} row(s), {} column(s)",
            set.rows.len(),
            set.columns.len()
        ));
    }

    info!("health probe succeeded");
    HealthResult::ok()
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Failures of a single query, or of a whole batch for `ConnectionUnavailable`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("{0}")]
    BackingEngine(String),

    #[error("failed to shape result: {0}")]
    Shaping(String),

    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("query cancelled: {0}")]
    Cancelled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    MalformedRequest,
    BackingEngineError,
    ShapingError,
    ConnectionUnavailable,
    Cancelled,
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            QueryError::BackingEngine(_) => ErrorKind::BackingEngineError,
            QueryError::Shaping(_) => ErrorKind::ShapingError,
            QueryError::ConnectionUnavailable(_) => ErrorKind::ConnectionUnavailable,
            QueryError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Serialized form of a [`QueryError`] inside a batch response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&QueryError> for ErrorBody {
    fn from(err: &QueryError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<QueryError> for ServiceError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::ConnectionUnavailable(message) => {
                ServiceError::ConnectionUnavailable(message)
            }
            QueryError::MalformedRequest(message) => ServiceError::InvalidRequest(message),
            other => ServiceError::Internal(anyhow::anyhow!(other)),
        }
    }
}

#[derive(Serialize)]
struct ServiceErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::ConnectionUnavailable(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(self, ServiceError::InvalidRequest(_) | ServiceError::Auth) {
            error!(error = %self, "request failed");
        }

        let body = ServiceErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

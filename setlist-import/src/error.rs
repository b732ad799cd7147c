//! Error types for setlist-import
//!
//! `ImportError` is the pipeline taxonomy: the queue decides retries from
//! `is_retryable()`, the circuit breaker counts only
//! `counts_toward_breaker()` outcomes. `ApiError` is the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::adapters::Dependency;

/// Import pipeline error
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    /// Network failure, timeout or 5xx from an upstream API
    #[error("{dependency} unavailable: {message}")]
    TransientUpstream {
        dependency: Dependency,
        message: String,
    },

    /// Upstream answered that the entity does not exist (4xx semantic)
    #[error("{dependency} has no {entity}")]
    UpstreamNotFound {
        dependency: Dependency,
        entity: String,
    },

    /// Breaker short-circuited the call, no upstream traffic was sent
    #[error("{dependency} circuit open")]
    CircuitOpen { dependency: Dependency },

    /// Token bucket wait exceeded the bounded queueing time
    #[error("{dependency} rate limit wait exceeded")]
    RateLimited { dependency: Dependency },

    /// Malformed payload from upstream
    #[error("Invalid upstream data: {0}")]
    Validation(String),

    /// Durable store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Missing credentials or keys
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Import cancelled")]
    Cancelled,

    /// Named lock still held by another caller when the wait ran out
    #[error("Lock {0} busy")]
    LockBusy(String),

    /// Queue bookkeeping failure (unknown queue, duplicate job id)
    #[error("Queue error: {0}")]
    Queue(String),
}

impl ImportError {
    pub fn transient(dependency: Dependency, message: impl Into<String>) -> Self {
        ImportError::TransientUpstream {
            dependency,
            message: message.into(),
        }
    }

    pub fn not_found(dependency: Dependency, entity: impl Into<String>) -> Self {
        ImportError::UpstreamNotFound {
            dependency,
            entity: entity.into(),
        }
    }

    /// Whether the queue should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::TransientUpstream { .. }
                | ImportError::CircuitOpen { .. }
                | ImportError::RateLimited { .. }
                | ImportError::Persistence(_)
                | ImportError::LockBusy(_)
        )
    }

    /// Whether the error concerns one record only
    ///
    /// Phases skip and count such items; anything else stops the phase.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            ImportError::UpstreamNotFound { .. }
                | ImportError::Validation(_)
                | ImportError::Persistence(_)
        )
    }

    /// Whether this outcome increments a circuit breaker failure tally
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, ImportError::TransientUpstream { .. })
    }

    /// Short machine-readable kind, used in logs and job records
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::TransientUpstream { .. } => "transient_upstream",
            ImportError::UpstreamNotFound { .. } => "upstream_not_found",
            ImportError::CircuitOpen { .. } => "circuit_open",
            ImportError::RateLimited { .. } => "rate_limited",
            ImportError::Validation(_) => "validation",
            ImportError::Persistence(_) => "persistence",
            ImportError::Configuration(_) => "configuration",
            ImportError::LockBusy(_) => "lock_busy",
            ImportError::Cancelled => "cancelled",
            ImportError::Queue(_) => "queue",
        }
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        ImportError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::Persistence(format!("serialization failed: {}", err))
    }
}

impl From<setlist_common::Error> for ImportError {
    fn from(err: setlist_common::Error) -> Self {
        match err {
            setlist_common::Error::Config(msg) => ImportError::Configuration(msg),
            io @ setlist_common::Error::Io { .. } => ImportError::Configuration(io.to_string()),
        }
    }
}

/// Result type for pipeline operations
pub type ImportResult<T> = Result<T, ImportError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Upstream dependency unavailable (503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::UpstreamNotFound { .. } => ApiError::NotFound(err.to_string()),
            ImportError::Validation(msg) => ApiError::BadRequest(msg),
            e if e.is_retryable() => ApiError::Unavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

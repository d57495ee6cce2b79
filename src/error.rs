//! Error types for gymflow.
//!
//! Errors carry a machine-readable code and a sanitized external message so
//! API responses never leak SQL, file paths, or connection strings.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gymflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// gymflow error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Authorization(_) => "AUTHORIZATION_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Cache(_) => "CACHE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Redis(_) => "REDIS_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status code for this error at the API boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Internal details like SQL statements, file paths, and connection
    /// strings are hidden; client-caused errors keep their full message.
    pub fn external_message(&self) -> String {
        match self {
            // Client-facing errors keep their detail
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::Authorization(msg) => format!("Not authorized: {}", msg),
            Error::Conflict(msg) => format!("Conflict: {}", msg),
            Error::RateLimited { retry_after_secs } => {
                format!("Too many requests, retry after {}s", retry_after_secs)
            }
            Error::Upstream(_) => "An upstream provider returned an error".to_string(),

            // Internal errors - sanitize to avoid leaking details
            Error::Cache(_) => "A cache error occurred".to_string(),
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Config(_) => "A configuration error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Redis(_) => "A cache backend error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to the API error envelope with sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

/// Structured error payload for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            retry_after: None,
        }
    }

    pub fn with_retry(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

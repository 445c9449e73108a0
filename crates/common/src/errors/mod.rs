//! Error types for LineSight services
//!
//! Provides the error taxonomy for the question pipeline with:
//! - Distinct error types for configuration, storage, partition and model failures
//! - Fixed user-facing messages so the entry point can always answer with text
//! - HTTP status code mapping and structured error responses for the gateway

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Shown for any failure without a more specific message.
pub const FALLBACK_MESSAGE: &str =
    "Sorry, I couldn't process your question due to an internal error. Please try again.";

/// Shown when the store cannot be reached during a request.
pub const CONNECTION_MESSAGE: &str =
    "Unable to reach the production database right now. Please try again later.";

/// Shown when the language model rejects the configured credential.
pub const CREDENTIAL_MESSAGE: &str =
    "The language model rejected the configured API key. Please check the credential configuration.";

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MalformedName,

    // Resource errors (4xxx)
    PartitionNotFound,

    // Storage errors (7xxx)
    DatabaseError,
    ConnectionError,
    StoreError,

    // External service errors (8xxx)
    UpstreamError,
    CredentialRejected,
    LanguageModelError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MalformedName => 1002,

            // Resources (4xxx)
            ErrorCode::PartitionNotFound => 4001,

            // Storage (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::StoreError => 7003,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::CredentialRejected => 8002,
            ErrorCode::LanguageModelError => 8003,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// The name cannot be used as a partition lookup key at all.
    #[error("Malformed component name '{name}': {reason}")]
    MalformedName { name: String, reason: String },

    /// The name is well formed but no partition is registered under it.
    #[error("Component partition not found: {name}")]
    PartitionNotFound { name: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Store connection error: {message}")]
    Connection { message: String },

    #[error("Store query failed: {message}")]
    Store { message: String },

    // External service errors
    #[error("Language model rejected credential: {message}")]
    Credential { message: String },

    #[error("Language model error: {message}")]
    LanguageModel { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MalformedName { .. } => ErrorCode::MalformedName,
            AppError::PartitionNotFound { .. } => ErrorCode::PartitionNotFound,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::Connection { .. } => ErrorCode::ConnectionError,
            AppError::Store { .. } => ErrorCode::StoreError,
            AppError::Credential { .. } => ErrorCode::CredentialRejected,
            AppError::LanguageModel { .. } => ErrorCode::LanguageModelError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::MalformedName { .. } => {
                StatusCode::BAD_REQUEST
            }

            // 404 Not Found
            AppError::PartitionNotFound { .. } => StatusCode::NOT_FOUND,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::Store { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Credential { .. }
            | AppError::LanguageModel { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Text shown to the person who asked the question
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation { message } => message.clone(),
            AppError::MalformedName { name, .. } => format!(
                "'{}' is not a valid component name. Component names may only contain letters, digits, '_' and '-'.",
                name
            ),
            AppError::PartitionNotFound { name } => format!(
                "No inspection data found for component '{}': it is not a known component.",
                name
            ),
            AppError::Connection { .. } => CONNECTION_MESSAGE.to_string(),
            AppError::Credential { .. } => CREDENTIAL_MESSAGE.to_string(),
            _ => FALLBACK_MESSAGE.to_string(),
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => AppError::Connection {
                message: err.to_string(),
            },
            sqlx::Error::Io(e) => AppError::Connection {
                message: e.to_string(),
            },
            other => AppError::Database(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Store {
            message: format!("Migration failed: {}", err),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.user_message(),
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

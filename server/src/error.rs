//! Unified error handling for the server.
//!
//! The status codes are part of the device protocol: clients classify
//! 401 as auth-required, 409 as schema-mismatch, 400 as validation and
//! everything else as transient.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tillsync_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

impl AppError {
    /// Machine-readable error class, mirrored in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "internal",
            AppError::Engine(_) | AppError::BadRequest(_) => "validation",
            AppError::SchemaMismatch(_) => "schema_mismatch",
            AppError::Unauthorized(_) => "auth_required",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Engine(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SchemaMismatch(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    kind: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (e.to_string(), None)
            }
            AppError::BadRequest(msg) => (msg.clone(), None),
            AppError::SchemaMismatch(msg) => {
                tracing::warn!("Schema mismatch: {}", msg);
                ("Schema mismatch".to_string(), Some(msg.clone()))
            }
            AppError::Unauthorized(reason) => ("Unauthorized".to_string(), Some(reason.to_string())),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
            kind: self.kind(),
        });

        (self.status(), body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

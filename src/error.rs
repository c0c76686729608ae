//! # Error Handling
//!
//! Application-level error type for the HTTP surface and its mapping to
//! HTTP responses. Protocol-level failures inside a running session never
//! surface here; they are signaled on the wire by the session itself.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors produced while accepting or upgrading a connection.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Client sent an invalid upgrade request (400)
    BadRequest(String),

    /// Connection rejected by authentication (401)
    Unauthorized(String),

    /// Connection limit reached (503)
    Unavailable(String),

    /// Configuration file or environment variable problems (500)
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {msg}"),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Unauthorized(msg) => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "unauthorized",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {err}"))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for results using the application error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let cases = [
            (AppError::Internal("x".into()), 500),
            (AppError::BadRequest("x".into()), 400),
            (AppError::Unauthorized("x".into()), 401),
            (AppError::Unavailable("x".into()), 503),
            (AppError::ConfigError("x".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.error_response().status().as_u16(), status);
        }
    }

    #[test]
    fn test_display_includes_message() {
        let err = AppError::Unauthorized("signature verification failed".into());
        assert!(err.to_string().contains("signature verification failed"));
    }
}

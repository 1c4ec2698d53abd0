//! Error taxonomy for the sync layer
//!
//! Every failure the store, hub, server, or client can report is a [`SyncError`].
//! Errors are grouped into an [`ErrorCategory`] so callers can decide whether to
//! fall back to the local cache, retry, or surface the failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Result alias used throughout the crate
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the state store, hub, server and client
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The server could not be reached or the push channel broke
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload or message could not be parsed or encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable write (or read) of a record failed
    #[error("durability error for domain '{domain}': {source}")]
    Durability {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    /// The domain name cannot be used at the HTTP boundary
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// The server answered, but refused the request
    #[error("server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    /// A push event could not be handed to one subscriber
    #[error("delivery to subscriber {0} failed")]
    Delivery(u64),

    /// Bad or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn durability(domain: impl Into<String>, source: std::io::Error) -> Self {
        Self::Durability {
            domain: domain.into(),
            source,
        }
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Transport(_) => ErrorCategory::Transport,
            SyncError::Serialization(_) | SyncError::InvalidDomain(_) => {
                ErrorCategory::Serialization
            }
            SyncError::Durability { .. } => ErrorCategory::Durability,
            SyncError::ServerRejected { status, .. } if *status >= 500 => {
                ErrorCategory::Durability
            }
            SyncError::ServerRejected { .. } => ErrorCategory::Serialization,
            SyncError::Delivery(_) => ErrorCategory::PartialDelivery,
            SyncError::Config(_) => ErrorCategory::Configuration,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::Serialization => StatusCode::BAD_REQUEST,
            ErrorCategory::Transport => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Transport(format!("malformed response: {err}"))
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Channel closed or server unreachable (client falls back, reconnects)
    Transport,

    /// Payload could not be parsed or encoded (rejected at the boundary)
    Serialization,

    /// Underlying storage failed (no broadcast, prior record stays)
    Durability,

    /// A single subscriber could not be reached during a publish
    PartialDelivery,

    /// Configuration errors (not retryable)
    Configuration,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transport | ErrorCategory::Durability)
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let net_err = SyncError::Transport("connection refused".into());
        assert_eq!(net_err.category(), ErrorCategory::Transport);

        let disk_err = SyncError::durability(
            "quantum",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(disk_err.category(), ErrorCategory::Durability);

        let bad_json = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        assert_eq!(
            SyncError::from(bad_json).category(),
            ErrorCategory::Serialization
        );

        let server_err = SyncError::ServerRejected {
            status: 500,
            message: "disk full".into(),
        };
        assert_eq!(server_err.category(), ErrorCategory::Durability);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCategory::Transport.is_retryable());
        assert!(!ErrorCategory::Serialization.is_retryable());
        assert!(!ErrorCategory::Configuration.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SyncError::InvalidDomain("".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncError::durability("x", std::io::Error::other("full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

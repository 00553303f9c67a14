//! Error types for the mesh gateway

use std::io;
use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the mesh gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Mesh gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The certificate authority could not be created or loaded
    #[error("CA initialization failed: {0}")]
    CaInit(String),

    /// Leaf certificate issuance failed
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// Trust store read/write failure
    #[error("Trust store error: {0}")]
    Store(String),

    /// Startup gate gave up waiting for trust material
    #[error("Timed out after {timeout:?} waiting for certificates: {}", .missing.join(", "))]
    CertificateTimeout {
        /// Subjects that were still not ready at the deadline
        missing: Vec<String>,
        /// Configured timeout
        timeout: Duration,
    },

    /// A registration overlaps a prefix owned by another live module
    #[error("Prefix '{prefix}' overlaps '{existing_prefix}' owned by live module '{existing}'")]
    DuplicatePrefix {
        /// Requested prefix
        prefix: String,
        /// Module that owns the overlapping prefix
        existing: String,
        /// The overlapping prefix
        existing_prefix: String,
    },

    /// Routing prefix failed validation
    #[error("Invalid routing prefix '{prefix}': {reason}")]
    InvalidPrefix {
        /// Offending prefix
        prefix: String,
        /// Why it was rejected
        reason: String,
    },

    /// Registration payload failed validation
    #[error("Invalid module descriptor: {0}")]
    InvalidDescriptor(String),

    /// No registered module claims the request path
    #[error("No module route for {0}")]
    RouteNotFound(String),

    /// The module is registered but unhealthy
    #[error("Module unavailable: {0}")]
    ServiceUnavailable(String),

    /// Backend connect failure or pool exhaustion after the retry budget
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed inbound request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Caller did not present a client certificate
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller identity may not perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Named resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote side rejected a registration call
    #[error("Rejected with HTTP {status}: {message}")]
    Rejected {
        /// HTTP status returned by the router
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cancelled by shutdown
    #[error("Shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when the error is surfaced to a caller
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) | Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::DuplicatePrefix { .. } => StatusCode::CONFLICT,
            Self::InvalidPrefix { .. } | Self::InvalidDescriptor(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for response bodies
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "route_not_found",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::DuplicatePrefix { .. } => "duplicate_prefix",
            Self::InvalidPrefix { .. } => "invalid_prefix",
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::CertificateTimeout { .. } => "certificate_timeout",
            Self::CaInit(_) => "ca_init",
            Self::Shutdown => "shutdown",
            _ => "internal",
        }
    }

    /// Whether a client-side retry could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::UpstreamUnavailable(_) | Self::ServiceUnavailable(_) | Self::Io(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Internal details stay in the logs.
        let message = match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.to_string(),
        };
        (
            self.status_code(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": message,
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_map_to_http_statuses() {
        assert_eq!(
            Error::RouteNotFound("/x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ServiceUnavailable("ipam".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::UpstreamUnavailable("ipam".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn certificate_timeout_lists_missing_subjects() {
        let err = Error::CertificateTimeout {
            missing: vec!["lcm-service:server".into(), "admin-router:client".into()],
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("lcm-service:server, admin-router:client"));
        assert!(msg.contains("5s"));
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(Error::UpstreamUnavailable("x".into()).is_retryable());
        assert!(
            Error::Rejected {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !Error::Rejected {
                status: 409,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!Error::Forbidden("x".into()).is_retryable());
    }
}

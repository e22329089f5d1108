//! Error types for the mTLS workload

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the mTLS workload
pub type Result<T> = std::result::Result<T, Error>;

/// mTLS workload errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No identity could be obtained before the startup deadline
    #[error("Identity source unavailable: {0}")]
    IdentitySourceUnavailable(String),

    /// The identity source was used after `close()`
    #[error("Identity source closed")]
    SourceClosed,

    /// Malformed SPIFFE ID, certificate or identity bundle
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// TLS handshake or peer certificate validation failed
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Inbound peer presented a valid certificate the policy does not allow
    #[error("Peer rejected by authorization policy: {name}")]
    PolicyRejected {
        /// Presented identity, or a description of why none was extracted
        name: String,
    },

    /// Outbound peer presented a valid certificate for the wrong workload
    #[error("Peer authorization failed: expected {expected}, server presented {presented}")]
    PeerAuthorizationFailed {
        /// Policy the server was expected to satisfy
        expected: String,
        /// Identity the server actually presented
        presented: String,
    },

    /// Caller supplied unusable input (missing parameter, bad URL, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Ordinary request-level failure (bad status, undecodable body, ...)
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Stable machine-readable label used in logs and error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::IdentitySourceUnavailable(_) => "identity_source_unavailable",
            Self::SourceClosed => "source_closed",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::PolicyRejected { .. } => "policy_rejected",
            Self::PeerAuthorizationFailed { .. } => "peer_authorization_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RequestFailed(_) => "request_failed",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::Tls(_) => "tls",
        }
    }

    /// HTTP status used when the error reaches a handler boundary.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SourceClosed | Self::IdentitySourceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidIdentity(_) | Self::InvalidRequest(_) | Self::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PeerAuthorizationFailed { .. }
            | Self::HandshakeFailed(_)
            | Self::RequestFailed(_)
            | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::PolicyRejected { .. } => StatusCode::FORBIDDEN,
            Self::Io(_) | Self::Json(_) | Self::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({
                "error": self.to_string(),
                "kind": self.kind(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_authorization_failure_is_distinct_from_transport_errors() {
        let err = Error::PeerAuthorizationFailed {
            expected: "spiffe://example.org/svc-b".to_string(),
            presented: "spiffe://example.org/svc-a".to_string(),
        };
        assert_eq!(err.kind(), "peer_authorization_failed");
        assert_ne!(err.kind(), Error::HandshakeFailed("reset".into()).kind());
        assert!(err.to_string().contains("svc-a"));
        assert!(err.to_string().contains("svc-b"));
    }

    #[test]
    fn closed_source_maps_to_service_unavailable() {
        assert_eq!(
            Error::SourceClosed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn invalid_identity_maps_to_bad_request() {
        let err = Error::InvalidIdentity("missing scheme".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}

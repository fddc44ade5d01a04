//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`BridgeError`]: everything that can go wrong on a client connection.
//!   None of these tear the connection down; they are reported to the client
//!   as an `error` message with a stable `code`, except decode errors which
//!   are only logged.
//! - [`AppError`]: failures of the HTTP endpoints, converted to JSON
//!   responses through actix's `ResponseError`.
//!
//! ## Error Taxonomy (client connection):
//! - **Decode**: malformed audio bytes, chunk dropped silently
//! - **Protocol**: invalid JSON, invalid fields, unknown type, wrong state
//! - **Backend connection**: recognition backend unreachable, start fails
//! - **Backend stream**: one segment failed, recording continues
//! - **Capacity**: connection cap reached, refused at accept time

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use crate::audio::decode::DecodeError;
use crate::transcription::service::TranscriptionError;

/// Errors raised while serving one client connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("audio decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("transcription already active")]
    AlreadyActive,

    #[error("transcription not active")]
    NotActive,

    #[error("could not connect to the recognition backend: {0}")]
    BackendConnection(String),

    #[error("recognition failed: {0}")]
    BackendStream(String),

    #[error("audio queue full, segment dropped")]
    QueueFull,

    #[error("server at capacity ({max} connections)")]
    CapacityReached { max: usize },

    #[error("connection {0} not found")]
    ConnectionNotFound(String),
}

impl BridgeError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Decode(_) => "decode_error",
            BridgeError::InvalidJson(_) => "invalid_json",
            BridgeError::InvalidMessage(_) => "invalid_message",
            BridgeError::UnknownMessageType(_) => "unknown_message_type",
            BridgeError::AlreadyActive => "already_active",
            BridgeError::NotActive => "not_active",
            BridgeError::BackendConnection(_) => "backend_connection_error",
            BridgeError::BackendStream(_) => "backend_stream_error",
            BridgeError::QueueFull => "queue_full",
            BridgeError::CapacityReached { .. } => "capacity_reached",
            BridgeError::ConnectionNotFound(_) => "connection_not_found",
        }
    }

    /// Whether the client should hear about this error.
    pub fn is_client_visible(&self) -> bool {
        !matches!(self, BridgeError::Decode(_) | BridgeError::ConnectionNotFound(_))
    }
}

impl From<TranscriptionError> for BridgeError {
    fn from(err: TranscriptionError) -> Self {
        match err {
            TranscriptionError::Connection(msg) => BridgeError::BackendConnection(msg),
            TranscriptionError::Stream(msg) => BridgeError::BackendStream(msg),
            TranscriptionError::Closed => BridgeError::BackendConnection("backend handle is closed".to_string()),
        }
    }
}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500
/// - BadRequest → 400
/// - NotFound → 404
/// - ServiceUnavailable → 503
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (actix_web::http::StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (actix_web::http::StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::CapacityReached { .. } => AppError::ServiceUnavailable(err.to_string()),
            BridgeError::ConnectionNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_bridge_error_codes() {
        assert_eq!(BridgeError::NotActive.code(), "not_active");
        assert_eq!(BridgeError::AlreadyActive.code(), "already_active");
        assert_eq!(BridgeError::UnknownMessageType("x".into()).code(), "unknown_message_type");
        assert!(!BridgeError::Decode(DecodeError::ZeroChannels).is_client_visible());
        assert!(BridgeError::QueueFull.is_client_visible());
    }

    #[test]
    fn test_transcription_errors_map_to_backend_errors() {
        let err: BridgeError = TranscriptionError::Connection("refused".into()).into();
        assert_eq!(err.code(), "backend_connection_error");
        let err: BridgeError = TranscriptionError::Stream("reset".into()).into();
        assert_eq!(err.code(), "backend_stream_error");
    }

    #[test]
    fn test_capacity_maps_to_503() {
        let err: AppError = BridgeError::CapacityReached { max: 2 }.into();
        assert_eq!(err.error_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::BadRequest("x".into()).error_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_handler_error_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: AppError = json_err.into();
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);

        let err: AppError = BridgeError::ConnectionNotFound("c1".into()).into();
        assert_eq!(err.error_response().status(), StatusCode::NOT_FOUND);

        let err: AppError = BridgeError::QueueFull.into();
        assert_eq!(err.error_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

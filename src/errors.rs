//! Bridge error taxonomy and HTTP response mapping
//!
//! Every caller-facing failure is a distinct, stable kind so the HTTP layer
//! can pick a status code without inspecting message text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn worker: {reason}")]
    Spawn { reason: String },
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("request timed out waiting for worker reply")]
    Timeout,
    #[error("worker unavailable")]
    WorkerUnavailable,
    #[error("invalid request: {message}")]
    InvalidRequest { message: &'static str },
    #[error("too many requests in flight")]
    Overloaded,
    #[error("worker error {code}: {message}")]
    Worker {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
}

impl BridgeError {
    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn invalid_request(message: &'static str) -> Self {
        Self::InvalidRequest { message }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            Self::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                message.to_string(),
                json!({}),
            ),
            Self::Unauthorized { code, message } => (
                StatusCode::UNAUTHORIZED,
                code,
                message.to_string(),
                json!({}),
            ),
            Self::Overloaded => (
                StatusCode::TOO_MANY_REQUESTS,
                "overloaded",
                self.to_string(),
                json!({}),
            ),
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                self.to_string(),
                json!({}),
            ),
            Self::WorkerUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "worker_unavailable",
                self.to_string(),
                json!({}),
            ),
            Self::Spawn { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "spawn_failed",
                self.to_string(),
                json!({}),
            ),
            Self::MalformedFrame { .. } => (
                StatusCode::BAD_GATEWAY,
                "malformed_frame",
                self.to_string(),
                json!({}),
            ),
            Self::Worker {
                code,
                message,
                data,
            } => {
                let details = json!({
                    "worker_code": code,
                    "worker_message": message.clone(),
                    "worker_data": data,
                });
                (
                    StatusCode::BAD_GATEWAY,
                    "worker_error",
                    message,
                    details,
                )
            }
        };

        if status.is_server_error() {
            tracing::warn!(code, %message, "request failed");
        }

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_maps_to_a_distinct_status() {
        let cases = [
            (
                BridgeError::invalid_request("tool name must not be empty"),
                StatusCode::BAD_REQUEST,
            ),
            (
                BridgeError::unauthorized("missing_token", "missing authorization header"),
                StatusCode::UNAUTHORIZED,
            ),
            (BridgeError::Overloaded, StatusCode::TOO_MANY_REQUESTS),
            (BridgeError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                BridgeError::WorkerUnavailable,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BridgeError::Spawn {
                    reason: "no such file".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BridgeError::MalformedFrame {
                    reason: "truncated".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn worker_error_carries_payload_in_details() {
        let err = BridgeError::Worker {
            code: -32601,
            message: "unknown tool".to_string(),
            data: Some(json!({"name": "nope"})),
        };
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}

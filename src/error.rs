// error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Why a webhook was refused. Kept distinct internally; collapsed at the
/// response boundary so an unauthenticated caller only ever learns
/// "Invalid signature" or "Unauthorized".
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("missing {0}")]
    MissingCredentials(&'static str),
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("publish failed: {0:#}")]
    Publish(anyhow::Error),
}

impl IngressError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngressError::MissingCredentials(_) => "missing_credentials",
            IngressError::InvalidSignature => "invalid_signature",
            IngressError::StaleTimestamp => "stale_timestamp",
            IngressError::MalformedPayload(_) => "malformed_payload",
            IngressError::Publish(_) => "publish",
        }
    }

    /// Message shown to the caller.
    pub fn public_message(&self) -> &'static str {
        match self {
            IngressError::InvalidSignature => "Invalid signature",
            _ => "Unauthorized",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        warn!(kind = self.kind(), error = %self, "webhook rejected");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": self.public_message() })),
        )
            .into_response()
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::notify::NotifyError;

/// Message returned for every negative secret read. Missing, expired and
/// exhausted secrets must be indistinguishable to the caller.
pub const UNAVAILABLE_MESSAGE: &str = "secret unavailable";

/// Errors surfaced by the secret and switch engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input. The message is safe to show to the caller.
    #[error("{0}")]
    Validation(String),

    /// Missing, expired or exhausted secret.
    #[error("{UNAVAILABLE_MESSAGE}")]
    Unavailable,

    /// Caller does not own the resource.
    #[error("forbidden")]
    Forbidden,

    /// Owned resource does not exist.
    #[error("not found")]
    NotFound,

    /// Notification gateway failure. Only ever seen by the switch scan.
    #[error("delivery failed: {0}")]
    Delivery(#[from] NotifyError),

    /// Infrastructure fault. Detail is logged, never returned.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Unavailable => (StatusCode::NOT_FOUND, UNAVAILABLE_MESSAGE.to_owned()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_owned()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_owned()),
            Self::Delivery(_) | Self::Store(_) => {
                tracing::error!(error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_detail() {
        let resp = EngineError::Store(anyhow::anyhow!("redb: table corrupted")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unavailable_is_a_plain_404() {
        let resp = EngineError::Unavailable.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(EngineError::Unavailable.to_string(), "secret unavailable");
    }
}

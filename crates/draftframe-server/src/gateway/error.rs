//! Errors surfaced to the embedding application as plain HTTP errors.
//!
//! Only the gateway's own boundary reports through here. Anything caused by the upstream
//! origin is rendered as an in-frame placeholder instead.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use draftframe_core::PreviewError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The caller did not present a valid gateway token.
    #[error("Authentication required")]
    CallerUnauthenticated,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            Self::CallerUnauthenticated => "unauthenticated",
            Self::BadRequest(_) => "invalid",
            Self::Internal(_) => "exception",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::CallerUnauthenticated => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PreviewError> for GatewayError {
    fn from(err: PreviewError) -> Self {
        match err {
            PreviewError::CallerUnauthenticated => Self::CallerUnauthenticated,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "gateway request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

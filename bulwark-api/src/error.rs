//! Domain error → HTTP response mapping.
//!
//! Handlers never surface raw backend messages. Authorization failures and
//! missing objects are indistinguishable on the wire.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bulwark_keystore::KesError;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// A response-ready error: stable status plus a client-safe message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_authorized() -> Self {
        Self::new(StatusCode::FORBIDDEN, "not authorized")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<KesError> for ApiError {
    fn from(e: KesError) -> Self {
        match e {
            KesError::InvalidName(_) | KesError::InvalidPattern(_) => {
                Self::new(StatusCode::BAD_REQUEST, e.to_string())
            }
            KesError::NotAuthorized => Self::not_authorized(),
            KesError::SelfAssign => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            KesError::KeyNotFound(_) | KesError::PolicyNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, e.to_string())
            }
            KesError::KeyExists(_) | KesError::IdentityBound { .. } => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            // Tag failures double as malformed input; kept at 400 for
            // compatibility with clients that never handle 422.
            KesError::Decrypt => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            KesError::Unavailable(detail) => {
                tracing::debug!(error = %detail, "key store unavailable");
                Self::unavailable("key store unavailable")
            }
            KesError::Crypto | KesError::Store(_) => {
                tracing::debug!(error = %e, "internal error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use capsule_core::{CapsuleError, DbError, UnlockError};
use capsule_shared::{CapsuleId, ValidationError};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capsule is not ready yet")]
    NotYetDue { unlock_at: DateTime<Utc> },

    #[error("Capsule is still locked")]
    Locked,

    #[error("Capsule is already unlocked")]
    InvalidState,

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Capsule payload could not be decrypted: {0}")]
    DecryptionFailed(CapsuleId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CapsuleError> for ServerError {
    fn from(e: CapsuleError) -> Self {
        match e {
            CapsuleError::NotFound(id) => Self::NotFound(id.to_string()),
            CapsuleError::Forbidden(_) => Self::Forbidden(e.to_string()),
            CapsuleError::Locked(_) => Self::Locked,
            CapsuleError::InvalidState(_) => Self::InvalidState,
            CapsuleError::Validation(v @ ValidationError::PayloadTooLarge { .. }) => {
                Self::PayloadTooLarge(v.to_string())
            }
            CapsuleError::Validation(v) => Self::BadRequest(v.to_string()),
            CapsuleError::Unlock(u) => u.into(),
            CapsuleError::Crypto(c) => Self::Internal(c.to_string()),
            CapsuleError::Storage(msg) => Self::Internal(msg),
        }
    }
}

impl From<UnlockError> for ServerError {
    fn from(e: UnlockError) -> Self {
        match e {
            UnlockError::NotFound(id) => Self::NotFound(id.to_string()),
            UnlockError::DecryptionFailed(id) => Self::DecryptionFailed(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DbError> for ServerError {
    fn from(e: DbError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::NotYetDue { unlock_at } => {
                let body = serde_json::json!({
                    "error": self.to_string(),
                    "unlock_at": unlock_at,
                });
                return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
            }
            ServerError::Locked => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::InvalidState => (StatusCode::CONFLICT, self.to_string()),
            ServerError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::DecryptionFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Capsule payload could not be decrypted".to_string(),
            ),
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

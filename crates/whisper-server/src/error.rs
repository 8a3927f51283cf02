use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use whisper_shared::{ErrorCode, ProtocolError};
use whisper_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Timestamp outside the accepted window")]
    InvalidTimestamp,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Identity is banned")]
    UserBanned,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidPayload(_) | ServerError::TooLarge { .. } => {
                ErrorCode::InvalidPayload
            }
            ServerError::InvalidTimestamp => ErrorCode::InvalidTimestamp,
            ServerError::AuthFailed(_) => ErrorCode::AuthFailed,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::UserBanned => ErrorCode::UserBanned,
            ServerError::RateLimited => ErrorCode::RateLimited,
            ServerError::Store(_) | ServerError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to show to the client. Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Store(_) | ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidPayload(_) | ServerError::InvalidTimestamp => {
                StatusCode::BAD_REQUEST
            }
            ServerError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) | ServerError::UserBanned => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log at a level matching the failure class.
    pub fn log(&self, context: &str) {
        match self {
            ServerError::Store(e) => tracing::error!(context, error = %e, "Storage failure"),
            ServerError::Internal(e) => tracing::error!(context, error = %e, "Internal failure"),
            ServerError::AuthFailed(_) | ServerError::UserBanned | ServerError::Forbidden(_) => {
                tracing::warn!(context, code = %self.code(), error = %self, "Request rejected")
            }
            _ => tracing::debug!(context, code = %self.code(), error = %self, "Request rejected"),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MalformedFrame(_) | ProtocolError::InvalidField { .. } => {
                ServerError::InvalidPayload(err.to_string())
            }
            ProtocolError::TimestampOutOfWindow => ServerError::InvalidTimestamp,
            ProtocolError::BadSignature => ServerError::AuthFailed("bad signature".to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            self.log("http");
        }

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.client_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_codes() {
        let err: ServerError = ProtocolError::invalid("nonce", "expected 24 bytes").into();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);

        let err: ServerError = ProtocolError::TimestampOutOfWindow.into();
        assert_eq!(err.code(), ErrorCode::InvalidTimestamp);

        let err: ServerError = ProtocolError::BadSignature.into();
        assert_eq!(err.code(), ErrorCode::AuthFailed);
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = ServerError::Store(StoreError::Migration("table exploded".into()));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(!err.client_message().contains("exploded"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

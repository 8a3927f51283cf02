use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes surfaced verbatim to clients in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidTimestamp,
    AuthFailed,
    Forbidden,
    NotFound,
    UserBanned,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::InvalidTimestamp => "INVALID_TIMESTAMP",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::UserBanned => "USER_BANNED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoding and structural validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Timestamp outside the accepted window")]
    TimestampOutOfWindow,

    #[error("Signature verification failed")]
    BadSignature,
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedFrame(_) | ProtocolError::InvalidField { .. } => {
                ErrorCode::InvalidPayload
            }
            ProtocolError::TimestampOutOfWindow => ErrorCode::InvalidTimestamp,
            ProtocolError::BadSignature => ErrorCode::AuthFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::UserBanned).unwrap();
        assert_eq!(json, "\"USER_BANNED\"");
        assert_eq!(ErrorCode::InvalidTimestamp.as_str(), "INVALID_TIMESTAMP");
    }

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(
            ProtocolError::invalid("nonce", "bad length").code(),
            ErrorCode::InvalidPayload
        );
        assert_eq!(
            ProtocolError::TimestampOutOfWindow.code(),
            ErrorCode::InvalidTimestamp
        );
        assert_eq!(ProtocolError::BadSignature.code(), ErrorCode::AuthFailed);
    }
}

//! Error handling for the chat backend

use std::fmt;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat backend error types
///
/// Every variant maps onto one of the wire error codes clients understand.
/// Downstream I/O failures (DB, KV, bus) are collapsed into `Downstream` and
/// surfaced to clients as `SERVER_ERROR`; the original cause stays in the
/// message for the server-side log.
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Bad input from the client
    Validation(String),
    /// Missing or invalid credentials/token
    Unauthorized(String),
    /// Authenticated but not allowed
    Forbidden(String),
    /// Room, user, or message does not exist
    NotFound(String),
    /// Joining a private room without a passcode
    PasscodeRequired(String),
    /// Joining a private room with the wrong passcode
    InvalidPasscode(String),
    /// Room name already taken
    DuplicateRoomName(String),
    /// DB / KV / bus I/O failure
    Downstream(String),
    /// Per-event deadline exceeded
    Timeout(String),
    /// Internal contract violated; degrade, never crash
    Invariant(String),
}

impl ChatError {
    /// Wire error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::Unauthorized(_) => "UNAUTHORIZED",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::PasscodeRequired(_) => "PASSCODE_REQUIRED",
            ChatError::InvalidPasscode(_) => "INVALID_PASSCODE",
            ChatError::DuplicateRoomName(_) => "DUPLICATE_ROOM_NAME",
            ChatError::Downstream(_) => "SERVER_ERROR",
            ChatError::Timeout(_) => "SERVER_ERROR",
            ChatError::Invariant(_) => "GENERIC",
        }
    }

    /// Human-readable error message
    pub fn message(&self) -> &str {
        match self {
            ChatError::Validation(msg)
            | ChatError::Unauthorized(msg)
            | ChatError::Forbidden(msg)
            | ChatError::NotFound(msg)
            | ChatError::PasscodeRequired(msg)
            | ChatError::InvalidPasscode(msg)
            | ChatError::DuplicateRoomName(msg)
            | ChatError::Downstream(msg)
            | ChatError::Timeout(msg)
            | ChatError::Invariant(msg) => msg,
        }
    }

    /// Message safe to echo to a client. Downstream details stay server-side.
    pub fn client_message(&self) -> &str {
        match self {
            ChatError::Downstream(_) => "internal server error",
            ChatError::Timeout(_) => "request timed out",
            ChatError::Invariant(_) => "internal server error",
            other => other.message(),
        }
    }

    /// Create a validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        ChatError::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<T: Into<String>>(msg: T) -> Self {
        ChatError::Unauthorized(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        ChatError::Forbidden(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::NotFound(msg.into())
    }

    /// Create a passcode-required error
    pub fn passcode_required<T: Into<String>>(msg: T) -> Self {
        ChatError::PasscodeRequired(msg.into())
    }

    /// Create an invalid-passcode error
    pub fn invalid_passcode<T: Into<String>>(msg: T) -> Self {
        ChatError::InvalidPasscode(msg.into())
    }

    /// Create a duplicate-room-name error
    pub fn duplicate_room_name<T: Into<String>>(msg: T) -> Self {
        ChatError::DuplicateRoomName(msg.into())
    }

    /// Create a downstream I/O error
    pub fn downstream<T: Into<String>>(msg: T) -> Self {
        ChatError::Downstream(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create an invariant-violation error
    pub fn invariant<T: Into<String>>(msg: T) -> Self {
        ChatError::Invariant(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ChatError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ChatError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ChatError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ChatError::PasscodeRequired(msg) => write!(f, "Passcode required: {}", msg),
            ChatError::InvalidPasscode(msg) => write!(f, "Invalid passcode: {}", msg),
            ChatError::DuplicateRoomName(msg) => write!(f, "Duplicate room name: {}", msg),
            ChatError::Downstream(msg) => write!(f, "Downstream error: {}", msg),
            ChatError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ChatError::Invariant(msg) => write!(f, "Invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".to_string()),
            _ => ChatError::Downstream(format!("database error: {}", err)),
        }
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::Downstream(format!("kv error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Validation(format!("malformed JSON: {}", err))
    }
}

impl From<axum::Error> for ChatError {
    fn from(err: axum::Error) -> Self {
        ChatError::Downstream(format!("socket error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for ChatError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        ChatError::Unauthorized(format!("invalid token: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ChatError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ChatError::Timeout("deadline exceeded".to_string())
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Downstream(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(ChatError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(ChatError::passcode_required("x").code(), "PASSCODE_REQUIRED");
        assert_eq!(ChatError::downstream("x").code(), "SERVER_ERROR");
        assert_eq!(ChatError::timeout("x").code(), "SERVER_ERROR");
    }

    #[test]
    fn test_downstream_details_not_leaked() {
        let err = ChatError::downstream("connection refused to 10.0.0.3:5432");
        assert_eq!(err.client_message(), "internal server error");
        assert!(err.message().contains("10.0.0.3"));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: ChatError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}

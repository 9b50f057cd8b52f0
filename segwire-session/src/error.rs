//! Session error types.

use segwire_protocol::{ErrorCode, ProtocolError};
use segwire_schema::{SchemaError, ValidationError};
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    #[error("method '{method}' not permitted in state '{state}'")]
    StateNotPermitted { method: String, state: String },

    #[error("confirmation mismatch on transaction {0}")]
    ConfirmationMismatch(u8),

    #[error("confirmation '{0}' timed out")]
    ConfirmationTimeout(String),

    #[error("transaction {0} is already open")]
    DuplicateTransaction(u8),

    #[error("no free transaction id")]
    NoFreeTransactionId,

    #[error("method '{0}' has no handler")]
    Unimplemented(String),

    /// An application error raised by a method handler.
    #[error("{message} (code {code})")]
    Application { code: u16, message: String },

    /// A `MethodErr` received from the peer.
    #[error("remote error: {code} - {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("request timeout")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("session closed")]
    SessionClosed,
}

impl SessionError {
    pub fn application(code: u16, message: impl Into<String>) -> Self {
        SessionError::Application {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SessionError::Internal(message.into())
    }

    /// Converts to the wire error code sent in `MethodErr`.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::Validation(_) => ErrorCode::ValidationFailed,
            SessionError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            SessionError::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            SessionError::StateNotPermitted { .. } => ErrorCode::StateNotPermitted,
            SessionError::ConfirmationMismatch(_) => ErrorCode::ConfirmationMismatch,
            SessionError::ConfirmationTimeout(_) => ErrorCode::ConfirmationTimeout,
            SessionError::Unimplemented(_) => ErrorCode::Unimplemented,
            SessionError::Application { code, .. } => ErrorCode::from_u16(*code),
            SessionError::Remote { code, .. } => *code,
            SessionError::Io(_)
            | SessionError::Protocol(_)
            | SessionError::Schema(_)
            | SessionError::DuplicateTransaction(_)
            | SessionError::NoFreeTransactionId
            | SessionError::Timeout
            | SessionError::Internal(_)
            | SessionError::SessionClosed => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error terminates the whole session rather than a
    /// single transaction.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Io(_) | SessionError::DuplicateTransaction(_) => true,
            SessionError::Protocol(e) => e.is_structural(),
            _ => false,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Timeout | SessionError::NoFreeTransactionId => true,
            SessionError::Remote { code, .. } => code.is_retryable(),
            SessionError::Io(_) | SessionError::Protocol(_) | SessionError::SessionClosed => false,
            other => other.error_code().is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let validation = SessionError::from(ValidationError::new("email", "too short"));
        assert_eq!(validation.error_code(), ErrorCode::ValidationFailed);
        assert_eq!(
            SessionError::application(2, "bad credentials").error_code(),
            ErrorCode::Application(2)
        );
        assert_eq!(
            SessionError::ConfirmationTimeout("confirm_terms".into()).error_code(),
            ErrorCode::ConfirmationTimeout
        );
        assert_eq!(
            SessionError::internal("boom").error_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::DuplicateTransaction(3).is_fatal());
        assert!(SessionError::Protocol(ProtocolError::OrphanSegment(1)).is_fatal());
        assert!(!SessionError::Protocol(ProtocolError::Incomplete { needed: 2 }).is_fatal());
        assert!(!SessionError::ConfirmationMismatch(3).is_fatal());
        assert!(!SessionError::RateLimitExceeded("log_in".into()).is_fatal());
    }

    #[test]
    fn test_retryable() {
        assert!(SessionError::Timeout.is_retryable());
        assert!(SessionError::RateLimitExceeded("x".into()).is_retryable());
        assert!(SessionError::Remote {
            code: ErrorCode::RateLimitExceeded,
            message: String::new()
        }
        .is_retryable());
        assert!(!SessionError::SessionClosed.is_retryable());
        assert!(!SessionError::Validation(ValidationError::new("a", "b")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = SessionError::StateNotPermitted {
            method: "log_out".into(),
            state: "awaiting_login".into(),
        };
        assert_eq!(
            err.to_string(),
            "method 'log_out' not permitted in state 'awaiting_login'"
        );
    }
}

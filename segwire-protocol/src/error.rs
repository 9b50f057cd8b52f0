//! Protocol error types and error codes.

use crate::segment::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding field arrays and segments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// More bytes are needed before the segment can be decoded.
    #[error("incomplete input: need at least {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("malformed field array: {0}")]
    MalformedFieldArray(String),

    #[error("malformed segment: {0}")]
    MalformedSegment(String),

    #[error("unknown {direction} segment type code {code}")]
    UnknownSegmentType { direction: Direction, code: u8 },

    #[error("orphan segment on transaction {0}")]
    OrphanSegment(u8),

    #[error("cannot encode value: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFieldArray(reason.into())
    }

    /// Whether this error means the byte stream can no longer be trusted.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ProtocolError::Incomplete { .. } | ProtocolError::Encode(_))
    }
}

/// Numeric error codes carried by `MethodErr` segments.
///
/// Codes `0x0000..=0xFEFF` belong to the application schema. The range above
/// is reserved for errors raised by the engine itself and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Application(u16),
    ValidationFailed,
    UnknownMethod,
    RateLimitExceeded,
    StateNotPermitted,
    ConfirmationMismatch,
    ConfirmationTimeout,
    Unimplemented,
    InternalError,
}

impl ErrorCode {
    /// First code reserved for the engine.
    pub const RESERVED_START: u16 = 0xFF00;

    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Application(code) => *code,
            ErrorCode::ValidationFailed => 0xFF01,
            ErrorCode::UnknownMethod => 0xFF02,
            ErrorCode::RateLimitExceeded => 0xFF03,
            ErrorCode::StateNotPermitted => 0xFF04,
            ErrorCode::ConfirmationMismatch => 0xFF05,
            ErrorCode::ConfirmationTimeout => 0xFF06,
            ErrorCode::Unimplemented => 0xFF07,
            ErrorCode::InternalError => 0xFFFF,
        }
    }

    /// Maps a wire code back to an error code. Unassigned reserved codes
    /// collapse into `InternalError`.
    pub fn from_u16(code: u16) -> Self {
        match code {
            0xFF01 => ErrorCode::ValidationFailed,
            0xFF02 => ErrorCode::UnknownMethod,
            0xFF03 => ErrorCode::RateLimitExceeded,
            0xFF04 => ErrorCode::StateNotPermitted,
            0xFF05 => ErrorCode::ConfirmationMismatch,
            0xFF06 => ErrorCode::ConfirmationTimeout,
            0xFF07 => ErrorCode::Unimplemented,
            c if c >= Self::RESERVED_START => ErrorCode::InternalError,
            c => ErrorCode::Application(c),
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, ErrorCode::Application(_))
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimitExceeded
                | ErrorCode::ConfirmationTimeout
                | ErrorCode::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Application(code) => write!(f, "APPLICATION({})", code),
            ErrorCode::ValidationFailed => write!(f, "VALIDATION_FAILED"),
            ErrorCode::UnknownMethod => write!(f, "UNKNOWN_METHOD"),
            ErrorCode::RateLimitExceeded => write!(f, "RATE_LIMIT_EXCEEDED"),
            ErrorCode::StateNotPermitted => write!(f, "STATE_NOT_PERMITTED"),
            ErrorCode::ConfirmationMismatch => write!(f, "CONFIRMATION_MISMATCH"),
            ErrorCode::ConfirmationTimeout => write!(f, "CONFIRMATION_TIMEOUT"),
            ErrorCode::Unimplemented => write!(f, "UNIMPLEMENTED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

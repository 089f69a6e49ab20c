//! Error handling primitives shared across the core.
//!
//! Every failure a caller can observe from the dispatcher is one of the
//! variants below; the HTTP layer maps them to status codes.

use std::time::Duration;

use thiserror::Error;

/// Stable error codes exposed on the wire and in logs.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Payload failed validation (client error, never retried).
    InvalidInput = 1,
    /// Admission control rejected the request; callers may back off and retry.
    Overloaded = 2,
    /// The scorer did not answer within the per-request budget.
    Timeout = 3,
    /// The scorer reported an error or panicked.
    ScoringFailed = 4,
    /// Catch-all for bugs and broken invariants.
    Internal = 5,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ScoringFailed => "scoring_failed",
            ErrorCode::Internal => "internal",
        }
    }

    /// Whether a caller can reasonably retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::Overloaded | ErrorCode::Timeout)
    }
}

/// Canonical error type for the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum MlError {
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        /// Offending payload key, when the scorer named one.
        field: Option<String>,
    },

    #[error("dispatcher overloaded: {capacity} requests already in flight")]
    Overloaded { capacity: usize },

    #[error("scoring timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("scoring failed: {0}")]
    ScoringFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type MlResult<T> = Result<T, MlError>;

impl MlError {
    /// Validation helper.
    pub fn invalid(message: impl Into<String>) -> Self {
        MlError::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Validation helper pointing at a single payload key.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MlError::InvalidInput {
            message: reason.into(),
            field: Some(field.into()),
        }
    }

    pub fn scoring_failed(message: impl Into<String>) -> Self {
        MlError::ScoringFailed(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MlError::Internal(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            MlError::InvalidInput { .. } => ErrorCode::InvalidInput,
            MlError::Overloaded { .. } => ErrorCode::Overloaded,
            MlError::Timeout(_) => ErrorCode::Timeout,
            MlError::ScoringFailed(_) => ErrorCode::ScoringFailed,
            MlError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Field name attached to an `InvalidInput` error, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            MlError::InvalidInput { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

//! Error taxonomy for the vessel runtime.
//!
//! A single enum covers every reported failure kind. Variants carry a
//! human-readable message; `Internal` additionally carries an optional
//! cause. Errors are `Clone` because some results are cached and handed to
//! concurrent callers (process deletion), so the cause is stored behind an
//! `Arc`.

use std::sync::Arc;

pub type VesselResult<T> = Result<T, VesselError>;

/// Cause of an internal error, preserved for the error chain.
#[derive(Debug, Clone)]
pub struct ErrorCause(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl std::fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Runtime error carrying a kind, a message, and an optional cause.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VesselError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },
}

impl VesselError {
    /// Internal error with no underlying cause.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Internal error wrapping an underlying cause.
    pub fn internal_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(ErrorCause(Arc::new(source))),
        }
    }

    /// The reported kind of this error, as a stable string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Exists(_) => "exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidState(_) => "invalid_state",
            Self::Unsupported(_) => "unsupported",
            Self::Exhausted(_) => "exhausted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for VesselError {
    fn from(err: std::io::Error) -> Self {
        Self::internal_with("i/o failure", err)
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal_with("serialization failure", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(VesselError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            VesselError::InvalidState("x".into()).kind(),
            "invalid_state"
        );
        assert_eq!(VesselError::internal("x").kind(), "internal_error");
    }

    #[test]
    fn test_cause_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = VesselError::internal_with("mount failed", io);

        let source = std::error::Error::source(&err).expect("has a cause");
        assert!(source.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_errors_are_clone() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = VesselError::internal_with("wrapped", io);
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}

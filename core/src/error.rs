//! Error taxonomy for idempotent execution.
//!
//! Only infrastructure and encoding failures are errors here. A duplicate
//! in-flight claim is a normal branch ([`crate::ClaimOutcome::Duplicate`]) and a
//! completion without a prior claim is a logged no-op.

use thiserror::Error;

/// Errors raised by a [`crate::KeyValueStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, timeout, failover).
    ///
    /// Read-only idempotency checks fail open on this error; claims propagate it.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but rejected the command.
    #[error("Store command failed: {0}")]
    Backend(String),
}

/// Errors on the correctness-critical path (claim, completion, replay).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record or result could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure raised by business logic wrapped in a guard or event handler.
///
/// The variant decides the default retry classification: validation failures
/// are permanent, everything else is presumed transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The input was rejected; retrying the same input cannot succeed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Processing failed for any other reason.
    #[error("Processing failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Whether this error belongs to the validation class.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
    }

    #[test]
    fn idempotency_error_is_transparent_over_store_error() {
        let err: IdempotencyError = StoreError::Backend("WRONGTYPE".to_string()).into();
        assert_eq!(err.to_string(), "Store command failed: WRONGTYPE");
    }

    #[test]
    fn handler_error_classification() {
        assert!(HandlerError::Validation("seat taken".to_string()).is_validation());
        assert!(!HandlerError::Failed("timeout".to_string()).is_validation());
    }
}

//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Failure of a deterministic billing rule.
///
/// Storage and connectivity failures belong to the infrastructure layer;
/// everything here is caused by the data handed in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input rejected before any computation (negative amount, bad name, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An amount, or an intermediate sum, does not fit the money range.
    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// State the entity is already in forbids the change.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn amount_out_of_range(msg: impl Into<String>) -> Self {
        Self::AmountOutOfRange(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Whether retrying with different input could succeed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::AmountOutOfRange(_) | Self::InvalidId(_)
        )
    }
}

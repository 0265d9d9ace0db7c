use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Longest accepted sequence name.
pub const MAX_SEQUENCE_NAME_LEN: usize = 100;

/// Sequence allocation error.
///
/// `Validation` means the request itself is wrong and retrying will not help.
/// `AllocationFailed` means the store could not hand out a value (conflict,
/// connection loss, overflow); no value was consumed and the caller may retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("invalid sequence request: {0}")]
    Validation(String),

    #[error("sequence allocation failed: {0}")]
    AllocationFailed(String),
}

impl SequenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SequenceError::AllocationFailed(_))
    }
}

/// Validated sequence name: 1..=100 chars of ASCII alphanumerics, `_ - . :`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceName(String);

impl SequenceName {
    pub fn parse(name: &str) -> Result<Self, SequenceError> {
        if name.is_empty() {
            return Err(SequenceError::Validation(
                "sequence name must not be empty".to_string(),
            ));
        }
        if name.len() > MAX_SEQUENCE_NAME_LEN {
            return Err(SequenceError::Validation(format!(
                "sequence name longer than {MAX_SEQUENCE_NAME_LEN} characters"
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
        {
            return Err(SequenceError::Validation(format!(
                "sequence name '{name}' contains invalid character {bad:?}"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SequenceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a `next_value` request before touching any store.
pub(crate) fn validate_request(
    name: &str,
    initial_value: i64,
) -> Result<SequenceName, SequenceError> {
    let name = SequenceName::parse(name)?;
    check_initial_value(initial_value)?;
    Ok(name)
}

/// Sequences count up from a non-negative start.
pub(crate) fn check_initial_value(initial_value: i64) -> Result<(), SequenceError> {
    if initial_value < 0 {
        return Err(SequenceError::Validation(format!(
            "initial value must not be negative (got {initial_value})"
        )));
    }
    Ok(())
}

/// Allocator of the next value in a named sequence.
///
/// Implementations must:
/// - return `initial_value` on the very first call for a name, and ignore it
///   afterwards
/// - never return the same value twice for a name, whatever the concurrency
/// - make the commit the point of assignment, so a failed call issues nothing
/// - reject invalid requests with [`SequenceError::Validation`] before any
///   store interaction
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    async fn next_value(&self, name: &str, initial_value: i64) -> Result<i64, SequenceError>;
}

#[async_trait]
impl<A> SequenceAllocator for Arc<A>
where
    A: SequenceAllocator + ?Sized,
{
    async fn next_value(&self, name: &str, initial_value: i64) -> Result<i64, SequenceError> {
        (**self).next_value(name, initial_value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_usual_names() {
        for name in ["invoice_numbers", "agreement_identifier:MA:1:22", "a.b-c"] {
            assert_eq!(SequenceName::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_empty_long_and_odd_names() {
        assert!(SequenceName::parse("").is_err());
        assert!(SequenceName::parse(&"x".repeat(MAX_SEQUENCE_NAME_LEN + 1)).is_err());
        assert!(SequenceName::parse("invoice numbers").is_err());
        assert!(SequenceName::parse("numbers;DROP").is_err());
    }

    #[test]
    fn negative_initial_value_is_a_validation_error() {
        let err = validate_request("invoice_numbers", -5).unwrap_err();
        assert!(matches!(err, SequenceError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn allocation_failures_are_retryable() {
        assert!(SequenceError::AllocationFailed("connection reset".into()).is_retryable());
    }
}

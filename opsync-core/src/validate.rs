//! Pluggable validation for store mutations.

use crate::entity::Entity;
use crate::error::{ErrorMeta, NormalizedError};
use thiserror::Error;

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Partition mismatch: store is scoped to {expected}, candidate belongs to {got}")]
    PartitionMismatch { expected: String, got: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::RequiredFieldMissing { field } | Self::InvalidValue { field, .. } => Some(field),
            Self::PartitionMismatch { .. } => None,
        }
    }
}

impl From<ValidationError> for NormalizedError {
    fn from(err: ValidationError) -> Self {
        let details = err
            .field()
            .map(|field| serde_json::json!({ "field": field }));
        NormalizedError::validation(err.to_string()).with_meta(ErrorMeta {
            details,
            ..ErrorMeta::default()
        })
    }
}

/// Caller-supplied predicate deciding whether a mutation may leave the client.
pub trait Validator<E: Entity>: Send + Sync {
    /// Check a candidate before `add`.
    fn validate_new(&self, candidate: &E) -> Result<(), ValidationError>;

    /// Check partial changes before `update`.
    fn validate_patch(&self, _patch: &E::Patch) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<E: Entity> Validator<E> for AcceptAll {
    fn validate_new(&self, _candidate: &E) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Adapts a closure into a [`Validator`] for new candidates.
pub struct FnValidator<F>(pub F);

impl<E, F> Validator<E> for FnValidator<F>
where
    E: Entity,
    F: Fn(&E) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate_new(&self, candidate: &E) -> Result<(), ValidationError> {
        (self.0)(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_validation_error_normalizes_with_field() {
        let err: NormalizedError = ValidationError::missing("date").into();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("date"));
        assert_eq!(
            err.meta.details,
            Some(serde_json::json!({ "field": "date" }))
        );
    }

    #[test]
    fn test_validation_error_display_invalid_value() {
        let err = ValidationError::invalid("hour", "expected HH:MM");
        let msg = format!("{}", err);
        assert!(msg.contains("hour"));
        assert!(msg.contains("HH:MM"));
    }
}

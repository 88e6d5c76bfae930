use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

/// A single structured reason why a value or payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Path of the offending field, e.g. `email` or `validation.values[1]`
    pub field: String,
    /// Machine readable failure kind, e.g. `required`, `stringPattern`, `enumValue`
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// What the rule expected, when meaningful
    pub expected: Option<String>,
    /// What was actually found, when meaningful
    pub actual: Option<String>,
}

impl ValidationFailure {
    /// Creates a failure without expected/actual details.
    #[must_use]
    pub fn new(field: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: kind.to_string(),
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    /// Attaches the expected value description.
    #[must_use]
    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    /// Attaches the actual value description.
    #[must_use]
    pub fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }
}

/// Errors raised by schema definition, migration and administrative operations.
#[crate::claims_error]
pub enum ClaimsError {
    /// A payload, compiled migration or migrated value was rejected.
    ///
    /// Carries every structured failure plus debug context (the raw payload, the `{key: value}`
    /// pair that failed, or the identity being migrated).
    #[error("validation failed: {message}")]
    Validation {
        /// Summary of what was being validated
        message: String,
        /// Structured failures, possibly empty when wrapping a foreign error
        failures: Vec<ValidationFailure>,
        /// Debug context for the failure
        context: Value,
    },

    /// The store adapter failed. Always fatal to the current operation.
    #[error(transparent)]
    Adapter(#[from] StoreError),

    /// The per-key lock could not be acquired in time.
    #[error("timed out acquiring migration lock for {key} after {waited_ms}ms")]
    LockContention {
        /// The contended claim key
        key: String,
        /// How long acquisition was attempted
        waited_ms: u64,
    },
}

impl ClaimsError {
    /// Builds a [`ClaimsError::Validation`].
    #[must_use]
    pub fn validation(
        message: impl Into<String>,
        failures: Vec<ValidationFailure>,
        context: Value,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            failures,
            context,
        }
    }

    /// Structured failures of a validation error; empty for every other variant.
    #[must_use]
    pub fn failures(&self) -> &[ValidationFailure] {
        match self {
            Self::Validation { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Returns `true` for [`ClaimsError::Validation`].
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<serde_json::Error> for ClaimsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Generic {
            message: format!("JSON error: {e}"),
        }
    }
}

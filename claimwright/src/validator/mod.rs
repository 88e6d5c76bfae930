//! Compiled claim validators.
//!
//! A schema's `validation` rule is compiled once per submission into a [`ClaimsValidator`]
//! scoped to exactly one claim key, then shared read-only by every identity task of the
//! migration run.

mod rule;

pub use rule::{Rule, RuleError};

use serde_json::{Map, Value};

use crate::schema::ClaimsSchema;
use crate::{ClaimsError, ValidationFailure};

/// Compiles schema validation rules into [`ClaimsValidator`]s.
pub struct ValidatorFactory;

impl ValidatorFactory {
    /// Compiles the validation rule of `schema`.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` if the rule is not valid JSON or not a valid rule.
    pub fn compile(schema: &ClaimsSchema) -> Result<ClaimsValidator, ClaimsError> {
        let definition: Value = serde_json::from_str(&schema.validation).map_err(|e| {
            ClaimsError::validation(
                format!("validation rule of '{}' is not valid JSON", schema.key),
                vec![ValidationFailure::new("validation", "json", e.to_string())],
                Value::String(schema.validation.clone()),
            )
        })?;

        let rule = Rule::parse(&definition).map_err(|e| {
            ClaimsError::validation(
                format!("validation rule of '{}' does not compile", schema.key),
                vec![ValidationFailure::new(
                    format!("validation{}", e.path),
                    "validationRule",
                    e.message,
                )],
                definition.clone(),
            )
        })?;

        Ok(ClaimsValidator {
            key: schema.key.clone(),
            rule: Rule::single_property(&schema.key, rule),
        })
    }
}

/// Strict predicate over `{key: value}` for a single claim key.
#[derive(Debug, Clone)]
pub struct ClaimsValidator {
    key: String,
    rule: Rule,
}

impl ClaimsValidator {
    /// The claim key this validator is scoped to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Validates one claim value.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` with context `{key: value}` and every structured failure.
    pub fn validate(&self, value: &Value) -> Result<(), ClaimsError> {
        let subject = Value::Object(Map::from_iter([(self.key.clone(), value.clone())]));
        let mut failures = Vec::new();
        self.rule.check("", &subject, &mut failures);

        if failures.is_empty() {
            return Ok(());
        }

        // Drop the leading '.' of the root-relative paths.
        for failure in &mut failures {
            if let Some(field) = failure.field.strip_prefix('.') {
                failure.field = field.to_string();
            }
        }

        Err(ClaimsError::validation(
            format!("claim '{}' failed validation", self.key),
            failures,
            subject,
        ))
    }
}

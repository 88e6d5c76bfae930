use serde_json::{Map, Value};

use super::{content_digest, ClaimsSchema, ClaimsSchemaPayload};
use crate::migration::FORCE_RELOAD_LOCK_KEY;
use crate::validator::Rule;
use crate::{ClaimsError, ValidationFailure};

/// Length of a hex-encoded keccak256 digest.
const VERSION_HEX_LEN: usize = 64;

/// Turns schema definition payloads into versioned [`ClaimsSchema`] records.
///
/// Compilation is pure: it never touches the store and never decides `active`, which is the
/// orchestrator's job.
pub struct SchemaCompiler;

impl SchemaCompiler {
    /// Validates the shape of `payload` and computes its content version.
    ///
    /// Every shape problem is collected before failing, so callers see all of them at once.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` carrying the raw payload and the structured failures if the
    ///   payload is malformed.
    pub fn compile(payload: &ClaimsSchemaPayload) -> Result<ClaimsSchema, ClaimsError> {
        let mut failures = Vec::new();

        check_identifier("key", &payload.key, &mut failures);
        check_identifier("scope", &payload.scope, &mut failures);
        if payload.key == FORCE_RELOAD_LOCK_KEY {
            failures.push(
                ValidationFailure::new("key", "reserved", "key is reserved for claim reloads")
                    .actual(payload.key.clone()),
            );
        }

        let validation = match serde_json::from_str::<Value>(&payload.validation) {
            Ok(value) => {
                if let Err(e) = Rule::parse(&value) {
                    failures.push(
                        ValidationFailure::new(
                            format!("validation{}", e.path),
                            "validationRule",
                            e.message,
                        )
                        .actual(payload.validation.clone()),
                    );
                }
                Some(value)
            }
            Err(e) => {
                failures.push(
                    ValidationFailure::new("validation", "json", format!("invalid JSON: {e}"))
                        .actual(payload.validation.clone()),
                );
                None
            }
        };

        let seed = match payload.seed.as_deref() {
            None => Some(Value::Null),
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Some(value),
                Err(e) => {
                    failures.push(
                        ValidationFailure::new("seed", "json", format!("invalid JSON: {e}"))
                            .actual(text),
                    );
                    None
                }
            },
        };

        if payload
            .migration
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            failures.push(ValidationFailure::new(
                "migration",
                "stringEmpty",
                "migration must name a transform when present",
            ));
        }

        if let Some(parent_version) = payload.parent_version.as_deref() {
            if !is_version(parent_version) {
                failures.push(
                    ValidationFailure::new(
                        "parent_version",
                        "version",
                        "parent_version must be a schema version",
                    )
                    .expected(format!("{VERSION_HEX_LEN} lowercase hex characters"))
                    .actual(parent_version),
                );
            }
        }

        let (Some(validation), Some(seed), true) = (validation, seed, failures.is_empty()) else {
            return Err(ClaimsError::validation(
                format!("invalid claims schema payload for '{}'", payload.key),
                failures,
                serde_json::to_value(payload).unwrap_or_default(),
            ));
        };

        let version = content_digest(&hash_input(payload, &validation, &seed));

        Ok(ClaimsSchema {
            key: payload.key.clone(),
            scope: payload.scope.clone(),
            description: payload.description.clone(),
            validation: validation.to_string(),
            migration: payload.migration.clone(),
            seed: seed.to_string(),
            version,
            parent_version: payload.parent_version.clone(),
            active: false,
        })
    }
}

/// Builds the structure whose canonical encoding is hashed into the version.
///
/// JSON-text fields are hashed as parsed values, and a `null` seed is treated as absent so a
/// stored schema and the payload that created it agree.
fn hash_input(payload: &ClaimsSchemaPayload, validation: &Value, seed: &Value) -> Value {
    let mut map = Map::new();
    map.insert("scope".to_string(), Value::String(payload.scope.clone()));
    map.insert("key".to_string(), Value::String(payload.key.clone()));
    if let Some(description) = &payload.description {
        map.insert("description".to_string(), Value::String(description.clone()));
    }
    map.insert("validation".to_string(), validation.clone());
    if let Some(migration) = &payload.migration {
        map.insert("migration".to_string(), Value::String(migration.clone()));
    }
    if !seed.is_null() {
        map.insert("seed".to_string(), seed.clone());
    }
    if let Some(parent_version) = &payload.parent_version {
        map.insert(
            "parentVersion".to_string(),
            Value::String(parent_version.clone()),
        );
    }
    Value::Object(map)
}

fn check_identifier(field: &str, value: &str, failures: &mut Vec<ValidationFailure>) {
    if value.is_empty() {
        failures.push(ValidationFailure::new(
            field,
            "required",
            format!("{field} must not be empty"),
        ));
    } else if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        failures.push(
            ValidationFailure::new(
                field,
                "identifier",
                format!("{field} may only contain letters, digits, '_', '.', ':' and '-'"),
            )
            .actual(value),
        );
    }
}

fn is_version(value: &str) -> bool {
    value.len() == VERSION_HEX_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

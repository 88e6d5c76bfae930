//! Claims schema records.
//!
//! A [`ClaimsSchemaPayload`] is what callers submit; [`SchemaCompiler`] turns it into an
//! immutable [`ClaimsSchema`] whose `version` is a structural content hash of the payload.
//! JSON-valued fields (`validation`, `seed`) travel as JSON text so the records can cross the
//! FFI boundary unchanged.

mod canonical;
mod compiler;

pub use canonical::{canonical_json, content_digest};
pub use compiler::SchemaCompiler;

use serde::{Deserialize, Serialize};

/// Number of version characters shown in logs.
const SHORT_VERSION_LEN: usize = 8;

/// A request to define (or redefine) the schema of one claim key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
pub struct ClaimsSchemaPayload {
    /// Disclosure scope the claim belongs to, e.g. `email`
    pub scope: String,
    /// Unique claim key, e.g. `email_verified`
    pub key: String,
    /// Optional free-form description
    pub description: Option<String>,
    /// Validation rule as JSON text, e.g. `"string"` or `{"type":"enum","values":["a","b"]}`
    pub validation: String,
    /// Name of the migration transform; the default `keep_or_seed` transform when absent
    pub migration: Option<String>,
    /// Seed value passed to the migration transform, as JSON text; `null` when absent
    pub seed: Option<String>,
    /// Version this schema migrates from; the active schema when absent
    pub parent_version: Option<String>,
}

/// A versioned claims schema as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
pub struct ClaimsSchema {
    /// Unique claim key
    pub key: String,
    /// Disclosure scope
    pub scope: String,
    /// Optional description
    pub description: Option<String>,
    /// Validation rule as JSON text
    pub validation: String,
    /// Name of the migration transform
    pub migration: Option<String>,
    /// Seed value as JSON text, `null` when the payload had none
    pub seed: String,
    /// Content hash of the defining payload
    pub version: String,
    /// Version this schema was migrated from
    pub parent_version: Option<String>,
    /// Whether this is the effective schema for `key`
    pub active: bool,
}

impl ClaimsSchema {
    /// The first characters of the version, for log lines.
    #[must_use]
    pub fn short_version(&self) -> &str {
        short_version(&self.version)
    }

    /// `parent -> version` or just `version`, for log lines.
    #[must_use]
    pub fn version_transition(&self) -> String {
        self.parent_version.as_deref().map_or_else(
            || self.short_version().to_string(),
            |parent| format!("{} -> {}", short_version(parent), self.short_version()),
        )
    }

    /// Rebuilds the payload that defines this schema.
    ///
    /// Compiling the returned payload yields the same version unless the parent was
    /// explicitly requested at definition time.
    #[must_use]
    pub fn to_payload(&self) -> ClaimsSchemaPayload {
        ClaimsSchemaPayload {
            scope: self.scope.clone(),
            key: self.key.clone(),
            description: self.description.clone(),
            validation: self.validation.clone(),
            migration: self.migration.clone(),
            seed: Some(self.seed.clone()),
            parent_version: None,
        }
    }
}

/// Truncates a version for display.
#[must_use]
pub fn short_version(version: &str) -> &str {
    version.get(..SHORT_VERSION_LEN).unwrap_or(version)
}

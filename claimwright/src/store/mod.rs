//! The store adapter contract.
//!
//! The host persists schemata, versioned claim values and locks, and hands out identity pages.
//! `claimwright` never stores anything itself: every read goes through [`ClaimsStore`] and every
//! mutation goes through an explicit [`ClaimsTransaction`] handle, so the scope of an
//! all-or-nothing migration is visible in the types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::ClaimsSchema;

/// Errors reported by the host's store adapter.
#[crate::claims_error]
pub enum StoreError {
    /// A referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// A write collides with existing state, e.g. a duplicate `(key, version)` schema
    #[error("conflict: {0}")]
    Conflict(String),
    /// The transaction could not be committed or rolled back
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    /// Any other backend failure
    #[error("store backend failure: {0}")]
    Backend(String),
    /// An unexpected error occurred in the foreign callback
    #[error("unexpected error in foreign callback: {0}")]
    UnexpectedUniFFICallbackError(String),
}

impl From<uniffi::UnexpectedUniFFICallbackError> for StoreError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::UnexpectedUniFFICallbackError(e.reason)
    }
}

/// Selects schemata by any combination of key, version and active flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, uniffi::Record)]
pub struct SchemaFilter {
    /// Claim key to match
    pub key: Option<String>,
    /// Schema version to match
    pub version: Option<String>,
    /// Active flag to match
    pub active: Option<bool>,
}

impl SchemaFilter {
    /// Every schema of `key`.
    #[must_use]
    pub fn key(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::default()
        }
    }

    /// The schema `(key, version)`.
    #[must_use]
    pub fn version(key: &str, version: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            version: Some(version.to_string()),
            active: None,
        }
    }

    /// The active schema of `key`.
    #[must_use]
    pub fn active(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            version: None,
            active: Some(true),
        }
    }

    /// Every active schema.
    #[must_use]
    pub fn all_active() -> Self {
        Self {
            active: Some(true),
            ..Self::default()
        }
    }

    /// Whether `schema` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, schema: &ClaimsSchema) -> bool {
        self.key.as_ref().is_none_or(|key| *key == schema.key)
            && self
                .version
                .as_ref()
                .is_none_or(|version| *version == schema.version)
            && self.active.is_none_or(|active| active == schema.active)
    }
}

/// One page of the identity population.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct IdentityPageRequest {
    /// Opaque, store-defined identity filter (JSON text), `None` for everyone
    pub filter: Option<String>,
    /// Number of identities to skip
    pub offset: u64,
    /// Maximum number of identities to return
    pub limit: u64,
}

/// Reference to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, uniffi::Record)]
pub struct IdentityRef {
    /// Opaque identity id
    pub id: String,
}

/// Asks for the value of `key` stored under `schema_version`.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct VersionedClaimQuery {
    /// Claim key
    pub key: String,
    /// Schema version the value was written under
    pub schema_version: String,
}

/// A claim value tagged with the schema version that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
pub struct VersionedClaim {
    /// Claim key
    pub key: String,
    /// Value as JSON text; absent values are stored as `null`
    pub value: String,
    /// Version of the schema the value conforms to
    pub schema_version: String,
}

/// Storage adapter implemented by the host (natively in Rust or through foreign bindings).
///
/// Locks are plain try-acquire records keyed by claim key: `acquire_lock` must return `false`
/// whenever the key is already held, even by the same holder, so one holder cannot re-enter a
/// key it is already migrating.
#[uniffi::export(with_foreign)]
#[async_trait::async_trait]
pub trait ClaimsStore: Send + Sync {
    /// Opens a transaction; every mutation of a migration goes through the returned handle.
    ///
    /// Synchronous: object handles cannot be returned through a foreign future. Hosts whose
    /// driver opens transactions asynchronously defer that work to the first write.
    ///
    /// # Errors
    /// - `StoreError::TransactionFailed` if no transaction can be opened
    fn begin_transaction(&self) -> Result<Arc<dyn ClaimsTransaction>, StoreError>;

    /// Tries once to take the lock on `key` for `holder`.
    ///
    /// # Errors
    /// - `StoreError::Backend` if the lock table cannot be reached
    async fn acquire_lock(&self, key: String, holder: String) -> Result<bool, StoreError>;

    /// Releases the lock on `key`. With `holder` set, only that holder's lock is released;
    /// with `None` the lock is released unconditionally.
    ///
    /// # Errors
    /// - `StoreError::Backend` if the lock table cannot be reached
    async fn release_lock(&self, key: String, holder: Option<String>) -> Result<(), StoreError>;

    /// The first schema matching `filter`.
    ///
    /// # Errors
    /// - `StoreError::Backend` on read failures
    async fn get_schema(&self, filter: SchemaFilter) -> Result<Option<ClaimsSchema>, StoreError>;

    /// Every schema matching `filter`.
    ///
    /// # Errors
    /// - `StoreError::Backend` on read failures
    async fn get_schemata(&self, filter: SchemaFilter) -> Result<Vec<ClaimsSchema>, StoreError>;

    /// Observer hook: the set of active schemata changed.
    ///
    /// # Errors
    /// - any error aborts the surrounding operation
    async fn on_schema_changed(&self) -> Result<(), StoreError>;

    /// One page of identities, ordered consistently across calls.
    ///
    /// # Errors
    /// - `StoreError::Backend` on read failures
    async fn get_identity_page(
        &self,
        request: IdentityPageRequest,
    ) -> Result<Vec<IdentityRef>, StoreError>;

    /// The raw claim bag of an identity as a JSON object.
    ///
    /// # Errors
    /// - `StoreError::NotFound` if the identity does not exist
    async fn get_identity_claims(&self, identity_id: String) -> Result<String, StoreError>;

    /// The stored values for the requested `(key, schema_version)` pairs; missing pairs are
    /// simply absent from the result.
    ///
    /// # Errors
    /// - `StoreError::Backend` on read failures
    async fn get_versioned_claims(
        &self,
        identity_id: String,
        queries: Vec<VersionedClaimQuery>,
    ) -> Result<Vec<VersionedClaim>, StoreError>;

    /// Observer hook: the effective claims of `identity_id` changed.
    ///
    /// # Errors
    /// - any error aborts the surrounding operation
    async fn on_claims_changed(&self, identity_id: String) -> Result<(), StoreError>;
}

/// A store transaction. Nothing written through it is visible until [`commit`](Self::commit).
#[uniffi::export(with_foreign)]
#[async_trait::async_trait]
pub trait ClaimsTransaction: Send + Sync {
    /// Persists a new schema row.
    ///
    /// # Errors
    /// - `StoreError::Conflict` if `(key, version)` already exists
    async fn create_schema(&self, schema: ClaimsSchema) -> Result<(), StoreError>;

    /// Marks `(key, version)` active and every other schema of `key` inactive.
    ///
    /// # Errors
    /// - `StoreError::NotFound` if `(key, version)` does not exist
    async fn set_active_schema(&self, key: String, version: String) -> Result<(), StoreError>;

    /// Removes every schema row of `key`. Versioned claims are left untouched.
    ///
    /// # Errors
    /// - `StoreError::Backend` on write failures
    async fn force_delete_schema(&self, key: String) -> Result<(), StoreError>;

    /// Upserts versioned claim values of one identity.
    ///
    /// # Errors
    /// - `StoreError::Backend` on write failures
    async fn put_versioned_claims(
        &self,
        identity_id: String,
        claims: Vec<VersionedClaim>,
    ) -> Result<(), StoreError>;

    /// Applies every staged write atomically.
    ///
    /// # Errors
    /// - `StoreError::TransactionFailed` if the writes could not be applied; nothing is applied
    async fn commit(&self) -> Result<(), StoreError>;

    /// Discards every staged write.
    ///
    /// # Errors
    /// - `StoreError::TransactionFailed` if the backend could not roll back
    async fn rollback(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(key: &str, version: &str, active: bool) -> ClaimsSchema {
        ClaimsSchema {
            key: key.to_string(),
            scope: key.to_string(),
            description: None,
            validation: "\"string\"".to_string(),
            migration: None,
            seed: "null".to_string(),
            version: version.to_string(),
            parent_version: None,
            active,
        }
    }

    #[test]
    fn test_filter_matching() {
        let active = schema("email", "v1", true);
        let inactive = schema("email", "v0", false);

        assert!(SchemaFilter::default().matches(&inactive));
        assert!(SchemaFilter::key("email").matches(&inactive));
        assert!(!SchemaFilter::key("name").matches(&active));
        assert!(SchemaFilter::active("email").matches(&active));
        assert!(!SchemaFilter::active("email").matches(&inactive));
        assert!(SchemaFilter::version("email", "v0").matches(&inactive));
        assert!(!SchemaFilter::version("email", "v0").matches(&active));
        assert!(SchemaFilter::all_active().matches(&active));
    }

    #[test]
    fn test_callback_error_conversion() {
        let err = StoreError::from(uniffi::UnexpectedUniFFICallbackError::new("boom"));
        assert_eq!(err.to_string(), "unexpected error in foreign callback: boom");
    }
}

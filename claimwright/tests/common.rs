use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use claimwright::migration::{ClaimTransform, ClaimsSchemaManager, TransformError, TransformInput};
use claimwright::primitives::ClaimsManagerConfig;
use claimwright::schema::ClaimsSchemaPayload;
use claimwright::test_utils::InMemoryClaimsStore;

/// Fast timeouts and no base claims, so `start` only defines `sub`.
#[allow(dead_code)]
pub fn test_config() -> ClaimsManagerConfig {
    ClaimsManagerConfig {
        base_claims: vec![],
        lock_timeout_ms: 2_000,
        lock_retry_interval_ms: 5,
        ..ClaimsManagerConfig::default()
    }
}

#[allow(dead_code)]
pub fn manager(store: &InMemoryClaimsStore) -> Arc<ClaimsSchemaManager> {
    manager_with(store, test_config(), vec![])
}

#[allow(dead_code)]
pub fn manager_with(
    store: &InMemoryClaimsStore,
    config: ClaimsManagerConfig,
    transforms: Vec<Arc<dyn ClaimTransform>>,
) -> Arc<ClaimsSchemaManager> {
    ClaimsSchemaManager::new(Arc::new(store.clone()), config, transforms)
}

/// Waits for locks released from background tasks after a dropped operation.
#[allow(dead_code)]
pub async fn wait_for_unlock(store: &InMemoryClaimsStore, key: &str) {
    for _ in 0..200 {
        if store.lock_holder(key).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub fn payload(key: &str, validation: &Value) -> ClaimsSchemaPayload {
    ClaimsSchemaPayload {
        scope: key.to_string(),
        key: key.to_string(),
        validation: validation.to_string(),
        ..ClaimsSchemaPayload::default()
    }
}

#[allow(dead_code)]
pub fn seeded(payload: ClaimsSchemaPayload, seed: &Value) -> ClaimsSchemaPayload {
    ClaimsSchemaPayload {
        seed: Some(seed.to_string()),
        ..payload
    }
}

#[allow(dead_code)]
pub fn with_migration(payload: ClaimsSchemaPayload, migration: &str) -> ClaimsSchemaPayload {
    ClaimsSchemaPayload {
        migration: Some(migration.to_string()),
        ..payload
    }
}

/// Lowercases string values; keeps everything else.
pub struct Lowercase;

impl ClaimTransform for Lowercase {
    fn name(&self) -> String {
        "lowercase".to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        let old: Value = serde_json::from_str(&input.old_value)
            .map_err(|e| TransformError::Rejected(e.to_string()))?;
        Ok(Some(match old {
            Value::String(s) => Value::String(s.to_lowercase()).to_string(),
            other => other.to_string(),
        }))
    }
}

/// Copies the seed, but rejects the identity whose `sub` is `poisoned`.
pub struct FailFor {
    pub poisoned: String,
}

impl ClaimTransform for FailFor {
    fn name(&self) -> String {
        "fail_for".to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        let claims: Value = serde_json::from_str(&input.claims)
            .map_err(|e| TransformError::Rejected(e.to_string()))?;
        if claims["sub"] == Value::String(self.poisoned.clone()) {
            return Err(TransformError::Rejected(format!(
                "{} cannot be migrated",
                self.poisoned
            )));
        }
        Ok(Some(input.seed_value))
    }
}

/// Never finishes within any reasonable migration timeout.
pub struct Sleepy;

impl ClaimTransform for Sleepy {
    fn name(&self) -> String {
        "sleepy".to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(Some(input.seed_value))
    }
}

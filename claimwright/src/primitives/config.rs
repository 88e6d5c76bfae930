use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::json;

use crate::schema::ClaimsSchemaPayload;

/// Scope every identity discloses; always part of the mandatory scopes.
pub const BASE_SCOPE: &str = "openid";

/// Key of the subject claim defined on [`start`](crate::migration::ClaimsSchemaManager::start).
pub const SUBJECT_CLAIM_KEY: &str = "sub";

const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_MIGRATION_TIMEOUT_MS: u64 = 100;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 25;

fn base_claim(scope: &str, key: &str, validation: &serde_json::Value) -> ClaimsSchemaPayload {
    ClaimsSchemaPayload {
        scope: scope.to_string(),
        key: key.to_string(),
        validation: validation.to_string(),
        ..ClaimsSchemaPayload::default()
    }
}

/// The standard profile claims defined on start unless configured otherwise.
static DEFAULT_BASE_CLAIMS: Lazy<Vec<ClaimsSchemaPayload>> = Lazy::new(|| {
    vec![
        base_claim(
            "profile",
            "name",
            &json!({"type": "string", "empty": false, "trim": true}),
        ),
        base_claim("profile", "picture", &json!({"type": "string", "optional": true})),
        base_claim("email", "email", &json!({"type": "email", "normalize": true})),
        base_claim(
            "email",
            "email_verified",
            &json!({"type": "boolean", "default": false}),
        ),
        base_claim("phone", "phone_number", &json!({"type": "phone", "country": "KR"})),
        base_claim(
            "phone",
            "phone_number_verified",
            &json!({"type": "boolean", "default": false}),
        ),
        base_claim(
            "gender",
            "gender",
            &json!({"type": "enum", "values": ["male", "female", "other"]}),
        ),
        ClaimsSchemaPayload {
            description: Some("YYYY-MM-DD".to_string()),
            ..base_claim(
                "birthdate",
                "birthdate",
                &json!({
                    "type": "string",
                    "pattern": r"^\d{4}\-(0?[1-9]|1[012])\-(0?[1-9]|[12][0-9]|3[01])$"
                }),
            )
        },
    ]
});

/// Configuration of a [`ClaimsSchemaManager`](crate::migration::ClaimsSchemaManager).
///
/// Zero page sizes and timeouts are not meaningful; [`normalized`](Self::normalized) replaces
/// them with the defaults.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ClaimsManagerConfig {
    /// Scopes every client is granted; `openid` is always added
    pub mandatory_scopes: Vec<String>,
    /// Claims defined by `start()` after the subject claim
    pub base_claims: Vec<ClaimsSchemaPayload>,
    /// Identities fetched and migrated concurrently per page
    pub page_size: u32,
    /// Wall-clock budget of one migration transform invocation
    pub migration_timeout_ms: u64,
    /// How long `define_schema` waits for the per-key lock
    pub lock_timeout_ms: u64,
    /// Initial delay between lock attempts; doubled per attempt up to a cap
    pub lock_retry_interval_ms: u64,
    /// Emit `on_claims_changed` for every identity even when a definition is a no-op
    pub notify_claims_on_noop: bool,
}

impl Default for ClaimsManagerConfig {
    fn default() -> Self {
        Self {
            mandatory_scopes: ["openid", "profile", "email"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            base_claims: DEFAULT_BASE_CLAIMS.clone(),
            page_size: DEFAULT_PAGE_SIZE,
            migration_timeout_ms: DEFAULT_MIGRATION_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            notify_claims_on_noop: false,
        }
    }
}

impl ClaimsManagerConfig {
    /// Replaces zero page sizes and timeouts with their defaults, logging each replacement.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.page_size == 0 {
            crate::warn!("config.invalid field=page_size value=0 default={DEFAULT_PAGE_SIZE}");
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        if self.migration_timeout_ms == 0 {
            crate::warn!(
                "config.invalid field=migration_timeout_ms value=0 default={DEFAULT_MIGRATION_TIMEOUT_MS}"
            );
            self.migration_timeout_ms = DEFAULT_MIGRATION_TIMEOUT_MS;
        }
        if self.lock_timeout_ms == 0 {
            crate::warn!(
                "config.invalid field=lock_timeout_ms value=0 default={DEFAULT_LOCK_TIMEOUT_MS}"
            );
            self.lock_timeout_ms = DEFAULT_LOCK_TIMEOUT_MS;
        }
        if self.lock_retry_interval_ms == 0 {
            crate::warn!(
                "config.invalid field=lock_retry_interval_ms value=0 default={DEFAULT_LOCK_RETRY_INTERVAL_MS}"
            );
            self.lock_retry_interval_ms = DEFAULT_LOCK_RETRY_INTERVAL_MS;
        }
        self
    }

    /// Configured scopes plus [`BASE_SCOPE`], deduplicated in first-seen order.
    #[must_use]
    pub fn resolved_mandatory_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::with_capacity(self.mandatory_scopes.len() + 1);
        for scope in self
            .mandatory_scopes
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(BASE_SCOPE))
        {
            if !scopes.iter().any(|seen| seen == scope) {
                scopes.push(scope.to_string());
            }
        }
        scopes
    }

    /// Per-invocation transform budget.
    #[must_use]
    pub const fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    /// Lock acquisition budget.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Initial lock retry delay.
    #[must_use]
    pub const fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

/// The subject claim every identity carries.
#[must_use]
pub fn subject_claim() -> ClaimsSchemaPayload {
    ClaimsSchemaPayload {
        description: Some("account id".to_string()),
        ..base_claim(BASE_SCOPE, SUBJECT_CLAIM_KEY, &json!("string"))
    }
}

/// The default configuration, for hosts that cannot call `Default::default`.
///
/// # Examples
///
/// ## Swift
///
/// ```swift
/// var config = defaultClaimsManagerConfig()
/// config.pageSize = 500
/// let manager = ClaimsSchemaManager(store: store, config: config, transforms: [])
/// ```
#[uniffi::export]
#[must_use]
pub fn default_claims_manager_config() -> ClaimsManagerConfig {
    ClaimsManagerConfig::default()
}

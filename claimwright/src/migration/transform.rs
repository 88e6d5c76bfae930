use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::schema::ClaimsSchema;
use crate::{ClaimsError, ValidationFailure};

/// Transform applied when a schema names none.
pub const DEFAULT_TRANSFORM: &str = "keep_or_seed";

/// Serialized arguments of one transform invocation.
///
/// Every field is a private JSON copy, so a transform can never observe or mutate state shared
/// with other invocations.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct TransformInput {
    /// Value stored under the parent schema version, `null` if none
    pub old_value: String,
    /// The schema's seed value
    pub seed_value: String,
    /// The identity's full claim bag
    pub claims: String,
}

/// Errors raised by claim transforms.
#[crate::claims_error]
pub enum TransformError {
    /// The transform refused to produce a value
    #[error("transform rejected the input: {0}")]
    Rejected(String),
    /// An unexpected error occurred in the foreign callback
    #[error("unexpected error in foreign callback: {0}")]
    UnexpectedUniFFICallbackError(String),
}

impl From<uniffi::UnexpectedUniFFICallbackError> for TransformError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::UnexpectedUniFFICallbackError(e.reason)
    }
}

/// A named migration transform, computing a claim's new value from its old one.
///
/// Transforms run on the blocking thread pool under a wall-clock budget that starts when the
/// invocation starts running. An invocation that overruns fails the whole migration and its
/// late result is discarded, but it cannot be interrupted: it keeps its blocking thread until
/// `migrate` returns. A transform that can hang pins up to one thread per identity of the page
/// being migrated, so it should bound its own work.
///
/// # Examples
///
/// ## Kotlin
///
/// ```kotlin
/// class LowercaseEmail : ClaimTransform {
///     override fun name() = "lowercase_email"
///     override fun migrate(input: TransformInput): String? {
///         val old = Json.parseToJsonElement(input.oldValue)
///         return if (old is JsonPrimitive && old.isString) {
///             JsonPrimitive(old.content.lowercase()).toString()
///         } else {
///             input.seedValue
///         }
///     }
/// }
/// ```
#[uniffi::export(with_foreign)]
pub trait ClaimTransform: Send + Sync {
    /// Name schemata use to reference this transform.
    fn name(&self) -> String;

    /// Computes the new value as JSON text; `None` stands for an absent value.
    ///
    /// # Errors
    /// - `TransformError` if no value can be computed; the migration is aborted
    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError>;
}

fn is_null(json_text: &str) -> bool {
    serde_json::from_str::<Value>(json_text).map_or(true, |value| value.is_null())
}

/// `old ?? seed`: keeps an existing value, seeds a missing one.
struct KeepOrSeed;

impl ClaimTransform for KeepOrSeed {
    fn name(&self) -> String {
        DEFAULT_TRANSFORM.to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        if is_null(&input.old_value) {
            Ok(Some(input.seed_value))
        } else {
            Ok(Some(input.old_value))
        }
    }
}

/// Carries the old value over unchanged.
struct Keep;

impl ClaimTransform for Keep {
    fn name(&self) -> String {
        "keep".to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        Ok(Some(input.old_value))
    }
}

/// Overwrites every value with the seed.
struct Seed;

impl ClaimTransform for Seed {
    fn name(&self) -> String {
        "seed".to_string()
    }

    fn migrate(&self, input: TransformInput) -> Result<Option<String>, TransformError> {
        Ok(Some(input.seed_value))
    }
}

/// Clears every value.
struct Null;

impl ClaimTransform for Null {
    fn name(&self) -> String {
        "null".to_string()
    }

    fn migrate(&self, _input: TransformInput) -> Result<Option<String>, TransformError> {
        Ok(None)
    }
}

/// Transforms by name: the built-ins plus whatever the host registers.
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn ClaimTransform>>,
}

impl TransformRegistry {
    /// A registry holding only the built-in transforms.
    #[must_use]
    pub fn with_builtins() -> Self {
        let builtins: [Arc<dyn ClaimTransform>; 4] =
            [Arc::new(KeepOrSeed), Arc::new(Keep), Arc::new(Seed), Arc::new(Null)];
        Self {
            transforms: builtins
                .into_iter()
                .map(|transform| (transform.name(), transform))
                .collect(),
        }
    }

    /// Registers `transform` under its name, replacing any transform of the same name.
    pub fn register(&mut self, transform: Arc<dyn ClaimTransform>) {
        let name = transform.name();
        if self.transforms.insert(name.clone(), transform).is_some() {
            crate::warn!("transform.replaced name={name}");
        }
    }

    /// Looks a transform up by name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ClaimTransform>> {
        self.transforms.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// Resolves schema migration references into time-boxed callables.
pub struct MigrationCompiler {
    registry: TransformRegistry,
    timeout: Duration,
}

impl MigrationCompiler {
    /// Creates a compiler whose migrations time out after `timeout` per invocation.
    #[must_use]
    pub const fn new(registry: TransformRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Resolves the migration of `schema` once for a whole submission.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` if the schema names an unregistered transform.
    pub fn compile(&self, schema: &ClaimsSchema) -> Result<CompiledMigration, ClaimsError> {
        let name = schema.migration.as_deref().unwrap_or(DEFAULT_TRANSFORM);
        let transform = self.registry.resolve(name).ok_or_else(|| {
            ClaimsError::validation(
                format!("migration of '{}' does not compile", schema.key),
                vec![ValidationFailure::new(
                    "migration",
                    "unknownTransform",
                    format!("no transform named '{name}' is registered"),
                )
                .expected(self.registry.names().join(", "))
                .actual(name)],
                serde_json::to_value(schema.to_payload()).unwrap_or_default(),
            )
        })?;

        Ok(CompiledMigration {
            name: name.to_string(),
            transform,
            timeout: self.timeout,
        })
    }
}

/// A resolved transform bound to its time budget.
pub struct CompiledMigration {
    name: String,
    transform: Arc<dyn ClaimTransform>,
    timeout: Duration,
}

impl CompiledMigration {
    /// Name of the resolved transform.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the transform on serialized copies of its arguments.
    ///
    /// An absent result normalizes to `null`.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` if the transform fails, panics, overruns its budget or
    ///   returns text that is not JSON.
    pub async fn migrate(
        &self,
        old: &Value,
        seed: &Value,
        claims: &Value,
    ) -> Result<Value, ClaimsError> {
        let input = TransformInput {
            old_value: old.to_string(),
            seed_value: seed.to_string(),
            claims: claims.to_string(),
        };
        let transform = Arc::clone(&self.transform);
        let (started_tx, started_rx) = oneshot::channel();
        let invocation = tokio::task::spawn_blocking(move || {
            let _ = started_tx.send(Instant::now());
            transform.migrate(input)
        });

        // The budget starts once a blocking thread picks the invocation up.
        let deadline = started_rx.await.unwrap_or_else(|_| Instant::now()) + self.timeout;
        let output = match tokio::time::timeout_at(deadline, invocation).await {
            Err(_) => {
                return Err(self.failure(
                    "migrationTimeout",
                    format!(
                        "transform '{}' exceeded {}ms",
                        self.name,
                        self.timeout.as_millis()
                    ),
                    old,
                ))
            }
            Ok(Err(join_error)) => {
                return Err(self.failure(
                    "migrationPanic",
                    format!("transform '{}' panicked: {join_error}", self.name),
                    old,
                ))
            }
            Ok(Ok(Err(e))) => {
                return Err(self.failure("migrationError", e.to_string(), old));
            }
            Ok(Ok(Ok(output))) => output,
        };

        output.map_or(Ok(Value::Null), |text| {
            serde_json::from_str(&text).map_err(|e| {
                self.failure(
                    "migrationOutput",
                    format!("transform '{}' returned invalid JSON: {e}", self.name),
                    old,
                )
            })
        })
    }

    fn failure(&self, kind: &str, message: String, old: &Value) -> ClaimsError {
        ClaimsError::validation(
            message.clone(),
            vec![ValidationFailure::new("migration", kind, message)],
            json!({ "transform": self.name, "oldClaim": old }),
        )
    }
}

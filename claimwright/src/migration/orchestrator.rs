use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use claimwright_macros::claims_export;
use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use serde_json::{json, Value};

use super::lock::LockCoordinator;
use super::state::{MigrationOutcome, MigrationPhase, MigrationReport, MigrationTracker, PageStats};
use super::transform::{ClaimTransform, CompiledMigration, MigrationCompiler, TransformRegistry};
use crate::primitives::config::{subject_claim, ClaimsManagerConfig};
use crate::schema::{ClaimsSchema, ClaimsSchemaPayload, SchemaCompiler};
use crate::store::{
    ClaimsStore, ClaimsTransaction, IdentityPageRequest, IdentityRef, SchemaFilter,
    VersionedClaim, VersionedClaimQuery,
};
use crate::validator::{ClaimsValidator, ValidatorFactory};
use crate::ClaimsError;

/// Reserved lock key serializing `force_reload` runs deployment-wide.
pub const FORCE_RELOAD_LOCK_KEY: &str = "claims:force-reload";

/// Everything one migration run shares read-only across its identity tasks.
struct MigrationRun<'a> {
    schema: &'a ClaimsSchema,
    validator: &'a ClaimsValidator,
    migration: &'a CompiledMigration,
    seed: &'a Value,
    transaction: &'a dyn ClaimsTransaction,
}

/// Manages claims schemata and migrates the identity population between their versions.
///
/// ## Consistency
///
/// Every mutating operation on a claim key runs under the store-backed lock for that key, and
/// every write of a run goes through one store transaction: a definition either becomes active
/// together with a value for every identity, or leaves no trace at all.
///
/// ## Examples
///
/// ### Swift
///
/// ```swift
/// let manager = ClaimsSchemaManager(
///     store: PostgresClaimsStore(pool: pool),
///     config: defaultClaimsManagerConfig(),
///     transforms: [LowercaseEmail()]
/// )
/// try await manager.start()
/// let schema = try await manager.defineSchema(payload: ClaimsSchemaPayload(
///     scope: "email",
///     key: "email",
///     description: nil,
///     validation: "{\"type\":\"email\"}",
///     migration: "lowercase_email",
///     seed: nil,
///     parentVersion: nil
/// ))
/// ```
#[derive(uniffi::Object)]
pub struct ClaimsSchemaManager {
    store: Arc<dyn ClaimsStore>,
    config: ClaimsManagerConfig,
    locks: LockCoordinator,
    migrations: MigrationCompiler,
    started: AtomicBool,
}

#[claims_export]
impl ClaimsSchemaManager {
    /// Creates a manager on top of the host's store.
    ///
    /// `transforms` are registered next to the built-ins (`keep_or_seed`, `keep`, `seed`,
    /// `null`); a transform named like a built-in replaces it.
    #[uniffi::constructor]
    pub fn new(
        store: Arc<dyn ClaimsStore>,
        config: ClaimsManagerConfig,
        transforms: Vec<Arc<dyn ClaimTransform>>,
    ) -> Arc<Self> {
        let config = config.normalized();

        let mut registry = TransformRegistry::with_builtins();
        for transform in transforms {
            registry.register(transform);
        }

        crate::info!(
            "manager.created page_size={} migration_timeout_ms={} lock_timeout_ms={} transforms={} timestamp={}",
            config.page_size,
            config.migration_timeout_ms,
            config.lock_timeout_ms,
            registry.names().join(","),
            Utc::now().to_rfc3339()
        );

        Arc::new(Self {
            locks: LockCoordinator::new(
                Arc::clone(&store),
                config.lock_timeout(),
                config.lock_retry_interval(),
            ),
            migrations: MigrationCompiler::new(registry, config.migration_timeout()),
            store,
            config,
            started: AtomicBool::new(false),
        })
    }

    /// Defines the subject claim and every configured base claim, concurrently.
    ///
    /// Safe to call on every boot: unchanged definitions are no-ops. A failing definition never
    /// cuts the others short; every definition runs to completion first.
    ///
    /// # Errors
    /// - the first failed definition, in configuration order
    pub async fn start(&self) -> Result<(), ClaimsError> {
        let payloads: Vec<ClaimsSchemaPayload> = std::iter::once(subject_claim())
            .chain(self.config.base_claims.iter().cloned())
            .collect();
        let count = payloads.len();

        join_all(payloads.into_iter().map(|payload| self.define(payload)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        self.started.store(true, Ordering::SeqCst);
        crate::info!(
            "manager.started claims={} timestamp={}",
            count,
            Utc::now().to_rfc3339()
        );
        Ok(())
    }

    /// Marks the manager stopped. No operation requires a started manager.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        crate::info!("manager.stopped timestamp={}", Utc::now().to_rfc3339());
    }

    /// Whether [`start`](Self::start) completed and [`stop`](Self::stop) was not called since.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Defines (or redefines) the schema of one claim key and migrates every identity to it.
    ///
    /// # Errors
    /// - `ClaimsError::Validation` for malformed payloads, unknown transforms, unknown parent
    ///   versions and identities whose migrated value fails validation
    /// - `ClaimsError::LockContention` if the key stays locked past the lock timeout
    /// - `ClaimsError::Adapter` for any store failure
    pub async fn define_schema(
        &self,
        payload: ClaimsSchemaPayload,
    ) -> Result<ClaimsSchema, ClaimsError> {
        Ok(self.define(payload).await?.schema)
    }

    /// Like [`define_schema`](Self::define_schema), reporting what was done.
    ///
    /// # Errors
    /// - see [`define_schema`](Self::define_schema)
    pub async fn define_schema_with_report(
        &self,
        payload: ClaimsSchemaPayload,
    ) -> Result<MigrationReport, ClaimsError> {
        self.define(payload).await
    }

    /// Every active schema.
    ///
    /// # Errors
    /// - `ClaimsError::Adapter` if the store fails
    pub async fn get_active_schemata(&self) -> Result<Vec<ClaimsSchema>, ClaimsError> {
        Ok(self.store.get_schemata(SchemaFilter::all_active()).await?)
    }

    /// The configured mandatory scopes plus `openid`, without duplicates.
    #[must_use]
    pub fn mandatory_scopes(&self) -> Vec<String> {
        self.config.resolved_mandatory_scopes()
    }

    /// Re-emits `on_claims_changed` for every identity matching `filter`, after an
    /// `on_schema_changed`. Returns the number of identities notified.
    ///
    /// # Errors
    /// - `ClaimsError::LockContention` if another reload holds the reload lock too long
    /// - `ClaimsError::Adapter` for any store failure
    pub async fn force_reload(&self, filter: Option<String>) -> Result<u64, ClaimsError> {
        let stats = self
            .locks
            .with_lock(FORCE_RELOAD_LOCK_KEY, || {
                self.in_transaction(|_transaction| async move {
                    self.store.on_schema_changed().await?;
                    self.notify_all(filter).await
                })
            })
            .await?;

        crate::info!(
            "claims.reloaded identities={} pages={} timestamp={}",
            stats.identities,
            stats.pages,
            Utc::now().to_rfc3339()
        );
        Ok(stats.identities)
    }

    /// Releases the lock on `key` whoever holds it.
    ///
    /// # Errors
    /// - `ClaimsError::Adapter` if the store fails
    pub async fn force_release_lock(&self, key: String) -> Result<(), ClaimsError> {
        self.locks.force_release(&key).await
    }

    /// Deletes every schema row of each key, one key at a time, each under its lock and in its
    /// own transaction. Stored claim values are left untouched.
    ///
    /// # Errors
    /// - the first failure; keys before it stay deleted
    pub async fn force_delete_schemata(&self, keys: Vec<String>) -> Result<(), ClaimsError> {
        for key in keys {
            self.locks
                .with_lock(&key, || {
                    self.in_transaction(|transaction| {
                        let key = key.clone();
                        async move {
                            transaction.force_delete_schema(key).await?;
                            self.store.on_schema_changed().await?;
                            Ok::<(), ClaimsError>(())
                        }
                    })
                })
                .await?;

            crate::warn!(
                "schema.force_deleted key={} timestamp={}",
                key,
                Utc::now().to_rfc3339()
            );
        }
        Ok(())
    }
}

impl ClaimsSchemaManager {
    /// The effective configuration, zero values already replaced by defaults.
    #[must_use]
    pub const fn config(&self) -> &ClaimsManagerConfig {
        &self.config
    }

    /// Compiles everything up front, then runs the state machine under the key's lock.
    async fn define(&self, payload: ClaimsSchemaPayload) -> Result<MigrationReport, ClaimsError> {
        let schema = SchemaCompiler::compile(&payload)?;
        let validator = ValidatorFactory::compile(&schema)?;
        let migration = self.migrations.compile(&schema)?;
        let seed: Value = serde_json::from_str(&schema.seed)?;

        let mut tracker = MigrationTracker::new(&schema);
        let key = schema.key.clone();
        let result = self
            .locks
            .with_lock(&key, || {
                self.define_locked(&mut tracker, schema, &validator, &migration, &seed)
            })
            .await;
        tracker.unlock();

        let (schema, outcome, stats) = result.inspect_err(|e| {
            crate::error!(
                "schema.define_failed key={} error={} duration_ms={} timestamp={}",
                key,
                e,
                tracker.elapsed_ms(),
                Utc::now().to_rfc3339()
            );
        })?;

        let report = MigrationReport {
            schema,
            outcome,
            pages: stats.pages,
            identities: stats.identities,
            claims_changed: stats.changed,
            duration_ms: tracker.elapsed_ms(),
        };
        crate::info!(
            "schema.defined key={} version={} outcome={} pages={} identities={} claims_changed={} duration_ms={} timestamp={}",
            report.schema.key,
            report.schema.version_transition(),
            report.outcome.as_str(),
            report.pages,
            report.identities,
            report.claims_changed,
            report.duration_ms,
            Utc::now().to_rfc3339()
        );
        Ok(report)
    }

    async fn define_locked(
        &self,
        tracker: &mut MigrationTracker,
        schema: ClaimsSchema,
        validator: &ClaimsValidator,
        migration: &CompiledMigration,
        seed: &Value,
    ) -> Result<(ClaimsSchema, MigrationOutcome, PageStats), ClaimsError> {
        tracker.advance(MigrationPhase::Locked)?;

        let existing = self
            .store
            .get_schema(SchemaFilter::version(&schema.key, &schema.version))
            .await?;

        if let Some(existing) = existing {
            if existing.active {
                tracker.advance(MigrationPhase::SkipNoop)?;
                let stats = self.skip(&existing).await?;
                return Ok((existing, MigrationOutcome::Skipped, stats));
            }

            tracker.advance(MigrationPhase::Reactivate)?;
            let result = self.reactivate(&existing).await;
            let stats = tracker.settle(result)?;
            return Ok((
                ClaimsSchema {
                    active: true,
                    ..existing
                },
                MigrationOutcome::Reactivated,
                stats,
            ));
        }

        let schema = self.resolve_parent(schema).await?;

        tracker.advance(MigrationPhase::Migrate)?;
        let result = self.migrate(&schema, validator, migration, seed).await;
        let stats = tracker.settle(result)?;
        Ok((
            ClaimsSchema {
                active: true,
                ..schema
            },
            MigrationOutcome::Migrated,
            stats,
        ))
    }

    /// The definition is already active: only notify.
    async fn skip(&self, existing: &ClaimsSchema) -> Result<PageStats, ClaimsError> {
        crate::info!(
            "schema.unchanged key={} version={} timestamp={}",
            existing.key,
            existing.short_version(),
            Utc::now().to_rfc3339()
        );
        self.store.on_schema_changed().await?;

        if self.config.notify_claims_on_noop {
            self.notify_all(None).await
        } else {
            Ok(PageStats::default())
        }
    }

    /// Makes a previously defined version active again and tells every identity.
    async fn reactivate(&self, existing: &ClaimsSchema) -> Result<PageStats, ClaimsError> {
        crate::info!(
            "schema.reactivating key={} version={} timestamp={}",
            existing.key,
            existing.short_version(),
            Utc::now().to_rfc3339()
        );

        self.in_transaction(|transaction| async move {
            transaction
                .set_active_schema(existing.key.clone(), existing.version.clone())
                .await?;
            self.store.on_schema_changed().await?;
            self.notify_all(None).await
        })
        .await
    }

    /// Validates an explicit parent or adopts the active schema as parent.
    async fn resolve_parent(&self, mut schema: ClaimsSchema) -> Result<ClaimsSchema, ClaimsError> {
        if let Some(parent_version) = schema.parent_version.clone() {
            let parent = self
                .store
                .get_schema(SchemaFilter::version(&schema.key, &parent_version))
                .await?;
            if parent.is_none() {
                return Err(ClaimsError::validation(
                    format!(
                        "parent version {} of '{}' does not exist",
                        crate::schema::short_version(&parent_version),
                        schema.key
                    ),
                    vec![crate::ValidationFailure::new(
                        "parent_version",
                        "unknownParent",
                        "parent_version must reference an existing schema of the same key",
                    )
                    .actual(parent_version)],
                    serde_json::to_value(&schema)?,
                ));
            }
            return Ok(schema);
        }

        schema.parent_version = self
            .store
            .get_schema(SchemaFilter::active(&schema.key))
            .await?
            .map(|active| active.version);
        Ok(schema)
    }

    /// Creates and activates `schema`, then migrates every identity to it.
    async fn migrate(
        &self,
        schema: &ClaimsSchema,
        validator: &ClaimsValidator,
        migration: &CompiledMigration,
        seed: &Value,
    ) -> Result<PageStats, ClaimsError> {
        crate::info!(
            "schema.migrating key={} version={} transform={} page_size={} timestamp={}",
            schema.key,
            schema.version_transition(),
            migration.name(),
            self.config.page_size,
            Utc::now().to_rfc3339()
        );

        self.in_transaction(|transaction| async move {
            transaction.create_schema(schema.clone()).await?;
            transaction
                .set_active_schema(schema.key.clone(), schema.version.clone())
                .await?;
            self.store.on_schema_changed().await?;

            let run = MigrationRun {
                schema,
                validator,
                migration,
                seed,
                transaction: transaction.as_ref(),
            };
            self.for_each_page(None, |identity, index| {
                self.migrate_identity(&run, identity, index)
            })
            .await
        })
        .await
    }

    /// Migrates one identity. Returns whether its claim value changed.
    async fn migrate_identity(
        &self,
        run: &MigrationRun<'_>,
        identity: IdentityRef,
        index: u64,
    ) -> Result<bool, ClaimsError> {
        let claims = self.store.get_identity_claims(identity.id.clone()).await?;
        let claims: Value = ClaimsError::from_anyhow_result(
            serde_json::from_str(&claims)
                .with_context(|| format!("claims of identity {} are not valid JSON", identity.id)),
        )?;
        let old = self.previous_value(run.schema, &identity).await?;

        let new = match run.migration.migrate(&old, run.seed, &claims).await {
            Ok(new) => new,
            Err(e) => {
                return Err(identity_failure(
                    run.schema,
                    &identity,
                    index,
                    &old,
                    &Value::Null,
                    e,
                ))
            }
        };
        if let Err(e) = run.validator.validate(&new) {
            return Err(identity_failure(
                run.schema, &identity, index, &old, &new, e,
            ));
        }

        run.transaction
            .put_versioned_claims(
                identity.id.clone(),
                vec![VersionedClaim {
                    key: run.schema.key.clone(),
                    value: new.to_string(),
                    schema_version: run.schema.version.clone(),
                }],
            )
            .await?;

        let changed = new != old;
        if changed {
            self.store.on_claims_changed(identity.id).await?;
        }
        Ok(changed)
    }

    /// The identity's value under the parent version, `null` if there is none.
    async fn previous_value(
        &self,
        schema: &ClaimsSchema,
        identity: &IdentityRef,
    ) -> Result<Value, ClaimsError> {
        let Some(parent_version) = schema.parent_version.as_deref() else {
            return Ok(Value::Null);
        };

        let stored = self
            .store
            .get_versioned_claims(
                identity.id.clone(),
                vec![VersionedClaimQuery {
                    key: schema.key.clone(),
                    schema_version: parent_version.to_string(),
                }],
            )
            .await?;

        stored
            .into_iter()
            .find(|claim| claim.key == schema.key && claim.schema_version == parent_version)
            .map_or(Ok(Value::Null), |claim| {
                ClaimsError::from_anyhow_result(serde_json::from_str(&claim.value).with_context(
                    || {
                        format!(
                            "stored '{}' of identity {} is not valid JSON",
                            schema.key, identity.id
                        )
                    },
                ))
            })
    }

    /// Notification pass: `on_claims_changed` for every identity matching `filter`.
    async fn notify_all(&self, filter: Option<String>) -> Result<PageStats, ClaimsError> {
        self.for_each_page(filter, |identity, _index| async move {
            self.store.on_claims_changed(identity.id).await?;
            Ok::<bool, ClaimsError>(true)
        })
        .await
    }

    /// Visits the population page by page until the store returns an empty page. `visit` gets
    /// each identity with its index in the whole pass.
    ///
    /// Pages run strictly one after another; identities within a page run concurrently and
    /// the first failure aborts the pass.
    async fn for_each_page<F, Fut>(
        &self,
        filter: Option<String>,
        visit: F,
    ) -> Result<PageStats, ClaimsError>
    where
        F: Fn(IdentityRef, u64) -> Fut,
        Fut: Future<Output = Result<bool, ClaimsError>>,
    {
        let limit = u64::from(self.config.page_size);
        let mut stats = PageStats::default();
        let mut offset = 0_u64;

        loop {
            let page = self
                .store
                .get_identity_page(IdentityPageRequest {
                    filter: filter.clone(),
                    offset,
                    limit,
                })
                .await?;
            if page.is_empty() {
                break;
            }

            let size = u64::try_from(page.len()).unwrap_or(u64::MAX);
            let changed = try_join_all(
                (offset..)
                    .zip(page)
                    .map(|(index, identity)| visit(identity, index)),
            )
            .await?
                .into_iter()
                .filter(|changed| *changed)
                .count();

            stats.pages += 1;
            stats.identities += size;
            stats.changed += u64::try_from(changed).unwrap_or(u64::MAX);
            crate::debug!(
                "page.processed offset={} size={} changed={} timestamp={}",
                offset,
                size,
                changed,
                Utc::now().to_rfc3339()
            );

            offset += size;
        }

        Ok(stats)
    }

    /// Runs `body` in a fresh transaction: commit on success, rollback on error or panic.
    ///
    /// If the returned future is dropped before the transaction settles, the rollback runs on
    /// a spawned task.
    async fn in_transaction<T, F, Fut>(&self, body: F) -> Result<T, ClaimsError>
    where
        F: FnOnce(Arc<dyn ClaimsTransaction>) -> Fut,
        Fut: Future<Output = Result<T, ClaimsError>>,
    {
        let transaction = self.store.begin_transaction()?;
        let mut open = OpenTransaction {
            transaction: Arc::clone(&transaction),
            settled: false,
        };

        let outcome = AssertUnwindSafe(body(Arc::clone(&transaction)))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => match transaction.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback(transaction.as_ref(), "commit_failed").await;
                    Err(e.into())
                }
            },
            Ok(Err(e)) => {
                rollback(transaction.as_ref(), "error").await;
                Err(e)
            }
            Err(panic) => {
                rollback(transaction.as_ref(), "panic").await;
                open.settled = true;
                std::panic::resume_unwind(panic)
            }
        };
        open.settled = true;
        result
    }
}

/// A transaction that has not been committed or rolled back yet.
struct OpenTransaction {
    transaction: Arc<dyn ClaimsTransaction>,
    settled: bool,
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            crate::error!(
                "transaction.abandoned reason=no_runtime timestamp={}",
                Utc::now().to_rfc3339()
            );
            return;
        };
        let transaction = Arc::clone(&self.transaction);
        runtime.spawn(async move { rollback(transaction.as_ref(), "dropped").await });
    }
}

/// Rolls back, logging (never raising) a failed rollback so the original failure wins.
async fn rollback(transaction: &dyn ClaimsTransaction, reason: &str) {
    match transaction.rollback().await {
        Ok(()) => crate::warn!(
            "transaction.rolled_back reason={} timestamp={}",
            reason,
            Utc::now().to_rfc3339()
        ),
        Err(e) => crate::error!(
            "transaction.rollback_failed reason={} error={} timestamp={}",
            reason,
            e,
            Utc::now().to_rfc3339()
        ),
    }
}

/// Logs a failed identity and wraps the failure with the identity's details.
///
/// Store failures keep their variant; everything else becomes a `Validation` error whose
/// context names the identity, both values and its index in the pass.
fn identity_failure(
    schema: &ClaimsSchema,
    identity: &IdentityRef,
    index: u64,
    old: &Value,
    new: &Value,
    error: ClaimsError,
) -> ClaimsError {
    crate::error!(
        "migration.identity_failed key={} version={} id={} index={} old={} new={} error={} timestamp={}",
        schema.key,
        schema.short_version(),
        identity.id,
        index,
        old,
        new,
        error,
        Utc::now().to_rfc3339()
    );

    let failures = error.failures().to_vec();
    if matches!(error, ClaimsError::Adapter(_)) {
        return error;
    }

    ClaimsError::validation(
        format!(
            "failed to migrate '{}' of identity {}: {error}",
            schema.key, identity.id
        ),
        failures,
        json!({
            "id": identity.id,
            "oldClaim": old,
            "newClaim": new,
            "error": error.to_string(),
            "index": index,
        }),
    )
}

//! Claims schema migrations
//!
//! Redefining a claim migrates every identity's value of that claim to the new definition,
//! all or nothing.
//!
//! # Overview
//!
//! - [`ClaimsSchemaManager`]: the entry point, deciding per definition whether to reactivate
//!   an old version, skip an unchanged one or migrate the population to a new one
//! - [`MigrationCompiler`]: resolves a schema's named [`ClaimTransform`] into a time-boxed
//!   callable
//! - [`LockCoordinator`]: store-backed per-key locking with guaranteed release
//! - [`MigrationTracker`]: the phase state machine of one run
//!
//! # Usage
//!
//! ## Platform Usage (Kotlin)
//!
//! ```kotlin
//! // 1. Implement the store on top of your database
//! val store = PostgresClaimsStore(dataSource)
//!
//! // 2. Create the manager, registering custom transforms
//! val manager = ClaimsSchemaManager(store, defaultClaimsManagerConfig(), listOf(LowercaseEmail()))
//!
//! // 3. Define the built-in claims, then your own
//! manager.start()
//! val report = manager.defineSchemaWithReport(
//!     ClaimsSchemaPayload(
//!         scope = "email",
//!         key = "email",
//!         description = null,
//!         validation = """{"type":"email"}""",
//!         migration = "lowercase_email",
//!         seed = null,
//!         parentVersion = null,
//!     )
//! )
//! ```
//!
//! ## Writing transforms
//!
//! A transform receives JSON copies of the old value, the schema's seed and the identity's
//! claim bag, and returns the new value as JSON (or nothing, for `null`). It must finish within
//! `migration_timeout_ms`; any error, panic or overrun aborts the whole migration and rolls it
//! back.

mod lock;
mod orchestrator;
mod state;
mod transform;

pub use lock::LockCoordinator;
pub use orchestrator::{ClaimsSchemaManager, FORCE_RELOAD_LOCK_KEY};
pub use state::{MigrationOutcome, MigrationPhase, MigrationReport, MigrationTracker, PageStats};
pub use transform::{
    ClaimTransform, CompiledMigration, MigrationCompiler, TransformError, TransformInput,
    TransformRegistry, DEFAULT_TRANSFORM,
};

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    dead_code
)]

//! `claimwright` manages versioned identity claims schemata and migrates the whole identity
//! population whenever the definition of a claim changes.
//!
//! Storage, locking and transactions are provided by the host through the
//! [`store::ClaimsStore`] adapter; this crate owns the consistency rules: content-hashed
//! schema versions, compiled validation, time-boxed migration transforms and the
//! all-or-nothing migration state machine in [`migration::ClaimsSchemaManager`].

/// Error handling utilities shared by every error enum in the crate.
pub mod claims_error;

mod error;
pub use error::{ClaimsError, ValidationFailure};

/// Introduces low level primitives: logging bridge and manager configuration.
pub mod primitives;

/// Claims schema records and the compiler turning definition payloads into versioned schemata.
pub mod schema;

/// Compiles claim validation rules into reusable predicates.
pub mod validator;

/// The store adapter contract implemented by the host.
pub mod store;

/// Migration transforms, per-key locking and the migration state machine.
pub mod migration;

/// In-memory collaborators for tests.
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use claims_error::claims_error;

uniffi::setup_scaffolding!("claimwright");

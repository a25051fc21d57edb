//! Ordered, exactly-once migrations for transactional stores.
//!
//! A [`MigrationRunner`] applies a list of [`Migration`]s in order. Each
//! migration may carry a structural change, applied through
//! [`Store::alter`], and a data transform, run in its own read-write
//! transaction. Progress is a single [`Revision`] record kept inside the
//! migrated store, so a failed run resumes where it stopped.

pub mod commands;
pub mod core;
pub mod db;
pub mod models;
pub mod providers;
pub mod utils;

pub use crate::core::config::RunnerConfig;
pub use crate::core::runner::{MigrationRunner, MigrationStatus};
pub use crate::db::revision_store::RevisionStore;
pub use crate::models::{Migration, Revision, TransformFn, DEFAULT_REVISION_ID};
pub use crate::providers::{SchemaOperation, SqliteStore, Store, Transaction};
pub use crate::utils::error::{MigrationError, Result, StoreError};

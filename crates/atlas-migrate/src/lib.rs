//! # atlas-migrate
//!
//! One-shot migration of a legacy launcher snapshot into a PostgreSQL
//! destination.
//!
//! The snapshot is a set of JSON exports (clients, users, profiles,
//! social links, friendships, an analytics counter) whose records are
//! inconsistently shaped and only loosely related. This library turns
//! them into rows a constraint-enforcing schema will accept:
//!
//! - **Schema probing** — statements adapt to the tables and columns
//!   the destination actually has
//! - **Identity reconciliation** — id-less users get deterministic ids,
//!   username/email collisions get placeholder values
//! - **Referential integrity** — parents demanded by foreign keys are
//!   synthesized, snapshot-local keys are re-resolved to destination keys
//! - **Idempotent writes** — batched insert-or-update statements keyed
//!   on natural identity, safe to re-run
//! - **Single transaction** — the whole migration commits or none of it
//!   does
//!
//! ## Example
//!
//! ```rust,no_run
//! use atlas_migrate::{DbConfig, EntitySelection, MigrateOptions, Migrator, SnapshotPaths};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> atlas_migrate::Result<()> {
//!     let config = DbConfig::from_env()?;
//!     let migrator = Migrator::new(
//!         config,
//!         SnapshotPaths::default(),
//!         EntitySelection::all(),
//!         MigrateOptions::default(),
//!     );
//!     let report = migrator.run().await?;
//!     println!("Migrated {} users", report.users_written);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod contract;
pub mod error;
pub mod linker;
pub mod migrator;
pub mod reconcile;
pub mod schema;
pub mod snapshot;

// Re-exports for convenient access
pub use config::{DbConfig, EntitySelection, MigrateOptions, SnapshotPaths};
pub use contract::{SqlValue, UpsertPlan};
pub use error::{MigrateError, Result};
pub use migrator::{MigrationReport, Migrator};
pub use snapshot::Snapshot;

//! # Agent Control Plane - Task Store
//!
//! Storage layer of the agent/task control plane: task state and task
//! messages, and the router that moves them from the legacy document store
//! to the relational store without downtime.
//!
//! The [`MigrationRouter`] is the only thing request handlers talk to. An
//! operator-selected [`MigrationPhase`] decides which store(s) each call
//! reads and writes; `dual_read` compares both stores and reports
//! discrepancies as metrics while callers keep getting legacy answers.

pub mod config;
pub mod entities;
pub mod migration;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod telemetry;

pub use config::StoreMigrationConfig;
pub use entities::{TaskMessage, TaskState, TaskStateKey};
pub use migration::{MigrationError, MigrationPhase, MigrationRouter};
pub use store::{Entity, EntityStore, ListQuery, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Storage migration routing.
//!
//! Moves task state and task messages from the legacy document store to the
//! relational store without downtime. The operator picks a [`MigrationPhase`];
//! the [`MigrationRouter`] sends every create/get/update/delete/list to the
//! store(s) that phase calls for, mirrors writes best-effort, and in
//! `dual_read` compares what both stores return.
//!
//! # Modules
//!
//! - [`phase`] — phases and the phase resolver
//! - [`writer`] — write coordinator (legacy first, target best effort)
//! - [`reader`] — read router (concurrent dual reads)
//! - [`comparator`] — consistency comparator
//! - [`metrics`] — metrics emitter and sinks
//! - [`router`] — the facade callers use

pub mod comparator;
pub mod error;
pub mod metrics;
pub mod phase;
pub mod reader;
pub mod router;
pub mod writer;

pub use comparator::{ConsistencyComparator, DiscrepancyCategory};
pub use error::MigrationError;
pub use metrics::{InMemoryMetrics, MetricsEmitter, MetricsSink, NoopMetrics, OtelMetricsSink};
pub use phase::{resolve, MigrationPhase, PhaseResolver};
pub use router::{MigrationRouter, MigrationRouterBuilder};
pub use writer::{SecondaryPolicy, SecondaryWriteMode};

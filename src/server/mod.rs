//! HTTP server for the task store.
//!
//! Exposes task states and task messages through the migration router so
//! callers and verification tooling reach both stores via one boundary.
//!
//! # Endpoints
//!
//! - `GET  /health`       — liveness probe
//! - `GET  /store/phase`  — configured and effective migration phase
//! - `GET  /metrics`      — collected migration counters and gauges
//! - `/task-states/...`   — task state CRUD, list, batch, by-key
//! - `/task-messages/...` — task message CRUD, list, batch

pub mod routes;

pub use routes::{app_router, ApiError, AppState, PhaseOverride, PHASE_HEADER, PHASE_QUERY};

//! Task store HTTP server binary.
//!
//! Serves task states and task messages through the migration router:
//! SQLite documents on the legacy side, PostgreSQL on the target side.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `TASK_STORE_PHASE` — `legacy` (default), `dual_write`, `dual_read` or `target`
//! - `TASK_STORE_LEGACY_PATH` — SQLite file of the legacy store (default: `data/task_store.db`)
//! - `DATABASE_URL` — PostgreSQL connection string of the target store
//! - `TASK_STORE_SECONDARY_TIMEOUT_MS` — timeout on every target leg while dual-running
//! - `TASK_STORE_SECONDARY_WRITES` — `await` (default) or `detached`
//! - `TASK_STORE_LIST_COMPARE` — compare list counts in `dual_read` (default: true)
//! - `RUST_LOG` — Tracing filter (default: "info,agent_control_plane=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! # or with postgres:
//! DATABASE_URL=postgres://... cargo run --bin server --features postgres
//! ```

use std::sync::Arc;

use anyhow::Context;

use agent_control_plane::config::StoreMigrationConfig;
use agent_control_plane::entities::{TaskMessage, TaskState};
use agent_control_plane::migration::MigrationRouter;
use agent_control_plane::server::{app_router, AppState};
use agent_control_plane::store::{MemoryStore, SharedStore, SqliteDocumentStore};
use agent_control_plane::telemetry::Telemetry;

type TargetStores = (SharedStore<TaskState>, SharedStore<TaskMessage>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_control_plane=debug".into()),
        )
        .init();

    let config = StoreMigrationConfig::from_env().context("invalid store configuration")?;
    let telemetry = Arc::new(Telemetry::init());
    let sink = telemetry.metrics_sink();

    let legacy_states = SqliteDocumentStore::<TaskState>::open(&config.legacy_path)
        .with_context(|| format!("cannot open legacy store at {}", config.legacy_path))?;
    let legacy_messages = legacy_states.sibling::<TaskMessage>();
    let (target_states, target_messages) = target_stores(&config).await?;

    let state = AppState::new(
        MigrationRouter::from_config(&config, Arc::new(legacy_states), target_states, sink.clone())?,
        MigrationRouter::from_config(&config, Arc::new(legacy_messages), target_messages, sink)?,
    )
    .with_telemetry(telemetry.clone());

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    tracing::info!(
        phase = %state.task_states.phase(),
        legacy = %config.legacy_path,
        "agent-control-plane server starting on {}",
        bind_addr
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server failed")?;

    telemetry.shutdown();
    Ok(())
}

#[cfg(feature = "postgres")]
async fn target_stores(config: &StoreMigrationConfig) -> anyhow::Result<TargetStores> {
    use agent_control_plane::store::pg::PgEntityStore;

    let Some(database_url) = config.target_database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; target store is in-memory");
        return Ok(memory_targets());
    };

    tracing::info!("Connecting to PostgreSQL...");
    let pool = sqlx::PgPool::connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let states = PgEntityStore::<TaskState>::new(pool.clone());
    let messages = PgEntityStore::<TaskMessage>::new(pool);
    states.ensure_table().await?;
    messages.ensure_table().await?;
    tracing::info!("PostgreSQL tables ready");

    Ok((Arc::new(states), Arc::new(messages)))
}

#[cfg(not(feature = "postgres"))]
async fn target_stores(config: &StoreMigrationConfig) -> anyhow::Result<TargetStores> {
    if config.target_database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored: built without the `postgres` feature");
    }
    tracing::warn!("target store is in-memory");
    Ok(memory_targets())
}

fn memory_targets() -> TargetStores {
    (
        Arc::new(MemoryStore::<TaskState>::new("target-memory")),
        Arc::new(MemoryStore::<TaskMessage>::new("target-memory")),
    )
}

//! Operator CLI for the task store migration.
//!
//! Copies legacy records into the target store ahead of `dual_write`
//! (`backfill`) and audits the target before cutover (`verify`). Reports
//! are printed as JSON; the exit status is 1 when anything is left
//! unresolved.
//!
//! ```bash
//! store-migrate --legacy-path data/task_store.db --database-url postgres://... \
//!     backfill task-states --page-size 500
//! store-migrate verify task-messages --sample 1000 --repair
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};

use agent_control_plane::entities::{TaskMessage, TaskState};
use agent_control_plane::reconcile::{self, BackfillOptions, VerifyOptions};
use agent_control_plane::store::{Entity, SharedStore, SqliteDocumentStore};

#[derive(Parser)]
#[command(name = "store-migrate")]
#[command(about = "Backfill and verify the task store migration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite file of the legacy document store
    #[arg(long, global = true, env = "TASK_STORE_LEGACY_PATH", default_value = "data/task_store.db")]
    legacy_path: PathBuf,

    /// PostgreSQL URL of the target store
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Use a SQLite file as the target instead of PostgreSQL
    #[arg(long, global = true, conflicts_with = "database_url")]
    target_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy legacy records missing from the target
    Backfill {
        entity: EntityKind,

        #[command(flatten)]
        paging: Paging,

        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<usize>,

        /// Report what would be copied without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare target records with legacy
    Verify {
        entity: EntityKind,

        #[command(flatten)]
        paging: Paging,

        /// Check only the first N legacy records
        #[arg(long)]
        sample: Option<usize>,

        /// Create or overwrite target records that differ from legacy
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Args)]
struct Paging {
    /// Legacy records fetched per page
    #[arg(long, default_value_t = reconcile::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Records processed at once
    #[arg(long, default_value_t = reconcile::DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum EntityKind {
    TaskStates,
    TaskMessages,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_control_plane=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let entity = match &cli.command {
        Commands::Backfill { entity, .. } | Commands::Verify { entity, .. } => *entity,
    };
    let result = match entity {
        EntityKind::TaskStates => run::<TaskState>(&cli).await,
        EntityKind::TaskMessages => run::<TaskMessage>(&cli).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

/// Run the command for one entity kind. `Ok(false)` means the run finished
/// but left records unresolved.
async fn run<E: Entity>(cli: &Cli) -> anyhow::Result<bool> {
    let legacy: SharedStore<E> = Arc::new(
        SqliteDocumentStore::<E>::open(&cli.legacy_path)
            .with_context(|| format!("cannot open legacy store {}", cli.legacy_path.display()))?,
    );
    let target = open_target::<E>(cli).await?;

    match &cli.command {
        Commands::Backfill {
            paging,
            max_pages,
            dry_run,
            ..
        } => {
            let options = BackfillOptions {
                page_size: paging.page_size,
                max_pages: *max_pages,
                concurrency: paging.concurrency,
                dry_run: *dry_run,
            };
            let report = reconcile::backfill(legacy.as_ref(), target.as_ref(), &options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.failed == 0)
        }
        Commands::Verify {
            paging,
            sample,
            repair,
            ..
        } => {
            let options = VerifyOptions {
                sample: *sample,
                page_size: paging.page_size,
                concurrency: paging.concurrency,
                repair: *repair,
            };
            let report = reconcile::verify(legacy.as_ref(), target.as_ref(), &options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                tracing::warn!("{} {} records unresolved", report.unresolved(), E::KIND);
            }
            Ok(report.is_clean())
        }
    }
}

async fn open_target<E: Entity>(cli: &Cli) -> anyhow::Result<SharedStore<E>> {
    if let Some(path) = &cli.target_path {
        let store = SqliteDocumentStore::<E>::open(path)
            .with_context(|| format!("cannot open target store {}", path.display()))?;
        return Ok(Arc::new(store));
    }
    match cli.database_url.as_deref() {
        Some(url) => open_postgres::<E>(url).await,
        None => bail!("no target store: pass --database-url or --target-path"),
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres<E: Entity>(url: &str) -> anyhow::Result<SharedStore<E>> {
    use agent_control_plane::store::pg::PgEntityStore;

    let pool = sqlx::PgPool::connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = PgEntityStore::<E>::new(pool);
    store.ensure_table().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres<E: Entity>(_url: &str) -> anyhow::Result<SharedStore<E>> {
    bail!("built without the `postgres` feature; use --target-path")
}

//! Source-to-analytics popularity sync: the per-cycle pipeline and the
//! scheduler that repeats it.

use std::sync::Arc;

use anyhow::{Context, Result};
use popmetrics_storage::{AnalyticsStore, PgAnalyticsStore, SqliteSourceStore, StoreError};
use thiserror::Error;

mod clock;
mod config;
mod cycle;
mod extract;
mod group;
mod persist;
mod reconcile;
mod scheduler;
mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use cycle::{invalidate_after, sync_task, CycleSummary, SyncCycle, DEFAULT_TASK_NAME};
pub use extract::{Extraction, Extractor};
pub use group::{group_records, Group};
pub use persist::{PersistOutcome, Persister};
pub use reconcile::{Reconciler, WriteSet};
pub use scheduler::{CycleFn, CycleFuture, Scheduler, TaskContext, TaskState};
pub use view::ViewRefresher;

pub const CRATE_NAME: &str = "popmetrics-sync";

/// A cycle that stopped before committing anything.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("extract phase failed: {0}")]
    Extract(#[source] StoreError),
    #[error("reconcile phase failed: {0}")]
    Reconcile(#[source] StoreError),
    #[error("persist phase failed: {0}")]
    Persist(#[source] StoreError),
}

impl CycleError {
    pub fn phase(&self) -> &'static str {
        match self {
            CycleError::Extract(_) => "extract",
            CycleError::Reconcile(_) => "reconcile",
            CycleError::Persist(_) => "persist",
        }
    }

    pub fn store_error(&self) -> &StoreError {
        match self {
            CycleError::Extract(err) | CycleError::Reconcile(err) | CycleError::Persist(err) => err,
        }
    }
}

/// Open both stores described by `config` and build a cycle over them.
pub async fn connect_cycle(
    config: &SyncConfig,
    clock: Arc<dyn Clock>,
) -> Result<(SyncCycle, Arc<PgAnalyticsStore>)> {
    let source = SqliteSourceStore::connect(&config.source_database_url)
        .with_context(|| format!("opening source store {}", config.source_database_url))?;
    let analytics = PgAnalyticsStore::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to analytics store")?;
    let analytics = Arc::new(analytics);
    let cycle = SyncCycle::new(
        Arc::new(source),
        Arc::clone(&analytics) as Arc<dyn AnalyticsStore>,
        clock,
        config,
    );
    Ok((cycle, analytics))
}

pub async fn run_sync_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env();
    let (cycle, _) = connect_cycle(&config, Arc::new(SystemClock)).await?;
    let summary = cycle.run_once().await?;
    Ok(summary)
}

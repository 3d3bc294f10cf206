use std::sync::Arc;

use chrono::{DateTime, Utc};
use popmetrics_storage::{AnalyticsStore, SourceStore, TtlCache};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::extract::Extractor;
use crate::group::group_records;
use crate::persist::Persister;
use crate::reconcile::Reconciler;
use crate::scheduler::{CycleFn, CycleFuture, TaskContext};
use crate::view::ViewRefresher;
use crate::CycleError;

pub const DEFAULT_TASK_NAME: &str = "popularity_sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub extracted_at: DateTime<Utc>,
    pub extracted: usize,
    pub discarded: usize,
    pub groups: usize,
    pub skipped_groups: usize,
    pub late_members: usize,
    pub new_members: u64,
    pub new_buckets: u64,
    pub members_conflicted: u64,
    pub buckets_conflicted: u64,
    pub view_refreshed: bool,
}

/// One extract → group → reconcile → persist → refresh pass. Phases run
/// strictly in sequence.
pub struct SyncCycle {
    extractor: Extractor,
    reconciler: Reconciler,
    persister: Persister,
    view: ViewRefresher,
    clock: Arc<dyn Clock>,
}

impl SyncCycle {
    pub fn new(
        source: Arc<dyn SourceStore>,
        analytics: Arc<dyn AnalyticsStore>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            extractor: Extractor::new(
                source,
                config.category_denylist.iter().cloned(),
                config.keep_empty_categories,
            ),
            reconciler: Reconciler::new(Arc::clone(&analytics)),
            persister: Persister::new(Arc::clone(&analytics), config.batch_size),
            view: ViewRefresher::new(analytics, config.auto_provision_view),
            clock,
        }
    }

    pub async fn run_once(&self) -> Result<CycleSummary, CycleError> {
        self.run_in_task(DEFAULT_TASK_NAME).await
    }

    pub async fn run_in_task(&self, task: &str) -> Result<CycleSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, task);
        self.run_phases(run_id).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid) -> Result<CycleSummary, CycleError> {
        let extracted_at = self.clock.now();
        info!(%extracted_at, "sync cycle started");

        let extraction = self.extractor.extract().await.map_err(CycleError::Extract)?;
        let groups = group_records(&extraction.records);
        let write_set = self
            .reconciler
            .reconcile(&groups, extracted_at)
            .await
            .map_err(CycleError::Reconcile)?;
        let outcome = self
            .persister
            .persist(&write_set)
            .await
            .map_err(CycleError::Persist)?;

        // The write is committed at this point; view problems only delay the
        // aggregate until the next cycle.
        let view_refreshed = match self.view.refresh().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "aggregate view not refreshed");
                false
            }
        };

        let summary = CycleSummary {
            run_id,
            extracted_at,
            extracted: extraction.records.len(),
            discarded: extraction.discarded(),
            groups: groups.len(),
            skipped_groups: write_set.skipped_groups,
            late_members: write_set.late_members,
            new_members: outcome.members_written,
            new_buckets: outcome.buckets_written,
            members_conflicted: outcome.members_conflicted,
            buckets_conflicted: outcome.buckets_conflicted,
            view_refreshed,
        };
        info!(
            extracted = summary.extracted,
            discarded = summary.discarded,
            groups = summary.groups,
            new_members = summary.new_members,
            new_buckets = summary.new_buckets,
            view_refreshed,
            "sync cycle finished"
        );
        Ok(summary)
    }
}

/// Wrap a cycle as a scheduler task body.
pub fn sync_task(cycle: Arc<SyncCycle>) -> CycleFn {
    Arc::new(move |ctx: TaskContext| -> CycleFuture {
        let cycle = Arc::clone(&cycle);
        Box::pin(async move {
            cycle.run_in_task(&ctx.task).await?;
            Ok(())
        })
    })
}

/// Drop `key` from `cache` after every successful run of `task`, so readers
/// pick up the refreshed view instead of waiting out the entry's TTL.
pub fn invalidate_after<V>(task: CycleFn, cache: Arc<TtlCache<V>>, key: &'static str) -> CycleFn
where
    V: Clone + Send + 'static,
{
    Arc::new(move |ctx: TaskContext| -> CycleFuture {
        let run = task(ctx);
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            run.await?;
            match cache.delete(key) {
                Ok(removed) => debug!(cache_key = key, removed, "invalidated cached read"),
                Err(err) => warn!(cache_key = key, error = %err, "could not invalidate cached read"),
            }
            Ok(())
        })
    })
}

use std::sync::Arc;

use popmetrics_storage::{AnalyticsStore, AnalyticsTx, StoreError};
use tracing::{debug, error};

use crate::reconcile::WriteSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub members_written: u64,
    pub buckets_written: u64,
    /// Rows ignored because another writer committed the same key first.
    pub members_conflicted: u64,
    pub buckets_conflicted: u64,
}

/// Writes a cycle's write set in one transaction, in fixed-size batches.
pub struct Persister {
    store: Arc<dyn AnalyticsStore>,
    batch_size: usize,
}

impl Persister {
    pub fn new(store: Arc<dyn AnalyticsStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn persist(&self, write_set: &WriteSet) -> Result<PersistOutcome, StoreError> {
        if write_set.is_empty() {
            return Ok(PersistOutcome::default());
        }

        let mut tx = self.store.begin().await?;
        match self.write_batches(tx.as_mut(), write_set).await {
            Ok(outcome) => {
                tx.commit().await?;
                if outcome.members_conflicted > 0 || outcome.buckets_conflicted > 0 {
                    debug!(
                        members = outcome.members_conflicted,
                        buckets = outcome.buckets_conflicted,
                        "rows already present, insert ignored"
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                error!(error = %err, "persist failed, rolling back cycle writes");
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "rollback failed");
                }
                Err(match err {
                    StoreError::PersistFailure(_) => err,
                    other => StoreError::PersistFailure(other.to_string()),
                })
            }
        }
    }

    async fn write_batches(
        &self,
        tx: &mut dyn AnalyticsTx,
        write_set: &WriteSet,
    ) -> Result<PersistOutcome, StoreError> {
        let mut outcome = PersistOutcome::default();

        for batch in write_set.members.chunks(self.batch_size) {
            let written = tx.insert_members(batch).await?;
            outcome.members_written += written;
            outcome.members_conflicted += batch.len() as u64 - written;
        }
        for batch in write_set.buckets.chunks(self.batch_size) {
            let written = tx.insert_buckets(batch).await?;
            outcome.buckets_written += written;
            outcome.buckets_conflicted += batch.len() as u64 - written;
        }

        Ok(outcome)
    }
}

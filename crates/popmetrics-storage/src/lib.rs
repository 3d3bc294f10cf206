//! Store handles for the source-of-record and the analytics store, plus the
//! read-path TTL cache.

use std::collections::HashSet;

use async_trait::async_trait;
use popmetrics_core::{AggregateRow, BucketKey, MemberRecord, PopularityBucket, SourceRecord};
use thiserror::Error;

mod cache;
mod memory;
mod postgres;
mod source;

pub use cache::{CacheError, CacheStats, KeyStats, TtlCache};
pub use memory::MemoryAnalyticsStore;
pub use postgres::PgAnalyticsStore;
pub use source::SqliteSourceStore;

pub const CRATE_NAME: &str = "popmetrics-storage";

/// Name of the derived per-category aggregate.
pub const AGGREGATE_VIEW_NAME: &str = "mv_category_popularity";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source store unavailable: {0}")]
    SourceUnavailable(String),
    #[error("persist failed: {0}")]
    PersistFailure(String),
    #[error("aggregate view `{0}` does not exist")]
    ViewMissing(String),
    #[error("aggregate view refresh failed: {0}")]
    ViewRefreshFailure(String),
    #[error("analytics query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_view_missing(&self) -> bool {
        matches!(self, StoreError::ViewMissing(_))
    }
}

/// Read-only access to the source-of-record.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, StoreError>;
}

/// Analytics store holding members, popularity buckets and the aggregate view.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn member_ids(&self) -> Result<HashSet<String>, StoreError>;

    async fn bucket_keys(&self) -> Result<HashSet<BucketKey>, StoreError>;

    /// Cumulative count of the most recently extracted bucket for `category`.
    async fn latest_cumulative(&self, category: &str) -> Result<Option<i64>, StoreError>;

    /// Sum of incremental counts over every bucket of `category`.
    async fn historical_sum(&self, category: &str) -> Result<i64, StoreError>;

    /// Names of the members counted under `category`, sorted.
    async fn member_names(&self, category: &str) -> Result<Vec<String>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn AnalyticsTx>, StoreError>;

    /// Rebuild the aggregate view. Fails with [`StoreError::ViewMissing`] when it
    /// has not been provisioned.
    async fn refresh_aggregate_view(&self) -> Result<(), StoreError>;

    /// Create the aggregate view, replacing whatever object holds its name.
    async fn provision_aggregate_view(&self) -> Result<(), StoreError>;

    /// Aggregate rows ordered by total count, highest first.
    async fn aggregate_view(&self) -> Result<Vec<AggregateRow>, StoreError>;

    /// Buckets of one category ordered by extraction time.
    async fn buckets_for(&self, category: &str) -> Result<Vec<PopularityBucket>, StoreError>;
}

/// One write transaction. Inserts ignore rows whose key already exists and
/// return how many rows were actually written.
#[async_trait]
pub trait AnalyticsTx: Send {
    async fn insert_members(&mut self, batch: &[MemberRecord]) -> Result<u64, StoreError>;

    async fn insert_buckets(&mut self, batch: &[PopularityBucket]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

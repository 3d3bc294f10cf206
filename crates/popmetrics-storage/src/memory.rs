use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use popmetrics_core::{AggregateRow, BucketKey, MemberRecord, PopularityBucket};
use tokio::sync::{Mutex, RwLock};

use crate::{AnalyticsStore, AnalyticsTx, StoreError, AGGREGATE_VIEW_NAME};

#[derive(Debug, Default)]
struct MemoryState {
    members: BTreeMap<String, MemberRecord>,
    name_owners: HashMap<String, String>,
    buckets: BTreeMap<BucketKey, PopularityBucket>,
}

impl MemoryState {
    /// Ok(false) when the id already exists; Err on a name owned by another id.
    fn admit_member(&self, member: &MemberRecord) -> Result<bool, StoreError> {
        if self.members.contains_key(&member.id) {
            return Ok(false);
        }
        match self.name_owners.get(&member.name) {
            Some(owner) if owner != &member.id => Err(StoreError::PersistFailure(format!(
                "member name {} already belongs to {}",
                member.name, owner
            ))),
            _ => Ok(true),
        }
    }

    fn put_member(&mut self, member: MemberRecord) {
        self.name_owners.insert(member.name.clone(), member.id.clone());
        self.members.insert(member.id.clone(), member);
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_at_batch: Option<usize>,
    fail_commit: bool,
    fail_refresh: bool,
}

/// In-process analytics store with the same write semantics as the Postgres
/// one: staged transactions applied under a single lock and a view replaced
/// wholesale on refresh.
#[derive(Debug, Default)]
pub struct MemoryAnalyticsStore {
    state: Arc<Mutex<MemoryState>>,
    view: RwLock<Option<Arc<Vec<AggregateRow>>>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryAnalyticsStore {
    /// Empty store without an aggregate view; call
    /// [`AnalyticsStore::provision_aggregate_view`] before refreshing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next transaction fail when it executes its `batch_index`-th
    /// insert batch (zero-based, members and buckets counted together).
    pub async fn fail_next_transaction_at_batch(&self, batch_index: usize) {
        self.faults.lock().await.fail_at_batch = Some(batch_index);
    }

    pub async fn fail_next_commit(&self) {
        self.faults.lock().await.fail_commit = true;
    }

    pub async fn fail_next_refresh(&self) {
        self.faults.lock().await.fail_refresh = true;
    }

    pub async fn members(&self) -> Vec<MemberRecord> {
        self.state.lock().await.members.values().cloned().collect()
    }

    pub async fn buckets(&self) -> Vec<PopularityBucket> {
        self.state.lock().await.buckets.values().cloned().collect()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalyticsStore {
    async fn member_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().await.members.keys().cloned().collect())
    }

    async fn bucket_keys(&self) -> Result<HashSet<BucketKey>, StoreError> {
        Ok(self.state.lock().await.buckets.keys().cloned().collect())
    }

    async fn latest_cumulative(&self, category: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        let latest = state
            .buckets
            .values()
            .filter(|b| b.category == category)
            .max_by_key(|b| (b.extracted_at, b.cumulative_count))
            .map(|b| b.cumulative_count);
        Ok(latest)
    }

    async fn historical_sum(&self, category: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .buckets
            .values()
            .filter(|b| b.category == category)
            .map(|b| b.incremental_count)
            .sum())
    }

    async fn member_names(&self, category: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut names = state
            .members
            .values()
            .filter(|m| m.category == category)
            .map(|m| m.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    async fn begin(&self) -> Result<Box<dyn AnalyticsTx>, StoreError> {
        let mut faults = self.faults.lock().await;
        let fail_at_batch = faults.fail_at_batch.take();
        let fail_commit = std::mem::take(&mut faults.fail_commit);
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            staged_members: Vec::new(),
            staged_buckets: Vec::new(),
            batches: 0,
            fail_at_batch,
            fail_commit,
        }))
    }

    async fn refresh_aggregate_view(&self) -> Result<(), StoreError> {
        if std::mem::take(&mut self.faults.lock().await.fail_refresh) {
            return Err(StoreError::ViewRefreshFailure("injected refresh failure".into()));
        }
        if self.view.read().await.is_none() {
            return Err(StoreError::ViewMissing(AGGREGATE_VIEW_NAME.to_string()));
        }

        let rows = {
            let state = self.state.lock().await;
            let mut per_category: BTreeMap<&str, AggregateRow> = BTreeMap::new();
            for bucket in state.buckets.values() {
                per_category
                    .entry(bucket.category.as_str())
                    .and_modify(|row| {
                        row.total_count += bucket.incremental_count;
                        row.last_updated = row.last_updated.max(bucket.extracted_at);
                    })
                    .or_insert_with(|| AggregateRow {
                        category: bucket.category.clone(),
                        total_count: bucket.incremental_count,
                        last_updated: bucket.extracted_at,
                    });
            }
            let mut rows = per_category.into_values().collect::<Vec<_>>();
            rows.sort_by(|a, b| {
                b.total_count
                    .cmp(&a.total_count)
                    .then_with(|| a.category.cmp(&b.category))
            });
            rows
        };

        *self.view.write().await = Some(Arc::new(rows));
        Ok(())
    }

    async fn provision_aggregate_view(&self) -> Result<(), StoreError> {
        *self.view.write().await = Some(Arc::new(Vec::new()));
        self.refresh_aggregate_view().await
    }

    async fn aggregate_view(&self) -> Result<Vec<AggregateRow>, StoreError> {
        match self.view.read().await.as_ref() {
            Some(rows) => Ok(rows.as_ref().clone()),
            None => Err(StoreError::ViewMissing(AGGREGATE_VIEW_NAME.to_string())),
        }
    }

    async fn buckets_for(&self, category: &str) -> Result<Vec<PopularityBucket>, StoreError> {
        let state = self.state.lock().await;
        let mut buckets = state
            .buckets
            .values()
            .filter(|b| b.category == category)
            .cloned()
            .collect::<Vec<_>>();
        buckets.sort_by_key(|b| (b.extracted_at, b.cumulative_count));
        Ok(buckets)
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    staged_members: Vec<MemberRecord>,
    staged_buckets: Vec<PopularityBucket>,
    batches: usize,
    fail_at_batch: Option<usize>,
    fail_commit: bool,
}

impl MemoryTx {
    fn next_batch(&mut self) -> Result<(), StoreError> {
        let index = self.batches;
        self.batches += 1;
        if self.fail_at_batch == Some(index) {
            return Err(StoreError::PersistFailure(format!(
                "injected failure at batch {index}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsTx for MemoryTx {
    async fn insert_members(&mut self, batch: &[MemberRecord]) -> Result<u64, StoreError> {
        self.next_batch()?;
        let state = self.state.lock().await;
        let mut inserted = 0;
        for member in batch {
            if self.staged_members.iter().any(|m| m.id == member.id) {
                continue;
            }
            if let Some(staged) = self.staged_members.iter().find(|m| m.name == member.name) {
                return Err(StoreError::PersistFailure(format!(
                    "member name {} already belongs to {}",
                    member.name, staged.id
                )));
            }
            if state.admit_member(member)? {
                self.staged_members.push(member.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_buckets(&mut self, batch: &[PopularityBucket]) -> Result<u64, StoreError> {
        self.next_batch()?;
        let state = self.state.lock().await;
        let mut inserted = 0;
        for bucket in batch {
            let key = bucket.key();
            if state.buckets.contains_key(&key)
                || self.staged_buckets.iter().any(|b| b.key() == key)
            {
                continue;
            }
            self.staged_buckets.push(bucket.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            state,
            staged_members,
            staged_buckets,
            fail_commit,
            ..
        } = *self;
        if fail_commit {
            return Err(StoreError::PersistFailure("injected commit failure".into()));
        }
        let mut state = state.lock().await;
        // Another transaction may have committed since these rows were staged.
        for member in &staged_members {
            state.admit_member(member)?;
        }
        for member in staged_members {
            if !state.members.contains_key(&member.id) {
                state.put_member(member);
            }
        }
        for bucket in staged_buckets {
            state.buckets.entry(bucket.key()).or_insert(bucket);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

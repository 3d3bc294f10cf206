use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use popmetrics_core::{MemberRecord, PopularityBucket};
use popmetrics_storage::{AnalyticsStore, StoreError};
use tracing::{debug, warn};

use crate::group::Group;

/// Rows one cycle has to write, plus what was left out and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub members: Vec<MemberRecord>,
    pub buckets: Vec<PopularityBucket>,
    /// Groups whose members were all persisted already.
    pub skipped_groups: usize,
    /// New members whose `(date, category)` bucket is already frozen.
    pub late_members: usize,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.buckets.is_empty()
    }
}

/// Computes the delta between grouped extractions and the analytics store.
pub struct Reconciler {
    store: Arc<dyn AnalyticsStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// `groups` must be in bucket-key order so cumulative counts chain by date.
    pub async fn reconcile(
        &self,
        groups: &[Group],
        extracted_at: DateTime<Utc>,
    ) -> Result<WriteSet, StoreError> {
        let existing_ids = self.store.member_ids().await?;
        let existing_buckets = self.store.bucket_keys().await?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut running: HashMap<&str, i64> = HashMap::new();
        let mut out = WriteSet::default();

        for group in groups {
            let new_members = group
                .members
                .iter()
                .filter(|m| !existing_ids.contains(&m.id) && seen.insert(m.id.as_str()))
                .cloned()
                .collect::<Vec<_>>();

            if new_members.is_empty() {
                debug!(
                    bucket_date = %group.bucket_date(),
                    category = group.category(),
                    "no new members, skipping group"
                );
                out.skipped_groups += 1;
                continue;
            }

            if existing_buckets.contains(&group.key) {
                warn!(
                    bucket_date = %group.bucket_date(),
                    category = group.category(),
                    late = new_members.len(),
                    "members arrived after their bucket was written; bucket left unchanged"
                );
                out.late_members += new_members.len();
                out.members.extend(new_members);
                continue;
            }

            let prior = match running.get(group.category()) {
                Some(value) => *value,
                None => self.prior_cumulative(group.category()).await?,
            };
            let incremental = new_members.len() as i64;
            let cumulative = prior + incremental;
            running.insert(group.category(), cumulative);

            out.buckets.push(PopularityBucket {
                bucket_date: group.bucket_date(),
                category: group.category().to_string(),
                incremental_count: incremental,
                cumulative_count: cumulative,
                extracted_at,
            });
            out.members.extend(new_members);
        }

        Ok(out)
    }

    async fn prior_cumulative(&self, category: &str) -> Result<i64, StoreError> {
        match self.store.latest_cumulative(category).await? {
            Some(value) => Ok(value),
            None => self.store.historical_sum(category).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::group_records;
    use chrono::{NaiveDate, TimeZone};
    use popmetrics_core::ExtractedRecord;
    use popmetrics_storage::{AnalyticsTx, MemoryAnalyticsStore};

    fn record(id: &str, category: &str, day: u32) -> ExtractedRecord {
        ExtractedRecord {
            id: id.to_string(),
            name: format!("exp-{id}"),
            category: category.to_string(),
            created_at: NaiveDate::from_ymd_opt(2023, 1, day)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).single().unwrap()
    }

    async fn commit(store: &MemoryAnalyticsStore, set: &WriteSet) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_members(&set.members).await.unwrap();
        tx.insert_buckets(&set.buckets).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn chains_cumulative_counts_within_a_cycle() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let reconciler = Reconciler::new(store.clone());
        let groups = group_records(&[
            record("e1", "EC-Earth", 1),
            record("e2", "EC-Earth", 1),
            record("e3", "EC-Earth", 2),
            record("e4", "IFS", 2),
        ]);

        let set = reconciler.reconcile(&groups, at(0)).await.unwrap();
        let counts = set
            .buckets
            .iter()
            .map(|b| (b.category.as_str(), b.incremental_count, b.cumulative_count))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![("EC-Earth", 2, 2), ("EC-Earth", 1, 3), ("IFS", 1, 1)]);
        assert_eq!(set.members.len(), 4);
        assert!(set.buckets.iter().all(|b| b.extracted_at == at(0)));
    }

    #[tokio::test]
    async fn continues_from_persisted_cumulative() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let reconciler = Reconciler::new(store.clone());

        let first = group_records(&[record("e1", "EC-Earth", 1), record("e2", "EC-Earth", 1)]);
        let set = reconciler.reconcile(&first, at(0)).await.unwrap();
        commit(&store, &set).await;

        let second = group_records(&[
            record("e1", "EC-Earth", 1),
            record("e2", "EC-Earth", 1),
            record("e3", "EC-Earth", 2),
        ]);
        let set = reconciler.reconcile(&second, at(1)).await.unwrap();
        assert_eq!(set.skipped_groups, 1);
        assert_eq!(set.members.len(), 1);
        assert_eq!(set.buckets.len(), 1);
        assert_eq!(set.buckets[0].cumulative_count, 3);
        assert_eq!(set.buckets[0].incremental_count, 1);
    }

    #[tokio::test]
    async fn replay_of_synced_extraction_is_empty() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let reconciler = Reconciler::new(store.clone());
        let groups = group_records(&[record("e1", "EC-Earth", 1), record("e2", "IFS", 1)]);

        let set = reconciler.reconcile(&groups, at(0)).await.unwrap();
        commit(&store, &set).await;

        let replay = reconciler.reconcile(&groups, at(1)).await.unwrap();
        assert!(replay.is_empty());
        assert_eq!(replay.skipped_groups, 2);
    }

    #[tokio::test]
    async fn late_members_do_not_touch_frozen_buckets() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let reconciler = Reconciler::new(store.clone());

        let set = reconciler
            .reconcile(&group_records(&[record("e1", "EC-Earth", 1)]), at(0))
            .await
            .unwrap();
        commit(&store, &set).await;

        let groups = group_records(&[record("e1", "EC-Earth", 1), record("e9", "EC-Earth", 1)]);
        let set = reconciler.reconcile(&groups, at(1)).await.unwrap();
        assert!(set.buckets.is_empty());
        assert_eq!(set.late_members, 1);
        assert_eq!(set.members[0].id, "e9");
    }

    #[tokio::test]
    async fn an_id_repeated_across_groups_counts_once() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let reconciler = Reconciler::new(store);
        let groups = group_records(&[record("e1", "EC-Earth", 1), record("e1", "EC-Earth", 2)]);

        let set = reconciler.reconcile(&groups, at(0)).await.unwrap();
        assert_eq!(set.members.len(), 1);
        assert_eq!(set.buckets.len(), 1);
        assert_eq!(set.skipped_groups, 1);
    }
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use popmetrics_core::SourceRecord;
use popmetrics_storage::{
    AnalyticsStore, MemoryAnalyticsStore, SourceStore, SqliteSourceStore, StoreError,
};
use popmetrics_sync::{Clock, CycleError, ManualClock, SyncConfig, SyncCycle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tempfile::tempdir;

#[derive(Default)]
struct FakeSource {
    rows: Mutex<Vec<SourceRecord>>,
    unavailable: Mutex<bool>,
}

impl FakeSource {
    fn push(&self, id: &str, category: &str, day: u32) {
        self.rows.lock().unwrap().push(SourceRecord {
            id: id.to_string(),
            name: format!("exp-{id}"),
            owner_name: "user".to_string(),
            category_raw: category.to_string(),
            created_at: Some(
                NaiveDate::from_ymd_opt(2023, 1, day)
                    .unwrap()
                    .and_hms_opt(9, 15, 0)
                    .unwrap(),
            ),
            branch: "main".to_string(),
            host: "marenostrum".to_string(),
        });
    }

    fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }
}

#[async_trait]
impl SourceStore for FakeSource {
    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        if *self.unavailable.lock().unwrap() {
            return Err(StoreError::SourceUnavailable("connection refused".into()));
        }
        Ok(self.rows.lock().unwrap().clone())
    }
}

struct Harness {
    source: Arc<FakeSource>,
    store: Arc<MemoryAnalyticsStore>,
    clock: Arc<ManualClock>,
    cycle: SyncCycle,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let source = Arc::new(FakeSource::default());
        let store = Arc::new(MemoryAnalyticsStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
        ));
        let cycle = SyncCycle::new(source.clone(), store.clone(), clock.clone(), &config);
        Self {
            source,
            store,
            clock,
            cycle,
        }
    }

    fn with_defaults() -> Self {
        Self::new(SyncConfig::default())
    }

    fn tick(&self) {
        self.clock.advance(Duration::hours(1));
    }
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, day).unwrap()
}

#[tokio::test]
async fn normalized_variants_share_one_bucket() {
    let h = Harness::with_defaults();
    h.source.push("e1", "EC-Earth/", 1);
    h.source.push("e2", "'EC-Earth'", 1);

    let summary = h.cycle.run_once().await.unwrap();
    assert_eq!(summary.new_members, 2);
    assert_eq!(summary.new_buckets, 1);

    let buckets = h.store.buckets().await;
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].bucket_date, date(1));
    assert_eq!(buckets[0].category, "EC-Earth");
    assert_eq!(buckets[0].incremental_count, 2);
    assert_eq!(buckets[0].cumulative_count, 2);
}

#[tokio::test]
async fn new_day_extends_cumulative_and_freezes_old_bucket() {
    let h = Harness::with_defaults();
    h.source.push("e1", "EC-Earth/", 1);
    h.source.push("e2", "'EC-Earth'", 1);
    h.cycle.run_once().await.unwrap();

    h.tick();
    h.source.push("e3", "EC-Earth", 2);
    let summary = h.cycle.run_once().await.unwrap();
    assert_eq!(summary.new_members, 1);
    assert_eq!(summary.new_buckets, 1);
    assert_eq!(summary.skipped_groups, 1);

    let buckets = h.store.buckets_for("EC-Earth").await.unwrap();
    let rows = buckets
        .iter()
        .map(|b| (b.bucket_date, b.incremental_count, b.cumulative_count))
        .collect::<Vec<_>>();
    assert_eq!(rows, vec![(date(1), 2, 2), (date(2), 1, 3)]);

    let view = h.store.aggregate_view().await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].category, "EC-Earth");
    assert_eq!(view[0].total_count, 3);
    assert_eq!(view[0].last_updated, h.clock.now());
}

#[tokio::test]
async fn denylisted_values_never_reach_the_store() {
    let h = Harness::with_defaults();
    h.source.push("e1", "NA", 1);
    h.source.push("e2", "EC-Earth", 1);
    h.source.push("e3", "blabla", 1);

    let summary = h.cycle.run_once().await.unwrap();
    assert_eq!(summary.discarded, 2);

    let members = h.store.members().await;
    assert_eq!(members.len(), 1);
    assert!(members.iter().all(|m| m.category != "NA"));
    assert!(h.store.buckets().await.iter().all(|b| b.category == "EC-Earth"));
}

#[tokio::test]
async fn replaying_an_unchanged_source_writes_nothing() {
    let h = Harness::with_defaults();
    h.source.push("e1", "EC-Earth", 1);
    h.source.push("e2", "IFS", 2);
    h.cycle.run_once().await.unwrap();
    let members_before = h.store.members().await;
    let buckets_before = h.store.buckets().await;

    h.tick();
    let summary = h.cycle.run_once().await.unwrap();
    assert_eq!(summary.new_members, 0);
    assert_eq!(summary.new_buckets, 0);
    assert_eq!(summary.skipped_groups, 2);
    assert_eq!(h.store.members().await, members_before);
    assert_eq!(h.store.buckets().await, buckets_before);
}

#[tokio::test]
async fn cumulative_counts_are_monotonic_and_conserved() {
    let h = Harness::with_defaults();
    let batches: [&[(&str, &str, u32)]; 4] = [
        &[("e1", "EC-Earth", 1), ("e2", "IFS", 1), ("e3", "EC-Earth", 3)],
        &[("e4", "EC-Earth", 4), ("e5", "EC-Earth", 4), ("e6", "IFS", 2)],
        &[],
        &[("e7", "IFS", 5), ("e8", "EC-Earth", 1), ("e9", "EC-Earth", 6)],
    ];

    for batch in batches {
        for (id, category, day) in batch {
            h.source.push(id, category, *day);
        }
        h.cycle.run_once().await.unwrap();
        h.tick();
    }

    for category in ["EC-Earth", "IFS"] {
        let buckets = h.store.buckets_for(category).await.unwrap();
        assert!(buckets
            .windows(2)
            .all(|pair| pair[0].cumulative_count <= pair[1].cumulative_count));
        let total: i64 = buckets.iter().map(|b| b.incremental_count).sum();
        let latest = h.store.latest_cumulative(category).await.unwrap();
        assert_eq!(latest, Some(total), "category {category}");
    }
}

#[tokio::test]
async fn failed_persist_leaves_nothing_and_next_cycle_recovers() {
    let h = Harness::new(SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
    });
    h.source.push("e1", "EC-Earth", 1);
    h.source.push("e2", "EC-Earth", 1);
    h.source.push("e3", "IFS", 2);
    h.store.fail_next_transaction_at_batch(1).await;

    let err = h.cycle.run_once().await.unwrap_err();
    assert!(matches!(err, CycleError::Persist(StoreError::PersistFailure(_))));
    assert_eq!(err.phase(), "persist");
    assert!(h.store.members().await.is_empty());
    assert!(h.store.buckets().await.is_empty());

    h.tick();
    let summary = h.cycle.run_once().await.unwrap();
    assert_eq!(summary.new_members, 3);
    assert_eq!(summary.new_buckets, 2);
    let ec_earth = h.store.buckets_for("EC-Earth").await.unwrap();
    assert_eq!(ec_earth[0].cumulative_count, 2);
    assert_eq!(ec_earth[0].extracted_at, h.clock.now());
}

#[tokio::test]
async fn unavailable_source_aborts_before_any_write() {
    let h = Harness::with_defaults();
    h.source.push("e1", "EC-Earth", 1);
    h.source.set_unavailable(true);

    let err = h.cycle.run_once().await.unwrap_err();
    assert!(matches!(err, CycleError::Extract(StoreError::SourceUnavailable(_))));
    assert!(h.store.members().await.is_empty());

    h.source.set_unavailable(false);
    assert_eq!(h.cycle.run_once().await.unwrap().new_members, 1);
}

#[tokio::test]
async fn missing_view_is_provisioned_on_first_cycle() {
    let h = Harness::with_defaults();
    assert!(h.store.aggregate_view().await.unwrap_err().is_view_missing());
    h.source.push("e1", "EC-Earth", 1);

    let summary = h.cycle.run_once().await.unwrap();
    assert!(summary.view_refreshed);
    assert_eq!(h.store.aggregate_view().await.unwrap()[0].total_count, 1);
}

#[tokio::test]
async fn view_problems_do_not_roll_back_the_write() {
    let h = Harness::new(SyncConfig {
        auto_provision_view: false,
        ..SyncConfig::default()
    });
    h.source.push("e1", "EC-Earth", 1);

    let summary = h.cycle.run_once().await.unwrap();
    assert!(!summary.view_refreshed);
    assert_eq!(h.store.members().await.len(), 1);

    h.store.provision_aggregate_view().await.unwrap();
    h.source.push("e2", "EC-Earth", 2);
    h.store.fail_next_refresh().await;
    h.tick();
    let summary = h.cycle.run_once().await.unwrap();
    assert!(!summary.view_refreshed);
    assert_eq!(h.store.aggregate_view().await.unwrap()[0].total_count, 1);

    h.tick();
    let summary = h.cycle.run_once().await.unwrap();
    assert!(summary.view_refreshed);
    assert_eq!(h.store.aggregate_view().await.unwrap()[0].total_count, 2);
}

#[tokio::test]
async fn syncs_from_an_sqlite_source_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("autosubmit.db");
    let seed = SqlitePool::connect_with(
        SqliteConnectOptions::new().filename(&path).create_if_missing(true),
    )
    .await
    .unwrap();
    for stmt in [
        "CREATE TABLE experiment (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        r#"CREATE TABLE details (exp_id INTEGER PRIMARY KEY, "user" TEXT, created TEXT, model TEXT, branch TEXT, hpc TEXT)"#,
        "INSERT INTO experiment (id, name) VALUES (1, 'a001'), (2, 'a002'), (3, 'a003'), (4, 'a004'), (5, 'a005')",
        r#"INSERT INTO details (exp_id, "user", created, model, branch, hpc) VALUES
            (1, 'alice', '2023-01-01T10:00:00+01:00', 'EC-Earth/', 'main', 'marenostrum'),
            (2, 'bob', '2023-01-01 18:45:00', '''EC-Earth''', 'main', 'lumi'),
            (3, 'carol', '2023-01-02', 'EC-Earth', 'dev', 'lumi'),
            (4, 'dave', '2023-01-02', 'NA', 'dev', 'lumi'),
            (5, 'erin', 'unknown', 'IFS', 'dev', 'lumi')"#,
    ] {
        sqlx::query(stmt).execute(&seed).await.unwrap();
    }
    seed.close().await;

    let source = SqliteSourceStore::connect(&format!("sqlite://{}", path.display())).unwrap();
    let store = Arc::new(MemoryAnalyticsStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().unwrap(),
    ));
    let cycle = SyncCycle::new(Arc::new(source), store.clone(), clock, &SyncConfig::default());

    let summary = cycle.run_once().await.unwrap();
    assert_eq!(summary.extracted, 3);
    assert_eq!(summary.discarded, 2);

    let ids = store
        .members()
        .await
        .into_iter()
        .map(|m| m.id)
        .collect::<HashSet<_>>();
    assert_eq!(ids, HashSet::from(["1".to_string(), "2".to_string(), "3".to_string()]));

    let view = store.aggregate_view().await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].total_count, 3);
}

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use popmetrics_core::{AggregateRow, BucketKey, MemberRecord, PopularityBucket};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{info, warn};

use crate::{AnalyticsStore, AnalyticsTx, StoreError, AGGREGATE_VIEW_NAME};

const UNDEFINED_TABLE: &str = "42P01";

/// Analytics store on Postgres. The aggregate view is a materialized view.
#[derive(Debug, Clone)]
pub struct PgAnalyticsStore {
    pool: PgPool,
}

impl PgAnalyticsStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the table migrations shipped with this crate.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn relation_kind(&self, name: &str) -> Result<Option<String>, StoreError> {
        let kind = sqlx::query_scalar::<_, String>(
            r#"
            SELECT c.relkind::text
              FROM pg_class c
              JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = current_schema()
               AND c.relname = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(kind)
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalyticsStore {
    async fn member_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM members")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn bucket_keys(&self) -> Result<HashSet<BucketKey>, StoreError> {
        let rows = sqlx::query("SELECT bucket_date, category FROM popularity_buckets")
            .fetch_all(&self.pool)
            .await?;
        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let bucket_date: NaiveDate = row.try_get("bucket_date")?;
            let category: String = row.try_get("category")?;
            keys.insert(BucketKey::new(bucket_date, category));
        }
        Ok(keys)
    }

    async fn latest_cumulative(&self, category: &str) -> Result<Option<i64>, StoreError> {
        // Buckets written in one cycle share `extracted_at`; within a cycle the
        // cumulative count only grows, so it breaks the tie.
        let latest = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT cumulative_count
              FROM popularity_buckets
             WHERE category = $1
             ORDER BY extracted_at DESC, cumulative_count DESC
             LIMIT 1
            "#,
        )
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn historical_sum(&self, category: &str) -> Result<i64, StoreError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(incremental_count), 0)::BIGINT FROM popularity_buckets WHERE category = $1",
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn member_names(&self, category: &str) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM members WHERE category = $1 ORDER BY name",
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn begin(&self) -> Result<Box<dyn AnalyticsTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::PersistFailure(format!("opening transaction: {err}")))?;
        Ok(Box::new(PgAnalyticsTx { tx }))
    }

    async fn refresh_aggregate_view(&self) -> Result<(), StoreError> {
        let populated = sqlx::query_scalar::<_, bool>(
            "SELECT ispopulated FROM pg_matviews WHERE schemaname = current_schema() AND matviewname = $1",
        )
        .bind(AGGREGATE_VIEW_NAME)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::ViewRefreshFailure(err.to_string()))?;

        let statement = match populated {
            None => return Err(StoreError::ViewMissing(AGGREGATE_VIEW_NAME.to_string())),
            // CONCURRENTLY needs the unique index and an already-populated view.
            Some(true) => format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {AGGREGATE_VIEW_NAME}"),
            Some(false) => format!("REFRESH MATERIALIZED VIEW {AGGREGATE_VIEW_NAME}"),
        };
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::ViewRefreshFailure(err.to_string()))?;
        Ok(())
    }

    async fn provision_aggregate_view(&self) -> Result<(), StoreError> {
        let drop_statement = match self.relation_kind(AGGREGATE_VIEW_NAME).await?.as_deref() {
            None => None,
            Some("m") => Some("DROP MATERIALIZED VIEW"),
            Some("v") => Some("DROP VIEW"),
            Some(kind) => {
                warn!(
                    view = AGGREGATE_VIEW_NAME,
                    relkind = kind,
                    "found a non-view object at the aggregate view name, dropping it"
                );
                Some("DROP TABLE")
            }
        };

        let mut tx = self.pool.begin().await?;
        if let Some(drop_statement) = drop_statement {
            sqlx::query(&format!("{drop_statement} IF EXISTS {AGGREGATE_VIEW_NAME} CASCADE"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!(
            r#"
            CREATE MATERIALIZED VIEW {AGGREGATE_VIEW_NAME} AS
            SELECT category,
                   SUM(incremental_count)::BIGINT AS total_count,
                   MAX(extracted_at) AS last_updated
              FROM popularity_buckets
             GROUP BY category
            WITH NO DATA
            "#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX idx_{AGGREGATE_VIEW_NAME}_category ON {AGGREGATE_VIEW_NAME} (category)"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX idx_{AGGREGATE_VIEW_NAME}_total ON {AGGREGATE_VIEW_NAME} (total_count DESC)"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("REFRESH MATERIALIZED VIEW {AGGREGATE_VIEW_NAME}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(view = AGGREGATE_VIEW_NAME, "provisioned aggregate view");
        Ok(())
    }

    async fn aggregate_view(&self) -> Result<Vec<AggregateRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT category, total_count, last_updated FROM {AGGREGATE_VIEW_NAME} ORDER BY total_count DESC, category"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| {
            let undefined = err
                .as_database_error()
                .and_then(|e| e.code())
                .is_some_and(|code| code == UNDEFINED_TABLE);
            if undefined {
                StoreError::ViewMissing(AGGREGATE_VIEW_NAME.to_string())
            } else {
                StoreError::Query(err)
            }
        })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AggregateRow {
                category: row.try_get("category")?,
                total_count: row.try_get("total_count")?,
                last_updated: row.try_get::<DateTime<Utc>, _>("last_updated")?,
            });
        }
        Ok(out)
    }

    async fn buckets_for(&self, category: &str) -> Result<Vec<PopularityBucket>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bucket_date, category, incremental_count, cumulative_count, extracted_at
              FROM popularity_buckets
             WHERE category = $1
             ORDER BY extracted_at, cumulative_count
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PopularityBucket {
                bucket_date: row.try_get("bucket_date")?,
                category: row.try_get("category")?,
                incremental_count: row.try_get("incremental_count")?,
                cumulative_count: row.try_get("cumulative_count")?,
                extracted_at: row.try_get("extracted_at")?,
            });
        }
        Ok(out)
    }
}

struct PgAnalyticsTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AnalyticsTx for PgAnalyticsTx {
    async fn insert_members(&mut self, batch: &[MemberRecord]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO members (id, name, category, created_at) ");
        builder.push_values(batch, |mut row, member| {
            row.push_bind(member.id.clone())
                .push_bind(member.name.clone())
                .push_bind(member.category.clone())
                .push_bind(member.created_at);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| StoreError::PersistFailure(format!("inserting members: {err}")))?;
        Ok(result.rows_affected())
    }

    async fn insert_buckets(&mut self, batch: &[PopularityBucket]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO popularity_buckets (bucket_date, category, incremental_count, cumulative_count, extracted_at) ",
        );
        builder.push_values(batch, |mut row, bucket| {
            row.push_bind(bucket.bucket_date)
                .push_bind(bucket.category.clone())
                .push_bind(bucket.incremental_count)
                .push_bind(bucket.cumulative_count)
                .push_bind(bucket.extracted_at);
        });
        builder.push(" ON CONFLICT (bucket_date, category) DO NOTHING");
        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| StoreError::PersistFailure(format!("inserting buckets: {err}")))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|err| StoreError::PersistFailure(format!("committing: {err}")))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|err| StoreError::PersistFailure(format!("rolling back: {err}")))
    }
}

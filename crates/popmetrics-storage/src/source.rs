use std::str::FromStr;

use async_trait::async_trait;
use popmetrics_core::{parse_source_timestamp, SourceRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::{SourceStore, StoreError};

/// Source-of-record backed by the experiment SQLite database.
///
/// Connections are opened with `read_only(true)`, so a stray write fails at the
/// driver even if one were issued through the pool.
#[derive(Debug, Clone)]
pub struct SqliteSourceStore {
    pool: SqlitePool,
}

impl SqliteSourceStore {
    /// Build a lazily-connecting read-only pool. Reachability is only checked
    /// when records are fetched.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| StoreError::SourceUnavailable(format!("invalid source url {url}: {err}")))?
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceStore for SqliteSourceStore {
    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id AS id,
                   e.name AS name,
                   d."user" AS owner_name,
                   d.model AS category_raw,
                   d.created AS created,
                   d.branch AS branch,
                   d.hpc AS host
              FROM details d
              JOIN experiment e ON d.exp_id = e.id
             ORDER BY e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::SourceUnavailable(err.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|err| StoreError::SourceUnavailable(err.to_string()))?;
            let text = |column: &str| -> String {
                match row.try_get::<Option<String>, _>(column) {
                    Ok(value) => value.unwrap_or_default(),
                    Err(err) => {
                        debug!(id, column, error = %err, "undecodable source column");
                        String::new()
                    }
                }
            };
            let name = match row.try_get::<String, _>("name") {
                Ok(name) if !name.is_empty() => name,
                Ok(_) => {
                    debug!(id, "skipping source record with an empty name");
                    continue;
                }
                Err(err) => {
                    debug!(id, error = %err, "skipping source record with an undecodable name");
                    continue;
                }
            };
            let created = text("created");
            let created_at = parse_source_timestamp(&created);
            if created_at.is_none() {
                debug!(id, created = %created, "source record has unparseable creation time");
            }
            out.push(SourceRecord {
                id: id.to_string(),
                name,
                owner_name: text("owner_name"),
                category_raw: text("category_raw"),
                created_at,
                branch: text("branch"),
                host: text("host"),
            });
        }
        Ok(out)
    }
}

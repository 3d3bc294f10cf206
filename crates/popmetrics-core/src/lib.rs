//! Core domain model for popularity metrics.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "popmetrics-core";

/// Category values the source uses as placeholders rather than real models.
pub const DEFAULT_CATEGORY_DENYLIST: [&str; 3] = ["NA", "Blabla", "blabla"];

/// One row of the upstream source-of-record. Never mutated by this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub owner_name: String,
    pub category_raw: String,
    /// `None` when the source text is not a recognised timestamp.
    pub created_at: Option<NaiveDateTime>,
    pub branch: String,
    pub host: String,
}

/// Extractor output: a valid source record with its category normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub id: String,
    pub name: String,
    pub category: String,
    pub created_at: NaiveDateTime,
}

/// Append-only member row in the analytics store, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    pub name: String,
    pub category: String,
    pub created_at: NaiveDateTime,
}

impl From<&ExtractedRecord> for MemberRecord {
    fn from(record: &ExtractedRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            category: record.category.clone(),
            created_at: record.created_at,
        }
    }
}

/// Primary key of a popularity bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub bucket_date: NaiveDate,
    pub category: String,
}

impl BucketKey {
    pub fn new(bucket_date: NaiveDate, category: impl Into<String>) -> Self {
        Self {
            bucket_date,
            category: category.into(),
        }
    }
}

/// Per-day, per-category popularity row. Frozen once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularityBucket {
    pub bucket_date: NaiveDate,
    pub category: String,
    pub incremental_count: i64,
    pub cumulative_count: i64,
    pub extracted_at: DateTime<Utc>,
}

impl PopularityBucket {
    pub fn key(&self) -> BucketKey {
        BucketKey::new(self.bucket_date, self.category.clone())
    }
}

/// One row of the derived aggregate view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub category: String,
    pub total_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// Normalize a raw category value.
///
/// Trailing `/` characters are stripped, then one layer of surrounding single
/// quotes is removed. The two steps repeat until the value stops changing, so
/// nested wrappings such as `"'x/'"` settle on the same result as a second pass
/// would produce. An empty result is returned as-is.
///
/// This differs from a single strip pass only on nested wrappings: `"''EC''"`
/// becomes `"EC"` here, where one pass leaves `"'EC'"`. Values a single pass
/// already leaves stable (`"EC-Earth/"`, `"'CMCC-ESM2'"`) come out the same.
pub fn normalize_category(raw: &str) -> String {
    let mut current = raw;
    loop {
        let next = strip_one_pass(current);
        if next.len() == current.len() {
            return next.to_string();
        }
        current = next;
    }
}

fn strip_one_pass(value: &str) -> &str {
    let value = value.trim_end_matches('/');
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Parse the textual creation time used by the source.
///
/// RFC 3339 values keep their wall-clock time and drop the offset. Plain
/// `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` (optionally fractional) and bare
/// dates are also accepted.
pub fn parse_source_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

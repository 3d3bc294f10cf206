use std::collections::HashSet;
use std::sync::Arc;

use popmetrics_core::{normalize_category, ExtractedRecord, SourceRecord};
use popmetrics_storage::{SourceStore, StoreError};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub records: Vec<ExtractedRecord>,
    pub denylisted: usize,
    pub invalid: usize,
}

impl Extraction {
    pub fn discarded(&self) -> usize {
        self.denylisted + self.invalid
    }
}

/// Reads the source-of-record, drops sentinel and invalid rows and normalizes
/// categories.
pub struct Extractor {
    source: Arc<dyn SourceStore>,
    denylist: HashSet<String>,
    keep_empty_categories: bool,
}

impl Extractor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        denylist: impl IntoIterator<Item = String>,
        keep_empty_categories: bool,
    ) -> Self {
        Self {
            source,
            denylist: denylist.into_iter().collect(),
            keep_empty_categories,
        }
    }

    pub async fn extract(&self) -> Result<Extraction, StoreError> {
        let rows = self.source.fetch_records().await?;
        let extraction = self.filter_and_normalize(rows);
        info!(
            extracted = extraction.records.len(),
            denylisted = extraction.denylisted,
            invalid = extraction.invalid,
            "extracted source records"
        );
        Ok(extraction)
    }

    fn filter_and_normalize(&self, rows: Vec<SourceRecord>) -> Extraction {
        let mut extraction = Extraction::default();
        for row in rows {
            // Denylist matching is on the raw value, before normalization.
            if self.denylist.contains(&row.category_raw) {
                extraction.denylisted += 1;
                continue;
            }
            let Some(created_at) = row.created_at else {
                debug!(id = %row.id, "dropping record without a creation time");
                extraction.invalid += 1;
                continue;
            };
            let category = normalize_category(&row.category_raw);
            if category.is_empty() && !self.keep_empty_categories {
                debug!(id = %row.id, raw = %row.category_raw, "dropping record with empty category");
                extraction.invalid += 1;
                continue;
            }
            extraction.records.push(ExtractedRecord {
                id: row.id,
                name: row.name,
                category,
                created_at,
            });
        }
        extraction
    }
}

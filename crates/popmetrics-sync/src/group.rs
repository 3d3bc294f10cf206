use std::collections::BTreeMap;

use chrono::NaiveDate;
use popmetrics_core::{BucketKey, ExtractedRecord, MemberRecord};

/// Records sharing a creation day and a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub key: BucketKey,
    /// Sorted by id, one entry per id.
    pub members: Vec<MemberRecord>,
}

impl Group {
    pub fn bucket_date(&self) -> NaiveDate {
        self.key.bucket_date
    }

    pub fn category(&self) -> &str {
        &self.key.category
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.id.as_str())
    }

    pub fn incremental_count(&self) -> i64 {
        self.members.len() as i64
    }
}

/// Partition records by `(creation date, category)`, ordered by date then
/// category. When an id repeats inside a group the first occurrence wins.
pub fn group_records(records: &[ExtractedRecord]) -> Vec<Group> {
    let mut groups: BTreeMap<BucketKey, Vec<MemberRecord>> = BTreeMap::new();
    for record in records {
        let key = BucketKey::new(record.created_at.date(), record.category.clone());
        groups.entry(key).or_default().push(MemberRecord::from(record));
    }

    groups
        .into_iter()
        .map(|(key, mut members)| {
            // Stable sort keeps source order among equal ids.
            members.sort_by(|a, b| a.id.cmp(&b.id));
            members.dedup_by(|later, earlier| later.id == earlier.id);
            Group { key, members }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, category: &str, day: u32, hour: u32) -> ExtractedRecord {
        ExtractedRecord {
            id: id.to_string(),
            name: format!("exp-{id}"),
            category: category.to_string(),
            created_at: NaiveDate::from_ymd_opt(2023, 1, day)
                .unwrap()
                .and_hms_opt(hour, 30, 0)
                .unwrap(),
        }
    }

    #[test]
    fn groups_by_day_and_category() {
        let groups = group_records(&[
            record("e3", "EC-Earth", 2, 9),
            record("e1", "EC-Earth", 1, 23),
            record("e2", "EC-Earth", 1, 0),
            record("e4", "CMCC-ESM2", 1, 12),
        ]);

        let summary = groups
            .iter()
            .map(|g| (g.bucket_date().to_string(), g.category().to_string(), g.incremental_count()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("2023-01-01".to_string(), "CMCC-ESM2".to_string(), 1),
                ("2023-01-01".to_string(), "EC-Earth".to_string(), 2),
                ("2023-01-02".to_string(), "EC-Earth".to_string(), 1),
            ]
        );
        assert_eq!(groups[1].member_ids().collect::<Vec<_>>(), vec!["e1", "e2"]);
    }

    #[test]
    fn input_order_does_not_change_groups() {
        let forward = vec![
            record("e1", "EC-Earth", 1, 1),
            record("e2", "EC-Earth", 1, 2),
            record("e3", "IFS", 3, 4),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(group_records(&forward), group_records(&backward));
    }

    #[test]
    fn repeated_ids_count_once() {
        let groups = group_records(&[
            record("e1", "EC-Earth", 1, 1),
            record("e1", "EC-Earth", 1, 5),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].incremental_count(), 1);
        assert_eq!(groups[0].members[0].created_at.format("%H").to_string(), "01");
    }

    #[test]
    fn empty_input_has_no_groups() {
        assert!(group_records(&[]).is_empty());
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::record::VersionRecord;

/// Groups raw version records by key, preserving the order the store emitted
/// them within each group.
pub fn group_by_key(
    records: impl IntoIterator<Item = VersionRecord>,
) -> HashMap<String, Vec<VersionRecord>> {
    let mut groups: HashMap<String, Vec<VersionRecord>> = HashMap::new();
    for record in records {
        groups.entry(record.key.clone()).or_default().push(record);
    }
    groups
}

/// Picks the version of `key` that was in effect at `restore_time`.
///
/// Versions are sorted ascending by modification time; equal timestamps keep
/// the order the store returned them in (stable sort), and the last such
/// element wins. A key with no version at or before the restore time yields a
/// tombstone so the restorer can decide whether to remove the destination
/// object. The result is flagged `is_current` when it equals the newest
/// version known for the key, which lets the restorer skip redundant
/// in-place copies.
pub fn select_target_version(
    src_bucket: &str,
    key: &str,
    mut versions: Vec<VersionRecord>,
    restore_time: DateTime<Utc>,
) -> VersionRecord {
    versions.sort_by_key(|record| record.last_modified);
    let current = versions.last().cloned();
    let candidate = versions.iter().rev().find(|record| {
        record
            .last_modified
            .is_some_and(|last_modified| last_modified <= restore_time)
    });
    let mut target = match candidate {
        Some(candidate) => candidate.clone(),
        None => VersionRecord::tombstone(key, src_bucket),
    };
    target.is_current = current.as_ref() == Some(&target);
    target
}

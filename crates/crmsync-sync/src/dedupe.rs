use std::collections::HashMap;

use crmsync_core::RawRecord;

/// Collapse records sharing `key_field`, keeping the last occurrence of each key.
///
/// Survivors come out in the order of their last occurrence. Records without a
/// key are passed through untouched so validation can count them.
pub fn dedupe(records: Vec<RawRecord>, key_field: &str) -> Vec<RawRecord> {
    let keys = records
        .iter()
        .map(|record| record.text(key_field))
        .collect::<Vec<_>>();

    let mut last_seen = HashMap::with_capacity(records.len());
    for (index, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            last_seen.insert(key.as_str(), index);
        }
    }

    records
        .into_iter()
        .zip(keys.iter())
        .enumerate()
        .filter(|(index, (_, key))| match key {
            Some(key) => last_seen.get(key.as_str()) == Some(index),
            None => true,
        })
        .map(|(_, (record, _))| record)
        .collect()
}

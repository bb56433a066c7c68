//! In-batch deduplication.
//!
//! Sources retry, and a retried page can carry the same logical record more
//! than once. Within one batch the **last** occurrence of a key is
//! authoritative; earlier occurrences are dropped and counted. Duplicates are
//! expected and never an error.
//!
//! Retained records keep the relative order of their last occurrences, so a
//! batch whose keys are all distinct comes back unchanged.

use std::collections::HashMap;

use crate::models::IngestBatch;

/// Result of collapsing one batch.
#[derive(Debug, Clone)]
pub struct Deduped {
    pub batch: IngestBatch,
    /// Number of records removed because a later record carried the same key.
    pub removed: u64,
}

/// Collapse duplicate keys in `batch`, last occurrence wins.
///
/// Records with an empty key are passed through untouched so that the
/// store's validation rejects and counts each of them individually.
pub fn dedup_batch(batch: IngestBatch) -> Deduped {
    let IngestBatch { kind, records } = batch;

    let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        if !record.key().is_empty() {
            last_seen.insert(record.key(), idx);
        }
    }

    let keep: Vec<bool> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| record.key().is_empty() || last_seen.get(record.key()) == Some(&idx))
        .collect();
    drop(last_seen);

    let before = records.len();
    let records: Vec<_> = records
        .into_iter()
        .zip(keep)
        .filter_map(|(record, keep)| keep.then_some(record))
        .collect();
    let removed = (before - records.len()) as u64;

    if removed > 0 {
        tracing::debug!(
            kind = kind.as_str(),
            removed,
            retained = records.len(),
            "collapsed duplicate keys within batch"
        );
    }

    Deduped {
        batch: IngestBatch { kind, records },
        removed,
    }
}

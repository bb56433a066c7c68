//! Transactional upsert store.
//!
//! The [`CatalogStore`] trait defines the single write path into the
//! persisted catalog. A commit is two-phase:
//!
//! 1. **Validate** every record. Invalid records are excluded before any
//!    transaction starts and reported individually.
//! 2. **Reconcile and write** the remaining records in one atomic
//!    transaction: every existing-row lookup happens before the first write,
//!    existing rows are updated in place (same internal id), new rows are
//!    inserted with a fresh id. Any failure rolls back the whole batch.
//!
//! The input must already be deduplicated. A uniqueness conflict at write
//! time means the lookup-before-write invariant was broken and is reported as
//! [`CommitError::InvariantViolation`], never retried.
//!
//! Implementations: [`sqlite::SqliteCatalogStore`] and
//! [`memory::InMemoryCatalogStore`].

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Candidate, RecordKind};

/// Earliest and latest accepted release years.
pub const MIN_YEAR: i64 = 1870;
pub const MAX_YEAR: i64 = 2100;

/// Why a single record was excluded from a commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("record has no key")]
    EmptyKey,
    #[error("catalog record has no title")]
    EmptyTitle,
    #[error("year {0} outside 1870..=2100")]
    YearOutOfRange(i64),
    #[error("record does not reference a catalog key")]
    MissingOwner,
    #[error("{0} must be a JSON object")]
    NotAnObject(&'static str),
}

/// Commit failures. Either way nothing from the batch was written.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A uniqueness conflict surfaced after deduplication. This is a logic
    /// error in the caller or the store, not a transient condition.
    #[error("uniqueness invariant violated: {kind:?} key '{key}' conflicted during commit")]
    InvariantViolation { kind: RecordKind, key: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl CommitError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, CommitError::InvariantViolation { .. })
    }
}

/// What happened to one input record of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted { id: i64 },
    Updated { id: i64 },
    Invalid(InvalidRecord),
}

/// Result of a successful commit; `records` is aligned with the input batch.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub records: Vec<RecordOutcome>,
    committed_keys: Vec<String>,
}

impl CommitOutcome {
    /// Keys written by this commit, in input order.
    pub fn committed_keys(&self) -> &[String] {
        &self.committed_keys
    }

    pub fn inserted(&self) -> u64 {
        self.count(|o| matches!(o, RecordOutcome::Inserted { .. }))
    }

    pub fn updated(&self) -> u64 {
        self.count(|o| matches!(o, RecordOutcome::Updated { .. }))
    }

    pub fn failed(&self) -> u64 {
        self.count(|o| matches!(o, RecordOutcome::Invalid(_)))
    }

    fn count(&self, pred: impl Fn(&RecordOutcome) -> bool) -> u64 {
        self.records.iter().filter(|o| pred(o)).count() as u64
    }
}

/// Abstract catalog storage. Only the pipeline's single committer calls
/// [`commit`](CatalogStore::commit); lookups are for inspection and tests.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Validate, reconcile and atomically write a deduplicated batch.
    async fn commit(&self, batch: &[Candidate]) -> Result<CommitOutcome, CommitError>;

    /// Internal id of the row with `key`, if persisted.
    async fn lookup_id(&self, kind: RecordKind, key: &str) -> Result<Option<i64>>;

    /// Number of persisted rows of `kind`.
    async fn count(&self, kind: RecordKind) -> Result<u64>;
}

/// Check one record against the catalog's validation rules.
pub fn validate(candidate: &Candidate) -> Result<(), InvalidRecord> {
    if candidate.key().trim().is_empty() {
        return Err(InvalidRecord::EmptyKey);
    }
    match candidate {
        Candidate::Catalog(r) => {
            if r.title.trim().is_empty() {
                return Err(InvalidRecord::EmptyTitle);
            }
            if let Some(year) = r.year {
                if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
                    return Err(InvalidRecord::YearOutOfRange(year));
                }
            }
            if !(r.metadata.is_null() || r.metadata.is_object()) {
                return Err(InvalidRecord::NotAnObject("metadata"));
            }
        }
        Candidate::Source(r) => {
            if r.catalog_key.trim().is_empty() {
                return Err(InvalidRecord::MissingOwner);
            }
        }
        Candidate::Variant(r) => {
            if r.catalog_key.trim().is_empty() {
                return Err(InvalidRecord::MissingOwner);
            }
            if !(r.descriptors.is_null() || r.descriptors.is_object()) {
                return Err(InvalidRecord::NotAnObject("descriptors"));
            }
        }
    }
    Ok(())
}

/// Validation phase shared by every store.
pub(crate) struct Prepared<'a> {
    /// One slot per input record; `None` for records that will be written.
    pub outcomes: Vec<Option<RecordOutcome>>,
    /// Records to write, with their index in the input batch.
    pub valid: Vec<(usize, &'a Candidate)>,
}

impl<'a> Prepared<'a> {
    /// Split `batch` into valid records and per-record rejections. Fails with
    /// an invariant violation if two valid records share a key.
    pub fn new(batch: &'a [Candidate]) -> Result<Self, CommitError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut valid = Vec::with_capacity(batch.len());
        let mut seen: HashSet<(RecordKind, &str)> = HashSet::with_capacity(batch.len());

        for (idx, candidate) in batch.iter().enumerate() {
            match validate(candidate) {
                Ok(()) => {
                    if !seen.insert((candidate.kind(), candidate.key())) {
                        return Err(CommitError::InvariantViolation {
                            kind: candidate.kind(),
                            key: candidate.key().to_string(),
                        });
                    }
                    outcomes.push(None);
                    valid.push((idx, candidate));
                }
                Err(reason) => {
                    tracing::debug!(
                        kind = candidate.kind().as_str(),
                        key = candidate.key(),
                        %reason,
                        "record failed validation"
                    );
                    outcomes.push(Some(RecordOutcome::Invalid(reason)));
                }
            }
        }

        Ok(Self { outcomes, valid })
    }

    /// Merge write results (aligned with `valid`) into the final outcome.
    pub fn finish(self, written: Vec<RecordOutcome>) -> CommitOutcome {
        let Prepared {
            mut outcomes,
            valid,
        } = self;
        let mut committed_keys = Vec::with_capacity(valid.len());
        for ((idx, candidate), outcome) in valid.into_iter().zip(written) {
            committed_keys.push(candidate.key().to_string());
            outcomes[idx] = Some(outcome);
        }
        CommitOutcome {
            records: outcomes.into_iter().flatten().collect(),
            committed_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogRecord, SourceReference, Variant};

    fn catalog(key: &str, title: &str, year: Option<i64>) -> Candidate {
        Candidate::Catalog(CatalogRecord {
            key: key.to_string(),
            title: title.to_string(),
            year,
            media_type: "movie".to_string(),
            metadata: serde_json::json!({}),
        })
    }

    #[test]
    fn validation_rules() {
        assert_eq!(validate(&catalog("k", "Heat", Some(1995))), Ok(()));
        assert_eq!(validate(&catalog("", "Heat", None)), Err(InvalidRecord::EmptyKey));
        assert_eq!(validate(&catalog("k", " ", None)), Err(InvalidRecord::EmptyTitle));
        assert_eq!(
            validate(&catalog("k", "Heat", Some(1200))),
            Err(InvalidRecord::YearOutOfRange(1200))
        );

        let orphan = Candidate::Source(SourceReference {
            source_key: "movies:1".into(),
            catalog_key: "".into(),
            origin: "movies".into(),
        });
        assert_eq!(validate(&orphan), Err(InvalidRecord::MissingOwner));

        let bad_variant = Candidate::Variant(Variant {
            variant_key: "k#hd".into(),
            catalog_key: "k".into(),
            descriptors: serde_json::json!([1, 2]),
        });
        assert_eq!(
            validate(&bad_variant),
            Err(InvalidRecord::NotAnObject("descriptors"))
        );
    }

    #[test]
    fn prepare_rejects_duplicate_valid_keys() {
        let batch = vec![catalog("a", "A", None), catalog("a", "A2", None)];
        let err = Prepared::new(&batch).err().unwrap();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn prepare_ignores_duplicate_invalid_keys() {
        let batch = vec![catalog("", "A", None), catalog("", "B", None), catalog("c", "C", None)];
        let prepared = Prepared::new(&batch).unwrap();
        assert_eq!(prepared.valid.len(), 1);
        let outcome = prepared.finish(vec![RecordOutcome::Inserted { id: 1 }]);
        assert_eq!(outcome.failed(), 2);
        assert_eq!(outcome.inserted(), 1);
        assert_eq!(outcome.committed_keys(), &["c".to_string()]);
        assert_eq!(outcome.records[2], RecordOutcome::Inserted { id: 1 });
    }
}

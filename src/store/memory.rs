//! In-memory [`CatalogStore`] implementation for tests.
//!
//! Uses `HashMap`s behind a `std::sync::RwLock`. A commit stages its writes
//! against a copy of the tables and swaps them in only on success, which
//! gives the same all-or-nothing behaviour as the SQLite transaction.
//!
//! Faults can be injected to exercise the pipeline's failure handling:
//! [`fail_next_commits`](InMemoryCatalogStore::fail_next_commits) makes
//! commits fail after writing part of the batch, and
//! [`inject_conflict`](InMemoryCatalogStore::inject_conflict) makes inserts
//! of a key hit a uniqueness conflict the lookup phase did not see.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Candidate, RecordKind};

use super::{CatalogStore, CommitError, CommitOutcome, Prepared, RecordOutcome};

#[derive(Clone)]
struct StoredRow {
    id: i64,
    candidate: Candidate,
}

#[derive(Clone, Default)]
struct Tables {
    rows: HashMap<(RecordKind, String), StoredRow>,
    next_id: HashMap<RecordKind, i64>,
}

impl Tables {
    fn allocate_id(&mut self, kind: RecordKind) -> i64 {
        let next = self.next_id.entry(kind).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryCatalogStore {
    tables: RwLock<Tables>,
    failing_commits: AtomicUsize,
    conflicts: Mutex<HashSet<(RecordKind, String)>>,
    commits: AtomicUsize,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a storage error midway through
    /// their writes.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Make any insert of `key` fail with a uniqueness conflict.
    pub fn inject_conflict(&self, kind: RecordKind, key: &str) {
        self.conflicts
            .lock()
            .unwrap()
            .insert((kind, key.to_string()));
    }

    /// Number of commits that reached the write phase and succeeded.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Stored payload for `key`, if any.
    pub fn get(&self, kind: RecordKind, key: &str) -> Option<Candidate> {
        self.tables
            .read()
            .unwrap()
            .rows
            .get(&(kind, key.to_string()))
            .map(|r| r.candidate.clone())
    }

    fn take_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn commit(&self, batch: &[Candidate]) -> Result<CommitOutcome, CommitError> {
        let prepared = Prepared::new(batch)?;
        let fail = self.take_failure();
        let conflicts = self.conflicts.lock().unwrap().clone();

        let mut tables = self.tables.write().unwrap();
        let mut staged = tables.clone();

        // Phase 1: resolve every existing row before any write.
        let existing: Vec<Option<i64>> = prepared
            .valid
            .iter()
            .map(|(_, c)| {
                staged
                    .rows
                    .get(&(c.kind(), c.key().to_string()))
                    .map(|r| r.id)
            })
            .collect();

        // Phase 2: write.
        let mut written = Vec::with_capacity(prepared.valid.len());
        for (n, ((_, candidate), existing)) in prepared.valid.iter().zip(existing).enumerate() {
            if fail && n * 2 >= prepared.valid.len() {
                return Err(CommitError::Storage("injected storage failure".to_string()));
            }
            let slot = (candidate.kind(), candidate.key().to_string());
            match existing {
                Some(id) => {
                    staged.rows.insert(
                        slot,
                        StoredRow {
                            id,
                            candidate: (*candidate).clone(),
                        },
                    );
                    written.push(RecordOutcome::Updated { id });
                }
                None => {
                    if conflicts.contains(&slot) || staged.rows.contains_key(&slot) {
                        return Err(CommitError::InvariantViolation {
                            kind: slot.0,
                            key: slot.1,
                        });
                    }
                    let id = staged.allocate_id(candidate.kind());
                    staged.rows.insert(
                        slot,
                        StoredRow {
                            id,
                            candidate: (*candidate).clone(),
                        },
                    );
                    written.push(RecordOutcome::Inserted { id });
                }
            }
        }

        if fail {
            // Empty or single-record batches still honour the injected fault.
            return Err(CommitError::Storage("injected storage failure".to_string()));
        }

        *tables = staged;
        drop(tables);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(prepared.finish(written))
    }

    async fn lookup_id(&self, kind: RecordKind, key: &str) -> Result<Option<i64>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .rows
            .get(&(kind, key.to_string()))
            .map(|r| r.id))
    }

    async fn count(&self, kind: RecordKind) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .rows
            .keys()
            .filter(|(k, _)| *k == kind)
            .count() as u64)
    }
}

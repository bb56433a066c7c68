//! Pipeline orchestration.
//!
//! ```text
//!  source(movies) ─▶ map ─▶ dedup ─┐
//!  source(series) ─▶ map ─▶ dedup ─┼─▶ BackpressureBuffer ─▶ committer ─▶ CatalogStore
//!  source(live)   ─▶ map ─▶ dedup ─┘          ▲
//!          │                                  │ offer blocks while full
//!          └── every `sampling_interval` items: PressureMonitor::sample()
//! ```
//!
//! One producer task runs per category (at most `stream_count` at once).
//! A single committer drains the buffer in `batch_size` chunks and calls the
//! store, so commits are serialized even though production is parallel.
//!
//! Cancellation is cooperative: producers stop enqueueing as soon as the
//! token fires, and the committer keeps draining until everything already
//! buffered has been committed. No transaction is interrupted.
//!
//! A failing category (source error, panicked producer) is recorded in its
//! report and does not stop the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::buffer::BackpressureBuffer;
use crate::config::{Config, PipelineConfig};
use crate::dedup::dedup_batch;
use crate::models::{Candidate, IngestBatch, RecordKind};
use crate::pressure::{PressureMonitor, ProcessMemoryProbe, ThrottleLevel};
use crate::report::{CategoryReport, RunReport, ThrottleStats};
use crate::source::CatalogSource;
use crate::store::{validate, CatalogStore, CommitError, RecordOutcome};

/// A candidate tagged with the index of the category that produced it.
struct Envelope {
    category: usize,
    candidate: Candidate,
}

/// What a producer task reports back when it finishes.
#[derive(Default)]
struct ProducerOutcome {
    fetched: u64,
    deduped: u64,
    throttle: ThrottleStats,
    error: Option<String>,
    finished_at: Option<Instant>,
}

/// Per-category commit counters kept by the committer.
#[derive(Default, Clone)]
struct CommitTally {
    ingested: u64,
    inserted: u64,
    updated: u64,
    failed_validation: u64,
    failed_other: u64,
    last_commit: Option<Instant>,
}

struct CommitterOutcome {
    tallies: Vec<CommitTally>,
    invariant_violations: u64,
}

pub struct Pipeline {
    store: Arc<dyn CatalogStore>,
    monitor: Arc<PressureMonitor>,
    settings: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        monitor: Arc<PressureMonitor>,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            settings,
        }
    }

    /// Pipeline measuring this process's resident memory against
    /// `pressure.capacity_mb`.
    pub fn from_config(config: &Config, store: Arc<dyn CatalogStore>) -> Self {
        let probe = Arc::new(ProcessMemoryProbe::new(config.pressure.capacity_mb));
        let monitor = PressureMonitor::new(
            probe,
            config.pressure.thresholds,
            config.pressure.delays,
        );
        Self::new(store, Arc::new(monitor), config.pipeline.clone())
    }

    /// Run every source to completion (or cancellation) and report.
    pub async fn run(
        &self,
        sources: Vec<Box<dyn CatalogSource>>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let names: Vec<String> = sources.iter().map(|s| s.category().to_string()).collect();
        info!(%run_id, categories = ?names, "starting ingestion run");

        let buffer = Arc::new(BackpressureBuffer::new(self.settings.buffer_capacity));
        let streams = match self.settings.stream_count {
            0 => names.len().max(1),
            n => n,
        };
        let permits = Arc::new(Semaphore::new(streams));

        let committer = tokio::spawn(
            commit_loop(
                self.store.clone(),
                buffer.clone(),
                self.settings.batch_size,
                names.len(),
                cancel.clone(),
            )
            .instrument(tracing::info_span!("committer", %run_id)),
        );

        let mut producers = Vec::with_capacity(sources.len());
        for (idx, source) in sources.into_iter().enumerate() {
            let span = tracing::info_span!("producer", %run_id, category = %names[idx]);
            let task = produce(
                idx,
                source,
                buffer.clone(),
                self.monitor.clone(),
                permits.clone(),
                self.settings.sampling_interval,
                cancel.clone(),
            );
            producers.push(tokio::spawn(task.instrument(span)));
        }

        let mut outcomes = Vec::with_capacity(producers.len());
        for (idx, handle) in producers.into_iter().enumerate() {
            let outcome = handle.await.unwrap_or_else(|e| {
                error!(category = %names[idx], error = %e, "producer task aborted");
                ProducerOutcome {
                    error: Some(format!("producer task aborted: {}", e)),
                    finished_at: Some(Instant::now()),
                    ..Default::default()
                }
            });
            outcomes.push(outcome);
        }

        // Every producer is done; let the committer drain what is left.
        buffer.close();
        let committed = committer.await.context("commit task aborted")?;

        let mut report = RunReport {
            run_id,
            invariant_violations: committed.invariant_violations,
            cancelled: cancel.is_cancelled(),
            peak_buffer_occupancy: buffer.peak_occupancy(),
            ..Default::default()
        };
        for ((name, produced), tally) in names.into_iter().zip(outcomes).zip(committed.tallies) {
            let finished = [produced.finished_at, tally.last_commit]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(started);
            let mut cat = CategoryReport::new(name);
            cat.counts.ingested = tally.ingested;
            cat.counts.deduped = produced.deduped;
            cat.counts.failed_validation = tally.failed_validation;
            cat.counts.failed_other = tally.failed_other;
            cat.counts.elapsed_ms = millis(finished.duration_since(started));
            cat.inserted = tally.inserted;
            cat.updated = tally.updated;
            cat.fetched = produced.fetched;
            cat.failed = produced.error.is_some();
            cat.error = produced.error;
            cat.throttle = produced.throttle;
            report.categories.push(cat);
        }
        report.total.elapsed_ms = millis(started.elapsed());
        report.aggregate();

        if report.invariant_violations > 0 {
            error!(
                run_id = %report.run_id,
                violations = report.invariant_violations,
                failed_other = report.total.failed_other,
                "ingestion run rejected commits on uniqueness conflicts"
            );
        }
        info!(
            run_id = %report.run_id,
            ingested = report.total.ingested,
            deduped = report.total.deduped,
            failed_validation = report.total.failed_validation,
            failed_other = report.total.failed_other,
            elapsed_ms = report.total.elapsed_ms,
            cancelled = report.cancelled,
            "ingestion run finished"
        );
        Ok(report)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// One category: pull pages, map, dedup per kind, enqueue with throttling.
async fn produce(
    idx: usize,
    mut source: Box<dyn CatalogSource>,
    buffer: Arc<BackpressureBuffer<Envelope>>,
    monitor: Arc<PressureMonitor>,
    permits: Arc<Semaphore>,
    sampling_interval: usize,
    cancel: CancellationToken,
) -> ProducerOutcome {
    let mut outcome = ProducerOutcome::default();

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = permits.acquire_owned() => permit.ok(),
    };
    if permit.is_none() {
        outcome.finished_at = Some(Instant::now());
        return outcome;
    }

    let category = source.category().to_string();
    let sampling_interval = sampling_interval.max(1);
    let mut enqueued: u64 = 0;

    'pages: loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'pages,
            page = source.next_batch() => page,
        };
        let page = match page {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "category source failed");
                outcome.error = Some(format!("{:#}", e));
                break;
            }
        };
        outcome.fetched += page.len() as u64;

        let candidates: Vec<Candidate> = page
            .into_iter()
            .map(|raw| Candidate::from_raw(&category, raw))
            .collect();

        for batch in IngestBatch::partition(candidates) {
            let deduped = dedup_batch(batch);
            outcome.deduped += deduped.removed;

            for candidate in deduped.batch.records {
                if cancel.is_cancelled() {
                    break 'pages;
                }

                if enqueued % sampling_interval as u64 == 0 {
                    let sample = monitor.sample();
                    outcome
                        .throttle
                        .record(sample.level, millis(sample.delay));
                    if sample.level > ThrottleLevel::Normal {
                        debug!(
                            ratio = sample.ratio,
                            level = %sample.level,
                            delay_ms = millis(sample.delay),
                            "throttling producer"
                        );
                        if sample.level == ThrottleLevel::Emergency {
                            monitor.request_reclaim(sample.ratio);
                        }
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'pages,
                            _ = tokio::time::sleep(sample.delay) => {}
                        }
                    }
                }

                let envelope = Envelope {
                    category: idx,
                    candidate,
                };
                let offered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pages,
                    offered = buffer.offer(envelope) => offered,
                };
                if let Err(e) = offered {
                    outcome.error = Some(format!("enqueue failed: {}", e));
                    break 'pages;
                }
                enqueued += 1;
            }
        }
    }

    debug!(
        fetched = outcome.fetched,
        enqueued,
        deduped = outcome.deduped,
        "producer finished"
    );
    outcome.finished_at = Some(Instant::now());
    outcome
}

/// The single committer: drain, split into commit groups, commit, attribute.
async fn commit_loop(
    store: Arc<dyn CatalogStore>,
    buffer: Arc<BackpressureBuffer<Envelope>>,
    batch_size: usize,
    categories: usize,
    cancel: CancellationToken,
) -> CommitterOutcome {
    let mut out = CommitterOutcome {
        tallies: vec![CommitTally::default(); categories],
        invariant_violations: 0,
    };
    let mut announced_cancel = false;

    loop {
        let chunk = buffer.drain(batch_size).await;
        if chunk.is_empty() {
            break;
        }
        for group in commit_groups(chunk) {
            commit_group(store.as_ref(), group, &mut out).await;
        }
        if cancel.is_cancelled() && !announced_cancel {
            announced_cancel = true;
            info!("cancellation requested, committing buffered records before exit");
        }
    }
    out
}

/// Split a drained chunk into consecutive groups in which every
/// `(kind, key)` appears at most once. A repeated key (the same record from
/// a later source page, or from another category) starts the next group, so
/// arrival order is kept and each commit stays free of duplicates.
fn commit_groups(chunk: Vec<Envelope>) -> Vec<Vec<Envelope>> {
    let mut groups: Vec<Vec<Envelope>> = Vec::new();
    let mut current: Vec<Envelope> = Vec::new();
    let mut keys: HashSet<(RecordKind, String)> = HashSet::new();

    for env in chunk {
        let key = env.candidate.key();
        if !key.is_empty() && !keys.insert((env.candidate.kind(), key.to_string())) {
            groups.push(std::mem::take(&mut current));
            keys.clear();
            keys.insert((env.candidate.kind(), key.to_string()));
        }
        current.push(env);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

async fn commit_group(store: &dyn CatalogStore, group: Vec<Envelope>, out: &mut CommitterOutcome) {
    let (owners, batch): (Vec<usize>, Vec<Candidate>) =
        group.into_iter().map(|e| (e.category, e.candidate)).unzip();

    let result = store.commit(&batch).await;
    let now = Instant::now();
    for &owner in &owners {
        out.tallies[owner].last_commit = Some(now);
    }

    match result {
        Ok(outcome) => {
            for (owner, record) in owners.iter().zip(&outcome.records) {
                let tally = &mut out.tallies[*owner];
                match record {
                    RecordOutcome::Inserted { .. } => {
                        tally.ingested += 1;
                        tally.inserted += 1;
                    }
                    RecordOutcome::Updated { .. } => {
                        tally.ingested += 1;
                        tally.updated += 1;
                    }
                    RecordOutcome::Invalid(_) => tally.failed_validation += 1,
                }
            }
            debug!(
                records = batch.len(),
                inserted = outcome.inserted(),
                updated = outcome.updated(),
                failed = outcome.failed(),
                "committed batch"
            );
        }
        Err(e) => {
            // Nothing from the batch was written. Records that would have
            // failed validation still count as such.
            for (owner, candidate) in owners.iter().zip(&batch) {
                let tally = &mut out.tallies[*owner];
                if validate(candidate).is_err() {
                    tally.failed_validation += 1;
                } else {
                    tally.failed_other += 1;
                }
            }
            match &e {
                CommitError::InvariantViolation { .. } => {
                    out.invariant_violations += 1;
                    error!(error = %e, records = batch.len(), "commit rejected, batch not written");
                }
                CommitError::Storage(_) => {
                    error!(error = %e, records = batch.len(), "commit failed, batch rolled back");
                }
            }
        }
    }
}

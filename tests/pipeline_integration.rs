//! Integration tests for the ingestion pipeline.
//!
//! These drive [`Pipeline::run`] end-to-end with in-process sources against
//! both the in-memory store and a real SQLite database, and check the
//! reported counts against what actually landed in the store.

use anyhow::Result;
use async_trait::async_trait;
use catalog_ingest::config::{Config, PipelineConfig, PressureThresholds, ThrottleDelays};
use catalog_ingest::db;
use catalog_ingest::ingest::run_sync_with_sources;
use catalog_ingest::migrate;
use catalog_ingest::models::{catalog_key, RawRecord, RecordKind};
use catalog_ingest::pipeline::Pipeline;
use catalog_ingest::pressure::{FixedProbe, PressureMonitor};
use catalog_ingest::source::{CatalogSource, JsonlFileSource, PagedSource};
use catalog_ingest::store::memory::InMemoryCatalogStore;
use catalog_ingest::store::sqlite::SqliteCatalogStore;
use catalog_ingest::store::CatalogStore;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ─── Helpers ────────────────────────────────────────────────────────

fn movie(title: &str, year: i64) -> RawRecord {
    RawRecord {
        kind: RecordKind::Catalog,
        external_id: title.to_string(),
        title: title.to_string(),
        year: Some(year),
        media_type: "movie".to_string(),
        catalog_key: None,
        metadata: json!({ "genre": "drama" }),
    }
}

fn titles(prefix: &str, n: usize) -> Vec<RawRecord> {
    (0..n).map(|i| movie(&format!("{} {}", prefix, i), 2000)).collect()
}

fn source(category: &str, pages: Vec<Vec<RawRecord>>) -> Box<dyn CatalogSource> {
    Box::new(PagedSource::new(category, pages))
}

fn quiet_monitor() -> Arc<PressureMonitor> {
    Arc::new(PressureMonitor::new(
        Arc::new(FixedProbe::new(0.0)),
        PressureThresholds::default(),
        ThrottleDelays::default(),
    ))
}

fn memory_pipeline(settings: PipelineConfig) -> (Arc<InMemoryCatalogStore>, Pipeline) {
    let store = Arc::new(InMemoryCatalogStore::new());
    let pipeline = Pipeline::new(store.clone(), quiet_monitor(), settings);
    (store, pipeline)
}

/// Source that cancels the run as soon as its second page is requested.
struct CancelAfterFirstPage {
    pages: Vec<Vec<RawRecord>>,
    cancel: CancellationToken,
    calls: usize,
}

#[async_trait]
impl CatalogSource for CancelAfterFirstPage {
    fn category(&self) -> &str {
        "movies"
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        self.calls += 1;
        if self.calls > 1 {
            self.cancel.cancel();
        }
        if self.pages.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.pages.remove(0)))
        }
    }
}

// ─── Concurrency ────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_categories_ingest_everything() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let sources = vec![
        source("movies", vec![titles("Movie", 100)]),
        source("series", vec![titles("Series", 50), titles("Series B", 50)]),
        source("live", vec![titles("Channel", 100)]),
    ];

    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();

    assert_eq!(report.total.ingested, 300);
    assert_eq!(report.total.deduped, 0);
    assert_eq!(report.total.failed_validation, 0);
    assert_eq!(report.total.failed_other, 0);
    for name in ["movies", "series", "live"] {
        let cat = report.category(name).unwrap();
        assert_eq!(cat.counts.ingested, 100, "category {}", name);
        assert_eq!(cat.inserted, 100);
        assert!(!cat.failed);
    }
    assert!(report.is_clean());
    assert!(!report.cancelled);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 300);
}

#[tokio::test]
async fn test_single_stream_runs_categories_in_turn() {
    let settings = PipelineConfig {
        stream_count: 1,
        ..Default::default()
    };
    let (store, pipeline) = memory_pipeline(settings);
    let sources = vec![
        source("movies", vec![titles("Movie", 30)]),
        source("series", vec![titles("Series", 30)]),
        source("live", vec![titles("Channel", 30)]),
    ];

    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();
    assert_eq!(report.total.ingested, 90);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 90);
}

#[tokio::test]
async fn test_buffer_occupancy_never_exceeds_capacity() {
    let settings = PipelineConfig {
        buffer_capacity: 5,
        batch_size: 2,
        ..Default::default()
    };
    let (store, pipeline) = memory_pipeline(settings);
    let sources = vec![
        source("movies", vec![titles("Movie", 100)]),
        source("series", vec![titles("Series", 100)]),
        source("live", vec![titles("Channel", 100)]),
    ];

    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();
    assert_eq!(report.total.ingested, 300);
    assert!(report.peak_buffer_occupancy <= 5);
    assert!(report.peak_buffer_occupancy >= 1);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 300);
}

// ─── Deduplication and validation ───────────────────────────────────

#[tokio::test]
async fn test_duplicates_within_a_page_are_collapsed() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let mut page = titles("Movie", 395);
    for i in 0..5 {
        let mut again = movie(&format!("Movie {}", i), 2000);
        again.metadata = json!({ "genre": "updated" });
        page.push(again);
    }
    assert_eq!(page.len(), 400);

    let report = pipeline
        .run(vec![source("movies", vec![page])], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total.deduped, 5);
    assert_eq!(report.total.ingested, 395);
    assert_eq!(report.invariant_violations, 0);

    let key = catalog_key("movie", "Movie 0", Some(2000));
    let stored = store.get(RecordKind::Catalog, &key).unwrap();
    assert_eq!(
        serde_json::to_value(&stored).unwrap()["metadata"]["genre"],
        "updated",
        "last occurrence wins"
    );
}

#[tokio::test]
async fn test_invalid_records_are_counted_not_fatal() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let mut page = titles("Movie", 8);
    page.push(movie("", 2000));
    page.push(movie("Silent Era", 1500));

    let report = pipeline
        .run(vec![source("movies", vec![page])], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total.ingested, 8);
    assert_eq!(report.total.failed_validation, 2);
    assert_eq!(report.total.failed_other, 0);
    assert!(report.is_clean());
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 8);
}

#[tokio::test]
async fn test_same_key_from_two_categories_is_not_a_conflict() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let sources = vec![
        source("movies", vec![vec![movie("Heat", 1995)]]),
        source("classics", vec![vec![movie("Heat", 1995)]]),
    ];

    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();

    assert_eq!(report.invariant_violations, 0);
    assert_eq!(report.total.ingested, 2);
    assert_eq!(report.total.failed_other, 0);
    let inserted: u64 = report.categories.iter().map(|c| c.inserted).sum();
    let updated: u64 = report.categories.iter().map(|c| c.updated).sum();
    assert_eq!((inserted, updated), (1, 1));
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 1);
}

#[tokio::test]
async fn test_non_utf8_feed_line_is_a_validation_failure() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("movies.jsonl");
    let mut body: Vec<u8> = Vec::new();
    for i in 0..9 {
        if i == 1 {
            body.extend_from_slice(b"{\"external_id\":\"x\",\"title\":\"Caf\xff\",\"year\":2000}\n");
        } else {
            body.extend_from_slice(
                format!("{{\"external_id\":\"{}\",\"title\":\"Movie {}\",\"year\":2000}}\n", i, i).as_bytes(),
            );
        }
    }
    std::fs::write(&path, body).unwrap();

    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let feed: Box<dyn CatalogSource> = Box::new(JsonlFileSource::new("movies", &path, 500));
    let report = pipeline.run(vec![feed], CancellationToken::new()).await.unwrap();

    let movies = report.category("movies").unwrap();
    assert!(!movies.failed, "error: {:?}", movies.error);
    assert_eq!(movies.counts.ingested, 8);
    assert_eq!(movies.counts.failed_validation, 1);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 8);
}

// ─── Failure isolation ──────────────────────────────────────────────

#[tokio::test]
async fn test_failing_category_does_not_stop_others() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let sources: Vec<Box<dyn CatalogSource>> = vec![
        source("movies", vec![titles("Movie", 50)]),
        Box::new(PagedSource::new("series", vec![titles("Series", 10)]).then_fail("upstream timed out")),
        source("live", vec![titles("Channel", 20)]),
    ];

    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();

    let series = report.category("series").unwrap();
    assert!(series.failed);
    assert!(series.error.as_deref().unwrap().contains("upstream timed out"));
    assert_eq!(series.counts.ingested, 10, "pages before the failure are kept");

    assert!(!report.category("movies").unwrap().failed);
    assert_eq!(report.category("movies").unwrap().counts.ingested, 50);
    assert_eq!(report.category("live").unwrap().counts.ingested, 20);
    assert_eq!(report.failed_categories().count(), 1);
    assert!(!report.is_clean());
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 80);
}

#[tokio::test]
async fn test_storage_failure_rolls_back_batch() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    store.fail_next_commits(1);

    let report = pipeline
        .run(vec![source("movies", vec![titles("Movie", 10)])], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.invariant_violations, 0);
    assert!(report.total.failed_other >= 1);
    assert_eq!(report.total.ingested + report.total.failed_other, 10);
    assert_eq!(
        store.count(RecordKind::Catalog).await.unwrap(),
        report.total.ingested
    );
}

#[tokio::test]
async fn test_uniqueness_conflict_is_reported_as_invariant_violation() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let key = catalog_key("movie", "Movie 3", Some(2000));
    store.inject_conflict(RecordKind::Catalog, &key);

    let report = pipeline
        .run(vec![source("movies", vec![titles("Movie", 10)])], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.invariant_violations, 1);
    assert!(report.total.failed_other >= 1);
    assert_eq!(report.total.ingested + report.total.failed_other, 10);
    assert!(store.get(RecordKind::Catalog, &key).is_none());
    assert!(!report.is_clean());
}

// ─── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_before_start_ingests_nothing() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline
        .run(vec![source("movies", vec![titles("Movie", 10)])], cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total.ingested, 0);
    assert_eq!(store.commit_count(), 0);
}

#[tokio::test]
async fn test_cancel_midway_commits_buffered_records() {
    let (store, pipeline) = memory_pipeline(PipelineConfig::default());
    let cancel = CancellationToken::new();
    let src = CancelAfterFirstPage {
        pages: vec![titles("Movie", 25), titles("Movie B", 25)],
        cancel: cancel.clone(),
        calls: 0,
    };

    let report = pipeline.run(vec![Box::new(src)], cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total.ingested, 25);
    assert_eq!(report.total.failed_other, 0);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 25);
}

// ─── Throttling ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_emergency_pressure_throttles_and_requests_reclaim() {
    let reclaims = Arc::new(AtomicUsize::new(0));
    let hook_count = reclaims.clone();
    let delays = ThrottleDelays {
        normal_ms: 0,
        light_ms: 1,
        heavy_ms: 1,
        emergency_ms: 1,
    };
    let monitor = PressureMonitor::new(
        Arc::new(FixedProbe::new(0.9)),
        PressureThresholds::default(),
        delays,
    )
    .with_reclaim_hook(Arc::new(move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    }));

    let store = Arc::new(InMemoryCatalogStore::new());
    let pipeline = Pipeline::new(store.clone(), Arc::new(monitor), PipelineConfig::default());
    let report = pipeline
        .run(vec![source("movies", vec![titles("Movie", 250)])], CancellationToken::new())
        .await
        .unwrap();

    // Samples at 0, 100 and 200 enqueued items.
    assert_eq!(report.throttle.samples, 3);
    assert_eq!(report.throttle.emergency, 3);
    assert_eq!(report.throttle.reclaim_requests, 3);
    assert_eq!(reclaims.load(Ordering::SeqCst), 3);
    assert_eq!(report.total.ingested, 250);
}

#[tokio::test]
async fn test_normal_pressure_adds_no_delay() {
    let (_store, pipeline) = memory_pipeline(PipelineConfig::default());
    let report = pipeline
        .run(vec![source("movies", vec![titles("Movie", 150)])], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.throttle.samples, 2);
    assert_eq!(report.throttle.throttled(), 0);
    assert_eq!(report.throttle.delay_ms, 0);
}

// ─── SQLite ─────────────────────────────────────────────────────────

fn sqlite_config(tmp: &TempDir) -> Config {
    Config::minimal(tmp.path().join("data/catalog.sqlite"))
}

#[tokio::test]
async fn test_sqlite_resync_keeps_identities() {
    let tmp = TempDir::new().unwrap();
    let cfg = sqlite_config(&tmp);

    let first = run_sync_with_sources(
        &cfg,
        vec![source("movies", vec![titles("Movie", 20)])],
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(first.total.ingested, 20);
    assert_eq!(first.category("movies").unwrap().inserted, 20);

    let pool = db::connect(&cfg).await.unwrap();
    let store = SqliteCatalogStore::new(pool.clone());
    let key = catalog_key("movie", "Movie 7", Some(2000));
    let id_before = store.lookup_id(RecordKind::Catalog, &key).await.unwrap();
    assert!(id_before.is_some());

    let mut changed = titles("Movie", 20);
    for r in &mut changed {
        r.metadata = json!({ "genre": "thriller" });
    }
    let second = run_sync_with_sources(
        &cfg,
        vec![source("movies", vec![changed])],
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second.total.ingested, 20);
    assert_eq!(second.category("movies").unwrap().updated, 20);
    assert_eq!(second.category("movies").unwrap().inserted, 0);

    let id_after = store.lookup_id(RecordKind::Catalog, &key).await.unwrap();
    assert_eq!(id_before, id_after);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 20);
    pool.close().await;
}

#[tokio::test]
async fn test_sqlite_source_references_and_variants() {
    let tmp = TempDir::new().unwrap();
    let cfg = sqlite_config(&tmp);
    let owner = catalog_key("movie", "Heat", Some(1995));

    let page = vec![
        movie("Heat", 1995),
        RawRecord {
            kind: RecordKind::Source,
            external_id: "tt0113277".into(),
            catalog_key: Some(owner.clone()),
            media_type: "movie".into(),
            ..Default::default()
        },
        RawRecord {
            kind: RecordKind::Variant,
            external_id: "1080p".into(),
            catalog_key: Some(owner.clone()),
            media_type: "movie".into(),
            metadata: json!({ "resolution": "1920x1080" }),
            ..Default::default()
        },
        RawRecord {
            kind: RecordKind::Source,
            external_id: "orphan".into(),
            media_type: "movie".into(),
            ..Default::default()
        },
    ];

    let report = run_sync_with_sources(
        &cfg,
        vec![source("movies", vec![page])],
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.total.ingested, 3);
    assert_eq!(report.total.failed_validation, 1, "reference without owner");

    let pool = db::connect(&cfg).await.unwrap();
    let store = SqliteCatalogStore::new(pool.clone());
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 1);
    assert_eq!(store.count(RecordKind::Source).await.unwrap(), 1);
    assert_eq!(store.count(RecordKind::Variant).await.unwrap(), 1);
    assert!(store
        .lookup_id(RecordKind::Source, "movies:tt0113277")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .lookup_id(RecordKind::Variant, &format!("{}#1080p", owner))
        .await
        .unwrap()
        .is_some());
    pool.close().await;
}

#[tokio::test]
async fn test_sqlite_concurrent_categories() {
    let tmp = TempDir::new().unwrap();
    let cfg = sqlite_config(&tmp);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = Arc::new(SqliteCatalogStore::new(pool.clone()));
    let pipeline = Pipeline::new(store.clone(), quiet_monitor(), PipelineConfig::default());
    let sources = vec![
        source("movies", vec![titles("Movie", 120)]),
        source("series", vec![titles("Series", 120)]),
        source("live", vec![titles("Channel", 120)]),
    ];
    let report = pipeline.run(sources, CancellationToken::new()).await.unwrap();

    assert_eq!(report.total.ingested, 360);
    assert_eq!(report.invariant_violations, 0);
    assert_eq!(store.count(RecordKind::Catalog).await.unwrap(), 360);
    pool.close().await;
}

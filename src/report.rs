//! Ingestion reports.
//!
//! The only summary a pipeline run exposes: per-category and aggregate
//! counts of ingested, deduplicated and failed records. A run where
//! `ingested` is near zero while `failed_other` is high means commits are
//! being rejected (usually the uniqueness invariant) and must be treated as
//! a regression.

use std::fmt::Write as _;

use serde::Serialize;

use crate::pressure::ThrottleLevel;

/// Counts for one batch, one category, or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub ingested: u64,
    pub deduped: u64,
    pub failed_validation: u64,
    pub failed_other: u64,
    pub elapsed_ms: u64,
}

impl IngestReport {
    /// Add the counters of `other`. `elapsed_ms` is left untouched.
    pub fn absorb(&mut self, other: &IngestReport) {
        self.ingested += other.ingested;
        self.deduped += other.deduped;
        self.failed_validation += other.failed_validation;
        self.failed_other += other.failed_other;
    }
}

/// Throttling applied to one producer during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub samples: u64,
    pub light: u64,
    pub heavy: u64,
    pub emergency: u64,
    pub delay_ms: u64,
    pub reclaim_requests: u64,
}

impl ThrottleStats {
    pub fn record(&mut self, level: ThrottleLevel, delay_ms: u64) {
        self.samples += 1;
        match level {
            ThrottleLevel::Normal => {}
            ThrottleLevel::Light => self.light += 1,
            ThrottleLevel::Heavy => self.heavy += 1,
            ThrottleLevel::Emergency => {
                self.emergency += 1;
                self.reclaim_requests += 1;
            }
        }
        self.delay_ms += delay_ms;
    }

    pub fn throttled(&self) -> u64 {
        self.light + self.heavy + self.emergency
    }

    fn absorb(&mut self, other: &ThrottleStats) {
        self.samples += other.samples;
        self.light += other.light;
        self.heavy += other.heavy;
        self.emergency += other.emergency;
        self.delay_ms += other.delay_ms;
        self.reclaim_requests += other.reclaim_requests;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryReport {
    pub category: String,
    #[serde(flatten)]
    pub counts: IngestReport,
    pub inserted: u64,
    pub updated: u64,
    /// Records pulled from the source before deduplication.
    pub fetched: u64,
    /// The category's source or producer failed; counts reflect whatever was
    /// committed before the failure.
    pub failed: bool,
    pub error: Option<String>,
    pub throttle: ThrottleStats,
}

impl CategoryReport {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub categories: Vec<CategoryReport>,
    pub total: IngestReport,
    pub throttle: ThrottleStats,
    /// Commits rejected because of a uniqueness conflict after deduplication.
    pub invariant_violations: u64,
    pub cancelled: bool,
    pub peak_buffer_occupancy: usize,
}

impl RunReport {
    /// Recompute `total` and `throttle` from the category reports.
    pub fn aggregate(&mut self) {
        let mut total = IngestReport {
            elapsed_ms: self.total.elapsed_ms,
            ..Default::default()
        };
        let mut throttle = ThrottleStats::default();
        for c in &self.categories {
            total.absorb(&c.counts);
            throttle.absorb(&c.throttle);
        }
        self.total = total;
        self.throttle = throttle;
    }

    pub fn category(&self, name: &str) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == name)
    }

    pub fn failed_categories(&self) -> impl Iterator<Item = &CategoryReport> {
        self.categories.iter().filter(|c| c.failed)
    }

    /// `true` when every category finished and no commit hit an invariant
    /// violation.
    pub fn is_clean(&self) -> bool {
        self.invariant_violations == 0 && self.failed_categories().next().is_none()
    }

    /// Human-readable summary, one block per category.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for c in &self.categories {
            let _ = writeln!(out, "sync {}", c.category);
            let _ = writeln!(out, "  fetched: {} records", c.fetched);
            let _ = writeln!(
                out,
                "  ingested: {} ({} inserted, {} updated)",
                c.counts.ingested, c.inserted, c.updated
            );
            let _ = writeln!(out, "  deduped: {}", c.counts.deduped);
            let _ = writeln!(out, "  failed validation: {}", c.counts.failed_validation);
            let _ = writeln!(out, "  failed other: {}", c.counts.failed_other);
            if c.throttle.throttled() > 0 {
                let _ = writeln!(
                    out,
                    "  throttled: {} samples, {} ms delay",
                    c.throttle.throttled(),
                    c.throttle.delay_ms
                );
            }
            let _ = writeln!(out, "  elapsed: {} ms", c.counts.elapsed_ms);
            if let Some(err) = &c.error {
                let _ = writeln!(out, "  error: {}", err);
            }
        }
        let _ = writeln!(out, "total");
        let _ = writeln!(out, "  ingested: {}", self.total.ingested);
        let _ = writeln!(out, "  deduped: {}", self.total.deduped);
        let _ = writeln!(out, "  failed validation: {}", self.total.failed_validation);
        let _ = writeln!(out, "  failed other: {}", self.total.failed_other);
        let _ = writeln!(out, "  elapsed: {} ms", self.total.elapsed_ms);
        if self.invariant_violations > 0 {
            let _ = writeln!(out, "  invariant violations: {}", self.invariant_violations);
        }
        if self.cancelled {
            let _ = writeln!(out, "cancelled");
        } else if self.is_clean() {
            let _ = writeln!(out, "ok");
        } else {
            let _ = writeln!(out, "completed with failures");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(ingested: u64, deduped: u64, fv: u64, fo: u64) -> IngestReport {
        IngestReport {
            ingested,
            deduped,
            failed_validation: fv,
            failed_other: fo,
            elapsed_ms: 5,
        }
    }

    #[test]
    fn aggregate_sums_categories() {
        let mut run = RunReport::default();
        for (name, c) in [("movies", counts(10, 1, 2, 0)), ("live", counts(5, 0, 0, 3))] {
            let mut cat = CategoryReport::new(name);
            cat.counts = c;
            cat.throttle.record(ThrottleLevel::Heavy, 20);
            run.categories.push(cat);
        }
        run.total.elapsed_ms = 42;
        run.aggregate();
        assert_eq!(run.total, counts(15, 1, 2, 3).with_elapsed(42));
        assert_eq!(run.throttle.heavy, 2);
        assert_eq!(run.throttle.delay_ms, 40);
    }

    #[test]
    fn clean_and_failed_runs() {
        let mut run = RunReport::default();
        run.categories.push(CategoryReport::new("movies"));
        assert!(run.is_clean());
        assert!(run.render_text().ends_with("ok\n"));

        let mut failed = CategoryReport::new("series");
        failed.failed = true;
        failed.error = Some("source unavailable".into());
        run.categories.push(failed);
        assert!(!run.is_clean());
        let text = run.render_text();
        assert!(text.contains("error: source unavailable"));
        assert!(text.contains("completed with failures"));
    }

    #[test]
    fn emergency_samples_count_reclaims() {
        let mut t = ThrottleStats::default();
        t.record(ThrottleLevel::Normal, 0);
        t.record(ThrottleLevel::Emergency, 1000);
        assert_eq!(t.samples, 2);
        assert_eq!(t.throttled(), 1);
        assert_eq!(t.reclaim_requests, 1);
    }

    #[test]
    fn category_report_serializes_flat() {
        let mut cat = CategoryReport::new("movies");
        cat.counts.ingested = 3;
        let json = serde_json::to_value(&cat).unwrap();
        assert_eq!(json["ingested"], 3);
        assert_eq!(json["failed_validation"], 0);
        assert_eq!(json["category"], "movies");
    }

    impl IngestReport {
        fn with_elapsed(mut self, ms: u64) -> Self {
            self.elapsed_ms = ms;
            self
        }
    }
}

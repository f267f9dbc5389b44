//! Per-run extraction counters

use std::fmt;

/// Counts and warnings from one derivation run.
///
/// Every non-fatal failure lands here instead of aborting the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Rows selected for single-measurement extraction before the skip filter
    pub rows_considered: usize,
    /// Rows skipped because their run already has metrics
    pub rows_skipped_existing: usize,
    /// Rows whose data loaded and whose extractors ran
    pub rows_processed: usize,
    /// Rows whose data could not be loaded
    pub rows_failed: usize,
    /// Metrics produced by single-measurement extractors
    pub metrics_extracted: usize,
    /// Metrics (single or pairwise) kept with a failed-validation flag
    pub metrics_flagged: usize,
    /// Extractor invocations that errored or panicked
    pub extractor_failures: usize,
    /// Extractor invocations that opted out
    pub extractor_opt_outs: usize,
    /// Adjacent pairs offered to pairwise extractors
    pub pairs_considered: usize,
    /// Pairs rejected by an extractor's gate
    pub pairs_gated_out: usize,
    /// Pairs skipped because the later run already has that extractor's metrics
    pub pairs_skipped_existing: usize,
    /// Pairs whose data failed to load or whose extractor failed
    pub pairs_failed: usize,
    /// Metrics produced by pairwise extractors
    pub pairwise_metrics: usize,
    /// Human-readable warnings, one per failure
    pub warnings: Vec<String>,
}

impl ExtractionSummary {
    /// Total metrics produced.
    #[must_use]
    pub const fn total_metrics(&self) -> usize {
        self.metrics_extracted + self.pairwise_metrics
    }

    /// Whether nothing was attempted.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.rows_processed == 0
            && self.rows_failed == 0
            && self.pairs_considered == 0
    }

    /// First `limit` warnings plus the number left out.
    #[must_use]
    pub fn warnings_preview(&self, limit: usize) -> (&[String], usize) {
        let shown = limit.min(self.warnings.len());
        (&self.warnings[..shown], self.warnings.len() - shown)
    }

    pub(crate) fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

impl fmt::Display for ExtractionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows: {} processed, {} skipped, {} failed; metrics: {} single, {} pairwise, {} flagged; \
             extractor failures: {}; pairs: {} considered, {} failed",
            self.rows_processed,
            self.rows_skipped_existing,
            self.rows_failed,
            self.metrics_extracted,
            self.pairwise_metrics,
            self.metrics_flagged,
            self.extractor_failures,
            self.pairs_considered,
            self.pairs_failed,
        )
    }
}

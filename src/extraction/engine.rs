//! Single-measurement extraction engine
//!
//! One row = one data load + every extractor registered for its procedure.
//! A row never fails as a whole unless its data cannot be loaded; extractor
//! errors and panics only drop that extractor's contribution.

use super::Stamp;
use crate::extractor::ExtractorRegistry;
use crate::manifest::MeasurementRecord;
use crate::metrics::DerivedMetric;
use crate::storage::MeasurementData;
use crate::{Error, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Result of processing one manifest row.
#[derive(Debug, Default)]
pub(crate) struct RowOutcome {
    pub metrics: Vec<DerivedMetric>,
    pub load_failed: bool,
    pub failures: usize,
    pub opt_outs: usize,
    pub flagged: usize,
    pub warnings: Vec<String>,
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "extractor panicked".to_string())
}

/// Run every applicable extractor over one row.
pub(crate) fn extract_row(
    registry: &ExtractorRegistry,
    record: &MeasurementRecord,
    stamp: &Stamp,
) -> RowOutcome {
    let mut outcome = RowOutcome::default();
    let run_id = record.run_id();

    let data = match MeasurementData::load(record.path()) {
        Ok(data) => data,
        Err(e) => {
            warn!(run_id, path = %record.path().display(), error = %e, "Failed to load measurement data");
            outcome.load_failed = true;
            outcome
                .warnings
                .push(format!("{run_id}: failed to load {}: {e}", record.path().display()));
            return outcome;
        }
    };

    for extractor in registry.extractors_for(record.procedure()) {
        let name = extractor.name();
        let result = catch_unwind(AssertUnwindSafe(|| extractor.extract(&data, record)))
            .unwrap_or_else(|payload| {
                Err(Error::extraction(run_id, name, panic_message(payload.as_ref())))
            });

        match result {
            Ok(Some(mut metric)) => {
                metric.stamp(name, &stamp.version, stamp.at);
                if !extractor.validate(&metric) {
                    debug!(run_id, extractor = name, metric = metric.metric_name(), "Metric failed validation");
                    metric.mark_failed_validation();
                    outcome.flagged += 1;
                }
                outcome.metrics.push(metric);
            }
            Ok(None) => {
                debug!(run_id, extractor = name, "Extractor opted out");
                outcome.opt_outs += 1;
            }
            Err(e) => {
                let e = match e {
                    Error::Extraction { .. } => e,
                    other => Error::extraction(run_id, name, other.to_string()),
                };
                warn!(run_id, extractor = name, error = %e, "Extractor failed");
                outcome.failures += 1;
                outcome.warnings.push(e.to_string());
            }
        }
    }

    outcome
}

/// Process rows one after another.
pub(crate) fn run_sequential(
    registry: &ExtractorRegistry,
    rows: &[&MeasurementRecord],
    stamp: &Stamp,
) -> Vec<RowOutcome> {
    rows.iter()
        .map(|record| extract_row(registry, record, stamp))
        .collect()
}

/// Process rows on a dedicated rayon pool of `workers` threads.
///
/// # Errors
/// Returns error if the thread pool cannot be built
#[cfg(feature = "rayon")]
pub(crate) fn run_parallel(
    registry: &ExtractorRegistry,
    rows: &[&MeasurementRecord],
    stamp: &Stamp,
    workers: usize,
) -> Result<Vec<RowOutcome>> {
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("chipmetrics-extract-{i}"))
        .build()
        .map_err(|e| Error::Other(format!("Failed to build worker pool: {e}")))?;

    Ok(pool.install(|| {
        rows.par_iter()
            .map(|record| extract_row(registry, record, stamp))
            .collect()
    }))
}

#[cfg(not(feature = "rayon"))]
pub(crate) fn run_parallel(
    registry: &ExtractorRegistry,
    rows: &[&MeasurementRecord],
    stamp: &Stamp,
    workers: usize,
) -> Result<Vec<RowOutcome>> {
    warn!(workers, "Built without the `rayon` feature; extracting sequentially");
    Ok(run_sequential(registry, rows, stamp))
}

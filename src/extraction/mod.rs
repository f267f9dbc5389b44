//! Manifest-driven metric extraction
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   filter    ┌─────────────────────┐
//! │   Manifest   │────────────►│ single-row engine   │──┐
//! │ (ok/skipped) │             │ (sequential/rayon)  │  │  merge   ┌──────────────┐
//! └──────────────┘             └─────────────────────┘  ├────────►│ MetricsStore │
//!        │                     ┌─────────────────────┐  │          └──────────────┘
//!        └────────────────────►│ pairwise engine     │──┘
//!                              └─────────────────────┘
//! ```
//!
//! Configuration and the extractor registry are injected at construction;
//! nothing is fetched from process-wide state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chipmetrics::config::{DeriveOptions, PipelineConfig};
//! use chipmetrics::extraction::MetricPipeline;
//! use chipmetrics::extractor::ExtractorRegistry;
//!
//! # fn main() -> chipmetrics::Result<()> {
//! let config = PipelineConfig::builder("data/stage/manifest.parquet").build()?;
//! let pipeline = MetricPipeline::new(config, ExtractorRegistry::with_defaults());
//!
//! let outcome = pipeline.derive_all_metrics(&DeriveOptions {
//!     parallel: true,
//!     skip_existing: true,
//!     ..DeriveOptions::default()
//! })?;
//! println!("{} -> {}", outcome.summary, outcome.metrics_path.display());
//! # Ok(())
//! # }
//! ```

mod engine;
mod pairwise;
mod summary;

pub use summary::ExtractionSummary;

use crate::config::{DeriveOptions, PipelineConfig};
use crate::extractor::ExtractorRegistry;
use crate::manifest::{Manifest, MeasurementRecord};
use crate::metrics::{MergeStats, MetricsStore};
use crate::Result;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Version and timestamp shared by every metric of one run.
#[derive(Debug, Clone)]
pub(crate) struct Stamp {
    pub version: String,
    pub at: DateTime<Utc>,
}

/// Result of one derivation run.
#[derive(Debug, Clone)]
pub struct DeriveOutcome {
    /// Location of the metrics store
    pub metrics_path: PathBuf,
    /// Counters and warnings
    pub summary: ExtractionSummary,
    /// What the merge did to the store (all zero when nothing was written)
    pub merge: MergeStats,
}

/// Which engines a run uses.
#[derive(Debug, Clone, Copy)]
struct Engines {
    single: bool,
    pairwise: bool,
}

/// Metric extraction orchestrator.
#[derive(Debug, Clone)]
pub struct MetricPipeline {
    config: PipelineConfig,
    registry: Arc<ExtractorRegistry>,
}

impl MetricPipeline {
    /// Create a pipeline from an explicit config and registry.
    #[must_use]
    pub fn new(config: PipelineConfig, registry: ExtractorRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    /// Pipeline with the built-in extractors.
    #[must_use]
    pub fn with_defaults(config: PipelineConfig) -> Self {
        Self::new(config, ExtractorRegistry::with_defaults())
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extractor registry.
    #[must_use]
    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    /// Load the manifest named by the config.
    ///
    /// # Errors
    /// Returns [`Error::ManifestMissing`](crate::Error::ManifestMissing) if it does not exist
    pub fn load_manifest(&self) -> Result<Manifest> {
        Manifest::load(&self.config.manifest_path, self.config.stage_root())
    }

    /// Run single-measurement (and, unless disabled, pairwise) extraction over
    /// the manifest and merge the results into the metrics store.
    ///
    /// # Errors
    /// Returns error if the manifest is missing, the options are invalid, or the
    /// metrics store cannot be read or written. Per-row failures are reported in
    /// the summary instead.
    pub fn derive_all_metrics(&self, options: &DeriveOptions) -> Result<DeriveOutcome> {
        self.run(
            options,
            Engines {
                single: true,
                pairwise: options.include_pairwise,
            },
        )
    }

    /// Run only the pairwise engine.
    ///
    /// # Errors
    /// Same conditions as [`derive_all_metrics`](Self::derive_all_metrics)
    pub fn derive_pairwise_metrics(&self, options: &DeriveOptions) -> Result<DeriveOutcome> {
        self.run(
            options,
            Engines {
                single: false,
                pairwise: true,
            },
        )
    }

    fn workers(&self, options: &DeriveOptions) -> Result<usize> {
        let workers = options.workers.unwrap_or(self.config.workers);
        if workers == 0 {
            return Err(crate::Error::InvalidInput(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(workers)
    }

    fn run(&self, options: &DeriveOptions, engines: Engines) -> Result<DeriveOutcome> {
        let workers = self.workers(options)?;
        let metrics_path = self.config.metrics_path();
        let manifest = self.load_manifest()?;
        let selected = manifest.filter(&options.procedures, &options.chips);
        if !(options.procedures.is_all() && options.chips.is_all()) {
            info!(
                manifest_rows = manifest.len(),
                selected = selected.len(),
                "Applied procedure/chip filters"
            );
        }

        let mut summary = ExtractionSummary::default();
        let mut single_rows: Vec<&MeasurementRecord> = if engines.single {
            selected
                .iter()
                .copied()
                .filter(|r| !self.registry.extractors_for(r.procedure()).is_empty())
                .collect()
        } else {
            Vec::new()
        };
        let pair_rows: Vec<&MeasurementRecord> = if engines.pairwise {
            selected
                .iter()
                .copied()
                .filter(|r| !self.registry.pairwise_for(r.procedure()).is_empty())
                .collect()
        } else {
            Vec::new()
        };
        summary.rows_considered = single_rows.len();

        if single_rows.is_empty() && pair_rows.len() < 2 {
            info!(
                manifest_rows = manifest.len(),
                selected = selected.len(),
                "No rows to process"
            );
            return Ok(DeriveOutcome {
                metrics_path,
                summary,
                merge: MergeStats::default(),
            });
        }

        let mut store = MetricsStore::load(&metrics_path)?;
        let existing: Option<FxHashSet<(String, String)>> = options.skip_existing.then(|| {
            store
                .run_methods()
                .into_iter()
                .map(|(run, method)| (run.to_string(), method.to_string()))
                .collect()
        });

        if let Some(existing) = &existing {
            let mut methods_by_run: FxHashMap<&str, FxHashSet<&str>> = FxHashMap::default();
            for (run, method) in existing {
                methods_by_run
                    .entry(run.as_str())
                    .or_default()
                    .insert(method.as_str());
            }
            // Only single-run extractors mark a row as done; pairwise metrics
            // stored on the same run_id do not.
            single_rows.retain(|r| {
                let done = methods_by_run.get(r.run_id()).is_some_and(|methods| {
                    self.registry
                        .extractors_for(r.procedure())
                        .iter()
                        .any(|e| methods.contains(e.name()))
                });
                !done
            });
            summary.rows_skipped_existing = summary.rows_considered - single_rows.len();
        }

        let stamp = Stamp {
            version: self.config.extraction_version.clone(),
            at: Utc::now(),
        };
        info!(
            rows = single_rows.len(),
            skipped = summary.rows_skipped_existing,
            pair_candidates = pair_rows.len(),
            parallel = options.parallel,
            workers,
            "Starting metric extraction"
        );

        let row_outcomes = if options.parallel && workers > 1 {
            engine::run_parallel(&self.registry, &single_rows, &stamp, workers)?
        } else {
            engine::run_sequential(&self.registry, &single_rows, &stamp)
        };

        let mut derived = Vec::new();
        for outcome in row_outcomes {
            if outcome.load_failed {
                summary.rows_failed += 1;
            } else {
                summary.rows_processed += 1;
            }
            summary.metrics_extracted += outcome.metrics.len();
            summary.metrics_flagged += outcome.flagged;
            summary.extractor_failures += outcome.failures;
            summary.extractor_opt_outs += outcome.opt_outs;
            outcome.warnings.into_iter().for_each(|w| summary.warn(w));
            derived.extend(outcome.metrics);
        }

        if engines.pairwise {
            let outcome =
                pairwise::extract_pairs(&self.registry, &pair_rows, existing.as_ref(), &stamp);
            summary.pairs_considered = outcome.pairs_considered;
            summary.pairs_gated_out = outcome.pairs_gated_out;
            summary.pairs_skipped_existing = outcome.pairs_skipped_existing;
            summary.pairs_failed = outcome.pairs_failed;
            summary.pairwise_metrics = outcome.metrics.len();
            summary.metrics_flagged += outcome.flagged;
            outcome.warnings.into_iter().for_each(|w| summary.warn(w));
            derived.extend(outcome.metrics);
        }

        let merge = if derived.is_empty() {
            MergeStats::default()
        } else {
            let merge = store.merge(derived);
            store.save(&metrics_path)?;
            merge
        };

        if summary.warnings.is_empty() {
            info!(%summary, "Metric extraction finished");
        } else {
            warn!(%summary, warnings = summary.warnings.len(), "Metric extraction finished with warnings");
        }

        Ok(DeriveOutcome {
            metrics_path,
            summary,
            merge,
        })
    }
}

//! Pairwise extraction engine
//!
//! ```text
//! manifest rows ──► group by (chip, procedure) ──► sort by (time, run_id)
//!                                                        │
//!                     row[0]──row[1]──row[2]── … ──row[n-1]
//!                        └─pair─┘└─pair─┘
//! ```
//!
//! Only index-adjacent rows of one group are ever paired. Each measurement is
//! loaded at most once per group.

use super::engine::panic_message;
use super::Stamp;
use crate::extractor::ExtractorRegistry;
use crate::manifest::{ChipId, MeasurementRecord};
use crate::metrics::DerivedMetric;
use crate::storage::MeasurementData;
use crate::Error;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Aggregated result of the pairwise pass.
#[derive(Debug, Default)]
pub(crate) struct PairwiseOutcome {
    pub metrics: Vec<DerivedMetric>,
    pub pairs_considered: usize,
    pub pairs_gated_out: usize,
    pub pairs_skipped_existing: usize,
    pub pairs_failed: usize,
    pub flagged: usize,
    pub warnings: Vec<String>,
}

/// Group rows with a pairwise extractor by (chip, procedure), each group in time order.
pub(crate) fn group_rows<'a>(
    registry: &ExtractorRegistry,
    rows: &[&'a MeasurementRecord],
) -> BTreeMap<(ChipId, String), Vec<&'a MeasurementRecord>> {
    let mut groups: BTreeMap<(ChipId, String), Vec<&'a MeasurementRecord>> = BTreeMap::new();
    for &record in rows {
        if registry.pairwise_for(record.procedure()).is_empty() {
            continue;
        }
        groups
            .entry((record.chip().clone(), record.procedure().to_string()))
            .or_default()
            .push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            a.acquired_at()
                .cmp(&b.acquired_at())
                .then_with(|| a.run_id().cmp(b.run_id()))
        });
    }
    groups
}

/// Lazily loaded measurement data for one group.
struct GroupData<'a> {
    rows: &'a [&'a MeasurementRecord],
    loaded: Vec<Option<std::result::Result<MeasurementData, String>>>,
}

impl<'a> GroupData<'a> {
    fn new(rows: &'a [&'a MeasurementRecord]) -> Self {
        Self {
            rows,
            loaded: (0..rows.len()).map(|_| None).collect(),
        }
    }

    fn ensure(&mut self, idx: usize) {
        if self.loaded[idx].is_none() {
            let record = self.rows[idx];
            self.loaded[idx] =
                Some(MeasurementData::load(record.path()).map_err(|e| e.to_string()));
        }
    }

    /// Both sides of pair `(idx, idx + 1)`, or the first load error.
    fn pair(&mut self, idx: usize) -> std::result::Result<(&MeasurementData, &MeasurementData), String> {
        self.ensure(idx);
        self.ensure(idx + 1);
        match (&self.loaded[idx], &self.loaded[idx + 1]) {
            (Some(Ok(a)), Some(Ok(b))) => Ok((a, b)),
            (Some(Err(e)), _) | (_, Some(Err(e))) => Err(e.clone()),
            _ => Err("measurement data not loaded".to_string()),
        }
    }
}

/// Run pairwise extractors over every adjacent pair of every group.
///
/// `existing` holds `(run_id, extraction_method)` pairs already stored; a pair
/// whose later run already carries an extractor's metrics is not recomputed
/// for that extractor.
pub(crate) fn extract_pairs(
    registry: &ExtractorRegistry,
    rows: &[&MeasurementRecord],
    existing: Option<&FxHashSet<(String, String)>>,
    stamp: &Stamp,
) -> PairwiseOutcome {
    let mut outcome = PairwiseOutcome::default();

    for ((chip, procedure), group) in &group_rows(registry, rows) {
        if group.len() < 2 {
            continue;
        }
        debug!(chip = %chip, procedure, rows = group.len(), "Pairing group");
        let extractors = registry.pairwise_for(procedure);
        let mut data = GroupData::new(group);

        for (i, pair) in group.windows(2).enumerate() {
            let (first, second) = (pair[0], pair[1]);

            for extractor in extractors {
                let name = extractor.name();
                let already_done = existing.is_some_and(|set| {
                    set.contains(&(second.run_id().to_string(), name.to_string()))
                });
                if already_done {
                    outcome.pairs_skipped_existing += 1;
                    continue;
                }
                if !extractor.should_pair(first, second) {
                    outcome.pairs_gated_out += 1;
                    continue;
                }
                outcome.pairs_considered += 1;

                let (first_data, second_data) = match data.pair(i) {
                    Ok(pair) => pair,
                    Err(message) => {
                        let e = Error::PairLoad {
                            first: first.run_id().to_string(),
                            second: second.run_id().to_string(),
                            message,
                        };
                        warn!(run_id = second.run_id(), extractor = name, error = %e, "Pair skipped");
                        outcome.pairs_failed += 1;
                        outcome.warnings.push(e.to_string());
                        continue;
                    }
                };

                let result = catch_unwind(AssertUnwindSafe(|| {
                    extractor.extract_pairwise((first, first_data), (second, second_data))
                }))
                .unwrap_or_else(|payload| {
                    Err(Error::extraction(second.run_id(), name, panic_message(payload.as_ref())))
                });

                match result {
                    Ok(metrics) => {
                        for mut metric in metrics {
                            metric.stamp(name, &stamp.version, stamp.at);
                            if !extractor.validate(&metric) {
                                metric.mark_failed_validation();
                                outcome.flagged += 1;
                            }
                            outcome.metrics.push(metric);
                        }
                    }
                    Err(e) => {
                        warn!(
                            run_id = second.run_id(),
                            previous = first.run_id(),
                            extractor = name,
                            error = %e,
                            "Pairwise extractor failed"
                        );
                        outcome.pairs_failed += 1;
                        outcome.warnings.push(e.to_string());
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::PairwiseExtractor;
    use crate::Result;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    /// Records every pair it is offered; never loads anything meaningful.
    struct Recorder;

    impl PairwiseExtractor for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn applicable_procedures(&self) -> Vec<String> {
            vec!["IVg".to_string()]
        }

        fn should_pair(&self, _first: &MeasurementRecord, _second: &MeasurementRecord) -> bool {
            true
        }

        fn extract_pairwise(
            &self,
            first: (&MeasurementRecord, &MeasurementData),
            second: (&MeasurementRecord, &MeasurementData),
        ) -> Result<Vec<DerivedMetric>> {
            Ok(vec![DerivedMetric::builder(
                second.0,
                "pair",
                format!("{}->{}", first.0.run_id(), second.0.run_id()),
            )
            .build()])
        }
    }

    fn record(run: &str, procedure: &str, chip: i64, hours: i64) -> MeasurementRecord {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        MeasurementRecord::builder(run, procedure, ChipId::new("A", chip), t0 + Duration::hours(hours), "x")
            .build()
    }

    #[test]
    fn test_group_rows_orders_by_time_and_ignores_unpaired_procedures() {
        let registry = ExtractorRegistry::new().with_pairwise(Arc::new(Recorder));
        let rows = [
            record("c", "IVg", 1, 3),
            record("a", "IVg", 1, 1),
            record("t", "It", 1, 2),
            record("b", "IVg", 2, 0),
        ];
        let refs: Vec<&MeasurementRecord> = rows.iter().collect();
        let groups = group_rows(&registry, &refs);

        assert_eq!(groups.len(), 2);
        let chip1: Vec<&str> = groups[&(ChipId::new("A", 1), "IVg".to_string())]
            .iter()
            .map(|r| r.run_id())
            .collect();
        assert_eq!(chip1, vec!["a", "c"]);
    }

    #[test]
    fn test_unloadable_pair_is_counted_not_fatal() {
        let registry = ExtractorRegistry::new().with_pairwise(Arc::new(Recorder));
        let rows = [record("a", "IVg", 1, 0), record("b", "IVg", 1, 1)];
        let refs: Vec<&MeasurementRecord> = rows.iter().collect();
        let stamp = Stamp {
            version: "v".to_string(),
            at: Utc::now(),
        };

        let outcome = extract_pairs(&registry, &refs, None, &stamp);

        assert_eq!(outcome.pairs_considered, 1);
        assert_eq!(outcome.pairs_failed, 1);
        assert!(outcome.metrics.is_empty());
        assert!(outcome.warnings[0].contains("(a, b)"));
    }

    #[test]
    fn test_existing_pairs_are_skipped() {
        let registry = ExtractorRegistry::new().with_pairwise(Arc::new(Recorder));
        let rows = [record("a", "IVg", 1, 0), record("b", "IVg", 1, 1)];
        let refs: Vec<&MeasurementRecord> = rows.iter().collect();
        let existing = FxHashSet::from_iter([("b".to_string(), "recorder".to_string())]);
        let stamp = Stamp {
            version: "v".to_string(),
            at: Utc::now(),
        };

        let outcome = extract_pairs(&registry, &refs, Some(&existing), &stamp);

        assert_eq!(outcome.pairs_skipped_existing, 1);
        assert_eq!(outcome.pairs_considered, 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Property: only time-adjacent runs within one (chip, procedure) group pair up
            #[test]
            fn prop_pairs_are_group_adjacent(
                rows in proptest::collection::vec((prop::bool::ANY, 1i64..3, 0i64..48), 0..24),
            ) {
                let registry = ExtractorRegistry::new().with_pairwise(Arc::new(Recorder));
                let records: Vec<MeasurementRecord> = rows
                    .iter()
                    .enumerate()
                    .map(|(i, &(sweep, chip, hours))| {
                        record(&format!("r{i:02}"), if sweep { "IVg" } else { "It" }, chip, hours)
                    })
                    .collect();
                let refs: Vec<&MeasurementRecord> = records.iter().collect();
                let groups = group_rows(&registry, &refs);

                let mut adjacent = FxHashSet::default();
                for ((chip, procedure), group) in &groups {
                    prop_assert_eq!(procedure.as_str(), "IVg");
                    for pair in group.windows(2) {
                        prop_assert!(pair[0].acquired_at() <= pair[1].acquired_at());
                        prop_assert_eq!(pair[0].chip(), chip);
                        adjacent.insert(format!("({}, {})", pair[0].run_id(), pair[1].run_id()));
                    }
                }

                let stamp = Stamp {
                    version: "v".to_string(),
                    at: Utc::now(),
                };
                let outcome = extract_pairs(&registry, &refs, None, &stamp);

                prop_assert_eq!(outcome.pairs_considered, adjacent.len());
                prop_assert_eq!(outcome.warnings.len(), adjacent.len());
                for warning in &outcome.warnings {
                    prop_assert!(adjacent.iter().any(|pair| warning.contains(pair.as_str())), "{}", warning);
                }
            }
        }
    }
}

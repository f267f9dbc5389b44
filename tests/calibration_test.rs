//! Calibration matching and history enrichment tests

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chipmetrics::calibration::{
    CalibrationMatcher, CalibrationRecord, MatchStatus, HISTORY_CALIBRATION_COLUMNS,
};
use chipmetrics::config::PipelineConfig;
use chipmetrics::extraction::MetricPipeline;
use chipmetrics::storage::{self, MeasurementData, StorageEngine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
}

fn single_450nm() -> CalibrationMatcher {
    CalibrationMatcher::new(vec![CalibrationRecord::new(
        "cal-450",
        450.0,
        at(10),
        "cal/450.parquet",
    )])
}

// =============================================================================
// Matching
// =============================================================================

#[test]
fn test_reference_scenarios() {
    let matcher = single_450nm();

    let perfect = matcher.find_calibration(at(12), 450.0, 24.0);
    assert_eq!(perfect.status(), MatchStatus::Perfect);
    assert_eq!(perfect.time_delta_hours(), Some(2.0));

    let future = matcher.find_calibration(at(9), 450.0, 24.0);
    assert_eq!(future.status(), MatchStatus::Future);
    assert_eq!(future.time_delta_hours(), Some(-1.0));

    let missing = matcher.find_calibration(at(12), 500.0, 24.0);
    assert_eq!(missing.status(), MatchStatus::Missing);
    assert!(missing.calibration().is_none());

    let stale = matcher.find_calibration(at(10) + Duration::hours(30), 450.0, 24.0);
    assert_eq!(stale.status(), MatchStatus::Stale);
    assert_eq!(stale.time_delta_hours(), Some(30.0));
}

#[test]
fn test_staleness_boundary_inclusive() {
    let matcher = single_450nm();
    let exactly = matcher.find_calibration(at(10) + Duration::hours(6), 450.0, 6.0);
    assert_eq!(exactly.status(), MatchStatus::Perfect);
    let just_over = matcher.find_calibration(
        at(10) + Duration::hours(6) + Duration::milliseconds(1),
        450.0,
        6.0,
    );
    assert_eq!(just_over.status(), MatchStatus::Stale);
}

#[test]
fn test_future_picks_nearest_later_calibration() {
    let matcher = CalibrationMatcher::new(vec![
        CalibrationRecord::new("far", 450.0, at(20), "far"),
        CalibrationRecord::new("near", 450.0, at(14), "near"),
    ]);
    let found = matcher.find_calibration(at(12), 450.0, 24.0);
    assert_eq!(found.status(), MatchStatus::Future);
    assert_eq!(found.calibration().unwrap().run_id(), "near");
    assert_eq!(found.time_delta_hours(), Some(-2.0));
}

#[test]
fn test_wavelength_must_match_exactly() {
    let matcher = single_450nm();
    let near_miss = matcher.find_calibration(at(12), 450.5, 24.0);
    assert_eq!(near_miss.status(), MatchStatus::Missing);
    assert!(near_miss.warning().unwrap().contains("450"));
}

// =============================================================================
// Enrichment
// =============================================================================

fn write(path: &Path, batch: RecordBatch) {
    StorageEngine::new(vec![batch]).write_parquet(path).unwrap();
}

fn write_curve(path: &Path) {
    write(
        path,
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("VL (V)", DataType::Float64, false),
                Field::new("Power (W)", DataType::Float64, false),
            ])),
            vec![
                Arc::new(Float64Array::from(vec![0.0, 1.0, 2.0, 3.0])),
                Arc::new(Float64Array::from(vec![0.0, 1e-3, 4e-3, 9e-3])),
            ],
        )
        .unwrap(),
    );
}

/// History with one dark row, four light rows and a calibration row.
fn write_history(path: &Path) {
    let schema = Schema::new(vec![
        Field::new("run_id", DataType::Utf8, false),
        Field::new("proc", DataType::Utf8, false),
        Field::new("chip_group", DataType::Utf8, false),
        Field::new("chip_number", DataType::Int64, false),
        Field::new("start_time_utc", DataType::Utf8, false),
        Field::new("with_light", DataType::Boolean, true),
        Field::new("wavelength_nm", DataType::Float64, true),
        Field::new("laser_voltage_v", DataType::Float64, true),
    ]);
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec!["dark", "ok", "early", "green", "late", "cal"])),
        Arc::new(StringArray::from(vec!["IVg", "It", "It", "It", "It", "calibration"])),
        Arc::new(StringArray::from(vec!["Alisson"; 6])),
        Arc::new(Int64Array::from(vec![67; 6])),
        Arc::new(StringArray::from(vec![
            "2025-03-01T11:00:00Z",
            "2025-03-01T12:00:00Z",
            "2025-03-01T09:00:00Z",
            "2025-03-01T12:00:00Z",
            "2025-03-02T16:00:00Z",
            "2025-03-01T10:00:00Z",
        ])),
        Arc::new(BooleanArray::from(vec![
            Some(false),
            Some(true),
            Some(true),
            None,
            Some(true),
            Some(true),
        ])),
        Arc::new(Float64Array::from(vec![
            None,
            Some(450.0),
            Some(450.0),
            Some(520.0),
            Some(450.0),
            Some(450.0),
        ])),
        Arc::new(Float64Array::from(vec![
            Some(0.0),
            Some(1.5),
            Some(5.0),
            Some(1.0),
            None,
            Some(1.0),
        ])),
    ];
    write(path, RecordBatch::try_new(Arc::new(schema), columns).unwrap());
}

fn matcher_with_curve(curve: &Path) -> CalibrationMatcher {
    CalibrationMatcher::new(vec![CalibrationRecord::new("cal-450", 450.0, at(10), curve)])
}

#[test]
fn test_enrichment_statuses_and_power() {
    let dir = TempDir::new().unwrap();
    let history = dir.path().join("Alisson67_history.parquet");
    let curve = dir.path().join("cal-450.parquet");
    write_history(&history);
    write_curve(&curve);

    let report = matcher_with_curve(&curve)
        .enrich_chip_history(&history, dir.path().join("enriched"), false, 24.0)
        .unwrap();

    assert_eq!(report.chip, "Alisson67");
    assert_eq!(report.light_experiments, 4);
    assert_eq!(report.perfect, 1);
    assert_eq!(report.future, 1);
    assert_eq!(report.missing, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(report.count(MatchStatus::Stale), 1);
    assert_eq!(report.power_interpolated, 2);
    assert!(report.errors.is_empty());
    // future + missing + stale + late has no drive voltage
    assert_eq!(report.warnings.len(), 4);

    let enriched = MeasurementData::load(&report.output_path).unwrap();
    let power = enriched.column_f64(&["irradiated_power_w"]).unwrap();
    assert!(power[0].is_nan());
    assert!((power[1] - 2.5e-3).abs() < 1e-12);
    // 5 V is past the curve's end: flat extrapolation
    assert!((power[2] - 9e-3).abs() < 1e-12);
    assert!(power[3].is_nan());
    assert!(power[4].is_nan());
    assert!(power[5].is_nan());

    let delta = enriched.column_f64(&["calibration_time_delta_hours"]).unwrap();
    assert!((delta[1] - 2.0).abs() < 1e-9);
    assert!((delta[2] + 1.0).abs() < 1e-9);
    assert!((delta[4] - 30.0).abs() < 1e-9);

    let schema = enriched.batch().schema();
    for column in HISTORY_CALIBRATION_COLUMNS {
        assert!(storage::find_column(&schema, &[column]).is_some());
    }
}

#[test]
fn test_enrichment_never_touches_source() {
    let dir = TempDir::new().unwrap();
    let history = dir.path().join("Alisson67_history.parquet");
    let curve = dir.path().join("cal-450.parquet");
    write_history(&history);
    write_curve(&curve);
    let original = std::fs::read(&history).unwrap();
    let matcher = matcher_with_curve(&curve);

    matcher
        .enrich_chip_history(&history, dir.path().join("enriched"), false, 24.0)
        .unwrap();
    assert_eq!(std::fs::read(&history).unwrap(), original);

    // Failure paths leave it alone too
    assert!(matcher.enrich_chip_history(&history, dir.path(), true, 24.0).is_err());
    assert!(matcher
        .enrich_chip_history(&history, dir.path().join("x"), true, f64::NAN)
        .is_err());
    assert_eq!(std::fs::read(&history).unwrap(), original);
}

#[test]
fn test_enrich_history_without_experiments() {
    let dir = TempDir::new().unwrap();
    let history = dir.path().join("Alisson70_history.parquet");
    let schema = Schema::new(vec![
        Field::new("run_id", DataType::Utf8, false),
        Field::new("start_time_utc", DataType::Utf8, false),
    ]);
    write(&history, RecordBatch::new_empty(Arc::new(schema)));

    let report = single_450nm()
        .enrich_chip_history(&history, dir.path().join("enriched"), false, 24.0)
        .unwrap();

    assert_eq!(report.chip, "Alisson70");
    assert_eq!(report.light_experiments, 0);
    assert_eq!(report.matched(), 0);
    assert!(report.warnings.is_empty());

    let enriched = MeasurementData::load(&report.output_path).unwrap();
    assert_eq!(enriched.num_rows(), 0);
    let schema = enriched.batch().schema();
    assert!(storage::find_column(&schema, &["run_id"]).is_some());
    for column in HISTORY_CALIBRATION_COLUMNS {
        assert!(storage::find_column(&schema, &[column]).is_some());
    }
}

#[test]
fn test_unreadable_calibration_curve_is_reported() {
    let dir = TempDir::new().unwrap();
    let history = dir.path().join("Alisson67_history.parquet");
    write_history(&history);

    let report = matcher_with_curve(&dir.path().join("missing-curve.parquet"))
        .enrich_chip_history(&history, dir.path().join("enriched"), false, 24.0)
        .unwrap();

    assert_eq!(report.matched(), 3);
    assert_eq!(report.power_interpolated, 0);
    // One error per calibration file, not per row
    assert_eq!(report.errors.len(), 1);
}

#[test]
fn test_enrich_many_histories() {
    let dir = TempDir::new().unwrap();
    let curve = dir.path().join("cal-450.parquet");
    write_curve(&curve);
    let a = dir.path().join("Alisson67_history.parquet");
    let b = dir.path().join("Alisson68_history.parquet");
    write_history(&a);
    write_history(&b);
    let broken = dir.path().join("Alisson69_history.parquet");

    let results = matcher_with_curve(&curve).enrich_chip_histories(
        &[a, b, broken],
        dir.path().join("enriched"),
        false,
        24.0,
    );

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(results[2].is_err());
    // Chip identity comes from the chip columns, not the file name
    assert_eq!(results[1].as_ref().unwrap().chip, "Alisson67");
}

// =============================================================================
// Matcher built from a manifest
// =============================================================================

#[test]
fn test_matcher_from_pipeline_manifest() {
    let dir = TempDir::new().unwrap();
    let schema = Schema::new(vec![
        Field::new("run_id", DataType::Utf8, false),
        Field::new("proc", DataType::Utf8, false),
        Field::new("chip_group", DataType::Utf8, false),
        Field::new("chip_number", DataType::Int64, false),
        Field::new("start_time_utc", DataType::Utf8, false),
        Field::new("path", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("wavelength_nm", DataType::Float64, true),
    ]);
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec!["c1", "c2", "m1"])),
        Arc::new(StringArray::from(vec!["LaserCalibration", "LaserCalibration", "It"])),
        Arc::new(StringArray::from(vec!["Laser", "Laser", "Alisson"])),
        Arc::new(Int64Array::from(vec![0, 0, 67])),
        Arc::new(StringArray::from(vec![
            "2025-03-01T08:00:00Z",
            "2025-03-01T09:00:00Z",
            "2025-03-01T12:00:00Z",
        ])),
        Arc::new(StringArray::from(vec!["cal/c1.parquet", "cal/c2.parquet", "raw/m1.parquet"])),
        Arc::new(StringArray::from(vec!["ok", "ok", "ok"])),
        Arc::new(Float64Array::from(vec![Some(450.0), Some(365.0), Some(450.0)])),
    ];
    write(
        &dir.path().join("manifest.parquet"),
        RecordBatch::try_new(Arc::new(schema), columns).unwrap(),
    );

    let config = PipelineConfig::builder(dir.path().join("manifest.parquet"))
        .calibration_procedure("LaserCalibration")
        .build()
        .unwrap();
    let pipeline = MetricPipeline::with_defaults(config.clone());
    let manifest = pipeline.load_manifest().unwrap();
    let matcher = CalibrationMatcher::from_manifest(&manifest, &config.calibration_procedure);

    assert_eq!(matcher.len(), 2);
    assert_eq!(matcher.available_wavelengths(), vec![365.0, 450.0]);
    let found = matcher.find_calibration(at(12), 450.0, config.staleness_threshold_hours);
    assert_eq!(found.status(), MatchStatus::Perfect);
    assert_eq!(found.calibration().unwrap().path(), dir.path().join("cal/c1.parquet"));
}

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use pv_gapfill::{
    DeviceId, EngineConfig, EngineError, ImputationEngine, ImputationModel, ModelError,
    ModelRegistry, Reading, Signal, SqliteStationStore, SqliteStoreFactory, StationStoreFactory,
    StoreConfig, LERP_MODEL, ORIGINAL_TAG, ZERO_FILL_TAG,
};
use tempfile::tempdir;

const DAY: &str = "2024-03-19";
const DAY_START: i64 = 1_710_777_600;

struct Stub {
    name: &'static str,
    fill: f64,
    calls: AtomicUsize,
    last_width: AtomicUsize,
}

impl Stub {
    fn new(name: &'static str, fill: f64) -> Arc<Self> {
        Arc::new(Self {
            name,
            fill,
            calls: AtomicUsize::new(0),
            last_width: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImputationModel for Stub {
    fn name(&self) -> &str {
        self.name
    }

    fn impute(&self, input: &Array3<f64>) -> Result<Array3<f64>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_width.store(input.dim().2, Ordering::SeqCst);
        Ok(input.mapv(|v| if v.is_nan() { self.fill } else { v }))
    }
}

fn engine_with(models: Vec<Arc<dyn ImputationModel>>) -> ImputationEngine {
    ImputationEngine::new(ModelRegistry::from_models(models), EngineConfig::default())
}

fn open(root: &Path) -> SqliteStationStore {
    SqliteStoreFactory::new(StoreConfig {
        data_root: root.to_path_buf(),
    })
    .open("gamma")
    .expect("open store")
}

fn current_at(hour: usize) -> f64 {
    if (6..=18).contains(&hour) {
        2.0 + (hour as f64 - 6.0) * 0.25
    } else {
        0.0
    }
}

fn seed(store: &mut SqliteStationStore, device: &str, intensity: impl Fn(usize) -> Option<f64>) {
    let id = DeviceId::parse(device).expect("device id");
    let rows: Vec<Reading> = (0..24)
        .map(|h| Reading::raw(DAY_START + h as i64 * 3_600, &id, intensity(h), Some(700.0)))
        .collect();
    store.upsert_readings(&rows).expect("seed");
}

fn with_gap(hour: usize) -> Option<f64> {
    if hour == 10 || hour == 11 {
        None
    } else {
        Some(current_at(hour))
    }
}

fn values(series: &[pv_gapfill::SeriesPoint]) -> Vec<f64> {
    series.iter().map(|p| p.value).collect()
}

#[test]
fn unknown_device_gets_a_zero_series() {
    let temp = tempdir().expect("tempdir");
    let store = open(temp.path());
    let engine = engine_with(Vec::new());

    let out = engine
        .interactive()
        .repair(&store, "009-009-009", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].model_name, ZERO_FILL_TAG);
    assert_eq!(out[0].confidence, 0.0);
    assert_eq!(out[0].series.len(), 24);
    assert_eq!(out[0].series[0].date, "2024-03-19 00:00:00");
    assert_eq!(out[0].series[23].date, "2024-03-19 23:00:00");
    assert!(out[0].series.iter().all(|p| p.value == 0.0));

    let err = engine
        .interactive()
        .impute(&store, "not-a-device-id-at-all", DAY, Signal::Intensity)
        .expect_err("malformed id");
    assert!(matches!(err, EngineError::InvalidDeviceId(_)));
}

#[test]
fn complete_day_returns_the_originals() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", |h| Some(current_at(h)));
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    for out in [
        engine.interactive().impute(&store, "001-001-001", DAY, Signal::Intensity),
        engine.interactive().repair(&store, "001-001-001", DAY, Signal::Intensity),
    ] {
        let out = out.expect("request");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].model_name, ORIGINAL_TAG);
        assert_eq!(out[0].confidence, 1.0);
        assert_eq!(values(&out[0].series), (0..24).map(current_at).collect::<Vec<_>>());
    }
    assert_eq!(stub.calls(), 0);
}

#[test]
fn dead_day_is_zero_filled_without_models() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", |_| Some(0.0));
    seed(&mut store, "001-001-002", |h| Some(current_at(h)));
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .repair(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out[0].model_name, ZERO_FILL_TAG);
    assert_eq!(out[0].confidence, 0.0);
    assert!(out[0].series.iter().all(|p| p.value == 0.0));
    assert_eq!(stub.calls(), 0);
}

#[test]
fn repair_uses_the_cohort_model_when_siblings_run() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    seed(&mut store, "001-001-002", |h| Some(current_at(h)));
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .repair(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].model_name, "Stub");
    let series = values(&out[0].series);
    assert_eq!(series[10], 7.5);
    assert_eq!(series[11], 7.5);
    assert_eq!(series[9], current_at(9));
    assert_eq!(stub.calls(), 1);
}

#[test]
fn repair_interpolates_a_lone_device() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .repair(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out[0].model_name, LERP_MODEL);
    let series = values(&out[0].series);
    assert!((series[10] - current_at(10)).abs() < 1e-9);
    assert!((series[11] - current_at(11)).abs() < 1e-9);
    assert_eq!(stub.calls(), 0);
}

#[test]
fn impute_caps_candidates_and_keeps_valid_hours() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    seed(&mut store, "001-001-002", |h| Some(current_at(h)));
    let fourth = Stub::new("D", 0.4);
    let engine = engine_with(vec![
        Stub::new("A", 0.1),
        Stub::new("B", 0.2),
        Stub::new("C", 0.3),
        fourth.clone(),
    ]);

    let out = engine
        .interactive()
        .impute(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("impute");
    let names: Vec<&str> = out.iter().map(|c| c.model_name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    assert_eq!(fourth.calls(), 0);

    for (candidate, fill) in out.iter().zip([0.1, 0.2, 0.3]) {
        let series = values(&candidate.series);
        assert!((series[10] - fill * 15.0).abs() < 1e-9);
        assert_eq!(series[12], current_at(12));
        assert_eq!(candidate.confidence, 1.0);
    }
}

#[test]
fn impute_without_models_falls_back_to_interpolation() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    seed(&mut store, "001-001-002", |h| Some(current_at(h)));
    let engine = engine_with(Vec::new());

    let out = engine
        .interactive()
        .impute(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("impute");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].model_name, LERP_MODEL);
    assert!((out[0].series[11].value - current_at(11)).abs() < 1e-9);
}

#[test]
fn large_inverter_context_is_one_window() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    for s in 1..=25 {
        let device = format!("004-001-{s:03}");
        if s == 21 {
            seed(&mut store, &device, with_gap);
        } else {
            seed(&mut store, &device, |h| Some(current_at(h)));
        }
    }
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .repair(&store, "004-001-021", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out[0].model_name, "Stub");
    assert_eq!(stub.calls(), 1);
    assert_eq!(stub.last_width.load(Ordering::SeqCst), 18);
}

#[test]
fn saved_series_is_rounded_and_read_back() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    let engine = engine_with(Vec::new());
    let imputer = engine.interactive();

    assert_eq!(
        imputer
            .stored_fixed_series(&store, "001-001-001", DAY, Signal::Intensity)
            .expect("read"),
        None
    );

    let mut series: Vec<f64> = (0..24).map(current_at).collect();
    series[10] = 3.14159;
    series[11] = -1.0;
    let updated = imputer
        .save_series(&mut store, "001-001-001", DAY, Signal::Intensity, &series)
        .expect("save");
    assert_eq!(updated, 24);

    let stored = imputer
        .stored_fixed_series(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("read")
        .expect("every hour corrected");
    assert_eq!(stored.len(), 24);
    assert_eq!(stored[10].value, 3.14);
    assert_eq!(stored[11].value, 0.0);
    assert_eq!(stored[10].date, "2024-03-19 10:00:00");

    assert_eq!(
        imputer
            .stored_fixed_series(&store, "001-001-001", DAY, Signal::Voltage)
            .expect("read"),
        None
    );
    assert_eq!(
        imputer
            .stored_fixed_series(&store, "001-001-099", DAY, Signal::Intensity)
            .expect("read"),
        None
    );
}

#[test]
fn save_rejects_malformed_series() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", with_gap);
    let engine = engine_with(Vec::new());
    let imputer = engine.interactive();

    let short = vec![1.0; 23];
    let err = imputer
        .save_series(&mut store, "001-001-001", DAY, Signal::Intensity, &short)
        .expect_err("wrong length");
    assert!(matches!(err, EngineError::InvalidSeries(_)));

    let mut bad = vec![1.0; 24];
    bad[5] = f64::NAN;
    let err = imputer
        .save_series(&mut store, "001-001-001", DAY, Signal::Intensity, &bad)
        .expect_err("non-finite value");
    assert!(matches!(err, EngineError::InvalidSeries(_)));

    let err = imputer
        .save_series(&mut store, "001-001-001", "19-03-2024", Signal::Intensity, &[1.0; 24])
        .expect_err("bad date");
    assert!(matches!(err, EngineError::InvalidDate(_)));
}

#[test]
fn middle_string_of_a_wide_inverter_is_repaired() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    for s in 1..=40 {
        let device = format!("005-001-{s:03}");
        if s == 21 {
            seed(&mut store, &device, with_gap);
        } else {
            seed(&mut store, &device, |h| Some(current_at(h)));
        }
    }
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .repair(&store, "005-001-021", DAY, Signal::Intensity)
        .expect("repair");
    assert_eq!(out[0].model_name, "Stub");
    assert_eq!(values(&out[0].series)[10], 7.5);
    assert_eq!(stub.last_width.load(Ordering::SeqCst), 18);

    let out = engine
        .interactive()
        .impute(&store, "005-001-021", DAY, Signal::Intensity)
        .expect("impute");
    assert_eq!(out.len(), 1);
    assert_eq!(values(&out[0].series)[11], 7.5);
}

#[test]
fn impute_on_a_missing_day_skips_models() {
    let temp = tempdir().expect("tempdir");
    let mut store = open(temp.path());
    seed(&mut store, "001-001-001", |_| None);
    let stub = Stub::new("Stub", 0.5);
    let engine = engine_with(vec![stub.clone()]);

    let out = engine
        .interactive()
        .impute(&store, "001-001-001", DAY, Signal::Intensity)
        .expect("impute");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].model_name, ZERO_FILL_TAG);
    assert_eq!(out[0].confidence, 0.0);
    assert!(out[0].series.iter().all(|p| p.value == 0.0));
    assert_eq!(stub.calls(), 0);
}

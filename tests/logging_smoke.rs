use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use pv_gapfill::{
    log_app_start, log_run_finish, log_run_start, BuiltinModelLoader, DeviceId, EngineConfig,
    ImputationEngine, LinearInterpolation, LoggingConfig, ModelRegistry, Reading,
    SqliteStoreFactory, StationStoreFactory, StoreConfig,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

const DAY: &str = "2024-03-19";
const DAY_START: i64 = 1_710_777_600;

/// Collects formatted log lines; every writer handed out appends to one buffer.
#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    fn contents(&self) -> String {
        let bytes = self.0.lock().expect("log buffer lock");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.contents()
}

fn seed_rows(device: &str, hours: usize) -> Vec<Reading> {
    let id = DeviceId::parse(device).expect("device id");
    (0..hours)
        .map(|h| {
            let intensity = if h == 12 { None } else { Some(3.0) };
            Reading::raw(DAY_START + h as i64 * 3_600, &id, intensity, Some(640.0))
        })
        .collect()
}

#[test]
fn daily_run_emits_station_and_writer_events() {
    let temp = tempdir().expect("tempdir");
    let mut store = SqliteStoreFactory::new(StoreConfig {
        data_root: temp.path().to_path_buf(),
    })
    .open("delta")
    .expect("open store");
    store
        .upsert_readings(&seed_rows("001-001-001", 24))
        .expect("seed complete cohort");
    store
        .upsert_readings(&seed_rows("001-002-001", 20))
        .expect("seed short cohort");

    let engine = ImputationEngine::new(
        ModelRegistry::from_models(vec![Arc::new(LinearInterpolation)]),
        EngineConfig::default(),
    );
    let logs = capture_logs(Level::DEBUG, || {
        let report = engine
            .run_daily_imputation(&mut store, DAY)
            .expect("pipeline should succeed");
        assert_eq!(report.cohorts_skipped, 1);
    });

    assert!(logs.contains("\"event\":\"pipeline.station.start\""));
    assert!(logs.contains("\"event\":\"pipeline.cohort.progress\""));
    assert!(logs.contains("\"event\":\"matrix.batch.shape_rejected\""));
    assert!(logs.contains("\"event\":\"writer.day.committed\""));
    assert!(logs.contains("\"event\":\"pipeline.station.finish\""));
    assert!(logs.contains("\"station\":\"delta\""));
}

#[test]
fn missing_model_artifacts_are_logged() {
    let logs = capture_logs(Level::INFO, || {
        let registry = ModelRegistry::load(
            Path::new("/nonexistent/models"),
            &["SAITS".to_string(), "Lerp".to_string()],
            &BuiltinModelLoader,
        );
        assert_eq!(registry.available_names(), vec!["Lerp".to_string()]);
    });

    assert!(logs.contains("\"event\":\"ensemble.model.unavailable\""));
    assert!(logs.contains("\"model\":\"SAITS\""));
    assert!(logs.contains("\"event\":\"ensemble.model.loaded\""));
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("daily_imputation", &LoggingConfig::default());
        log_run_start(DAY, 3, &["Lerp".to_string()]);
        log_run_finish(DAY, 2, 1, 0);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"event\":\"run.finish\""));
    assert!(logs.contains("\"level\":\"WARN\""));
}

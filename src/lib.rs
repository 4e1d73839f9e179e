//! PV string telemetry gap filling.
//!
//! Current implemented scope:
//! - day windows in station-local time
//! - per-station SQLite telemetry and quality stores
//! - cleaning, cohort batching, model-backed imputation and reconciliation
//! - transactional daily rewrite and the multi-station runner
//! - interactive single-device imputation and quality read models

mod cleaner;
mod config;
mod ensemble;
mod interactive;
mod loader;
mod matrix;
mod observability;
mod overview;
mod pipeline;
mod reconcile;
mod store;
mod telemetry;
mod time_window;
mod writer;

pub use cleaner::{interior_bounds, quality_records, reject_negatives, reject_spikes, CleanedSeries, Cleaner};
pub use config::{
    engine_config_from_env, store_config_from_env, EngineConfig, IrradiancePolicy, SignalLimits,
    StoreConfig, DEFAULT_MAX_BATCH_WIDTH, DEFAULT_MODEL_PRIORITY,
};
pub use ensemble::{
    denormalize, interpolate_series, normalize, run_model, BuiltinModelLoader, Candidate,
    CandidateMean, FillOutcome, FirstAvailable, ImputationEnsemble, ImputationModel,
    LinearInterpolation, ModelError, ModelLoader, ModelRegistry, ModelSlot, Selection,
    SelectionStrategy, LERP_MODEL,
};
pub use interactive::{ImputeCandidate, InteractiveImputer, SeriesPoint, ORIGINAL_TAG, ZERO_FILL_TAG};
pub use loader::{align_irradiance, load_day, load_irradiance, LoadError};
pub use matrix::{
    context_window, group_by_cohort, partition_batches, DeviceGroup, ImputationMatrix, MatrixBatch,
    MatrixBuilder, ShapeError,
};
pub use observability::{
    init_logging, log_app_start, log_run_finish, log_run_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use overview::{
    daily_error_rate, device_quality_history, station_quality_overview, DailyQualityTotal,
    DeviceQualityDay, QualityNode, StationQualityOverview,
};
pub use pipeline::{
    EngineError, ImputationEngine, RunSummary, StationDayReport, StationOutcome, StationRun,
};
pub use reconcile::{apply as reconcile_rows, reconcile_cell};
pub use store::{
    QualityStore, SqliteStationStore, SqliteStoreFactory, StationStoreFactory, StationTables,
    StoreError, TelemetryStore,
};
pub use telemetry::{
    compare_device_ids, sort_device_ids, DeviceId, DeviceIdError, DeviceScope, IrradiancePoint,
    QualityRecord, Reading, Signal, TimeRange, SLOTS_PER_DAY, SLOT_SECONDS,
};
pub use time_window::{
    dates_between, day_window_for, parse_date, resolve_day_window, DayWindow, StationTimezone,
    TimeWindowError,
};
pub use writer::{rows_fingerprint, sort_rows, DayLocks, TransactionalWriter, WriteReport};

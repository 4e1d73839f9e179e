//! Bulk path: clean, batch, fill, reconcile and rewrite one station-day, and
//! the multi-station runner on top of it.

use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cleaner::{quality_records, CleanedSeries, Cleaner};
use crate::config::EngineConfig;
use crate::ensemble::{
    FillOutcome, FirstAvailable, ImputationEnsemble, ModelError, ModelRegistry, SelectionStrategy,
};
use crate::loader::{align_irradiance, load_day, load_irradiance, LoadError};
use crate::matrix::{group_by_cohort, DeviceGroup, MatrixBuilder};
use crate::observability::{log_run_finish, log_run_start};
use crate::reconcile;
use crate::store::{QualityStore, StationStoreFactory, StoreError, TelemetryStore};
use crate::telemetry::{DeviceIdError, IrradiancePoint, QualityRecord, Reading, Signal};
use crate::time_window::{resolve_day_window, DayWindow, TimeWindowError};
use crate::writer::{DayLocks, TransactionalWriter};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidDate(#[from] TimeWindowError),
    #[error(transparent)]
    InvalidDeviceId(#[from] DeviceIdError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("invalid series: {0}")]
    InvalidSeries(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationDayReport {
    pub station: String,
    pub date: String,
    pub day_marker: i64,
    pub rows_loaded: usize,
    pub rows_written: usize,
    pub quality_records: usize,
    pub cohorts: usize,
    /// Cohorts whose time axis was not 24 steps; their rows were kept as loaded.
    pub cohorts_skipped: usize,
    pub matrices_filled: usize,
    pub matrices_unchanged: usize,
    pub matrices_degenerate: usize,
    pub matrices_unfilled: usize,
    pub models_used: BTreeSet<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StationOutcome {
    Completed(StationDayReport),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRun {
    pub station: String,
    pub outcome: StationOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub date: String,
    pub stations: Vec<StationRun>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.stations
            .iter()
            .filter(|run| matches!(run.outcome, StationOutcome::Completed(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.stations.len() - self.succeeded()
    }

    pub fn cohorts_skipped(&self) -> usize {
        self.stations
            .iter()
            .filter_map(|run| match &run.outcome {
                StationOutcome::Completed(report) => Some(report.cohorts_skipped),
                StationOutcome::Failed { .. } => None,
            })
            .sum()
    }

    pub fn outcome(&self, station: &str) -> Option<&StationOutcome> {
        self.stations
            .iter()
            .find(|run| run.station == station)
            .map(|run| &run.outcome)
    }
}

/// Shared, read-only state for one run: loaded models, the selection policy,
/// configuration and the per-day write locks.
pub struct ImputationEngine {
    registry: ModelRegistry,
    strategy: Box<dyn SelectionStrategy>,
    config: EngineConfig,
    locks: DayLocks,
}

impl ImputationEngine {
    pub fn new(registry: ModelRegistry, config: EngineConfig) -> Self {
        Self::with_strategy(registry, Box::new(FirstAvailable), config)
    }

    pub fn with_strategy(
        registry: ModelRegistry,
        strategy: Box<dyn SelectionStrategy>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            strategy,
            config,
            locks: DayLocks::new(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &DayLocks {
        &self.locks
    }

    pub fn ensemble(&self) -> ImputationEnsemble<'_> {
        ImputationEnsemble::new(&self.registry, self.strategy.as_ref())
    }

    /// Reprocesses one station for one local calendar day and rewrites it.
    pub fn run_daily_imputation<S>(&self, store: &mut S, date: &str) -> Result<StationDayReport, EngineError>
    where
        S: TelemetryStore + QualityStore,
    {
        let window = resolve_day_window(date, &self.config.timezone)?;
        let station = store.station().to_string();

        info!(
            component = "pipeline",
            event = "pipeline.station.start",
            station = %station,
            date = %window.date,
            start_ts = window.range.start_ts,
            end_ts = window.range.end_ts
        );

        let rows = load_day(&*store, &window, None)?;
        let irradiance = load_irradiance(&*store, &window);

        let mut report = StationDayReport {
            station: station.clone(),
            date: window.date.to_string(),
            day_marker: window.day_marker(),
            rows_loaded: rows.len(),
            ..StationDayReport::default()
        };

        let groups = group_by_cohort(rows);
        report.cohorts = groups.len();

        let mut output = Vec::with_capacity(report.rows_loaded);
        let mut quality = Vec::new();
        for (position, group) in groups.into_iter().enumerate() {
            debug!(
                component = "pipeline",
                event = "pipeline.cohort.progress",
                station = %station,
                box_id = %group.scope.box_id,
                inverter_id = %group.scope.inverter_id,
                position = position + 1,
                total = report.cohorts
            );
            let (rows, records) =
                self.process_cohort(&station, &window, group, irradiance.as_deref(), &mut report);
            output.extend(rows);
            quality.extend(records);
        }

        let written = TransactionalWriter::new(&self.locks).commit_day(store, &window, output, quality)?;
        report.rows_written = written.rows_written;
        report.quality_records = written.quality_records;
        report.fingerprint = written.fingerprint;

        info!(
            component = "pipeline",
            event = "pipeline.station.finish",
            station = %station,
            date = %window.date,
            rows_written = report.rows_written,
            cohorts = report.cohorts,
            cohorts_skipped = report.cohorts_skipped,
            matrices_filled = report.matrices_filled,
            matrices_unfilled = report.matrices_unfilled
        );
        Ok(report)
    }

    fn process_cohort(
        &self,
        station: &str,
        window: &DayWindow,
        group: DeviceGroup,
        irradiance: Option<&[IrradiancePoint]>,
        report: &mut StationDayReport,
    ) -> (Vec<Reading>, Vec<QualityRecord>) {
        let aligned = irradiance.map(|points| align_irradiance(points, &group.timestamps));
        let clean = |signal: Signal| -> Vec<CleanedSeries> {
            Cleaner::for_signal(&self.config, signal)
                .clean_cohort(&group.columns(signal), aligned.as_deref())
        };
        let intensity = clean(Signal::Intensity);
        let voltage = clean(Signal::Voltage);
        let records = quality_records(window.day_marker(), &group.device_ids, &intensity, &voltage);

        let batches = match MatrixBuilder::new(self.config.max_batch_width).build(&group, &intensity, &voltage) {
            Ok(batches) => batches,
            Err(err) => {
                warn!(
                    component = "pipeline",
                    event = "matrix.batch.shape_rejected",
                    station,
                    date = %window.date,
                    box_id = %err.box_id,
                    inverter_id = %err.inverter_id,
                    time_steps = err.time_steps,
                    devices = group.device_ids.len()
                );
                report.cohorts_skipped += 1;
                return (group.readings, records);
            }
        };

        let ensemble = self.ensemble();
        let mut rows = group.readings;
        for batch in &batches {
            for signal in Signal::ALL {
                let matrix = batch.matrix(signal);
                let outcome = ensemble.fill(matrix, self.config.limits(signal).norm_max);
                match &outcome {
                    FillOutcome::Unchanged => report.matrices_unchanged += 1,
                    FillOutcome::Degenerate(_) => report.matrices_degenerate += 1,
                    FillOutcome::Filled { model, .. } => {
                        report.matrices_filled += 1;
                        report.models_used.insert(model.clone());
                    }
                    FillOutcome::Unavailable => report.matrices_unfilled += 1,
                }
                reconcile::apply(&mut rows, matrix, outcome.filled_values());
            }
        }
        (rows, records)
    }

    /// Runs every station for `date` in parallel, one store handle per worker.
    /// Station failures are recorded in the summary, never raised; only an
    /// unparseable date rejects the whole run.
    pub fn run_for_stations<F>(&self, factory: &F, stations: &[String], date: &str) -> Result<RunSummary, EngineError>
    where
        F: StationStoreFactory,
    {
        let window = resolve_day_window(date, &self.config.timezone)?;
        log_run_start(&window.date.to_string(), stations.len(), &self.registry.available_names());

        let runs: Vec<StationRun> = stations
            .par_iter()
            .map(|station| {
                let result = factory
                    .open(station)
                    .map_err(EngineError::from)
                    .and_then(|mut store| self.run_daily_imputation(&mut store, date));
                let outcome = match result {
                    Ok(report) => StationOutcome::Completed(report),
                    Err(err) => {
                        error!(
                            component = "pipeline",
                            event = "pipeline.station.failed",
                            station = %station,
                            date,
                            error = %err
                        );
                        StationOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                };
                StationRun {
                    station: station.clone(),
                    outcome,
                }
            })
            .collect();

        let summary = RunSummary {
            date: window.date.to_string(),
            stations: runs,
        };
        log_run_finish(
            &summary.date,
            summary.succeeded(),
            summary.failed(),
            summary.cohorts_skipped(),
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(station: &str, skipped: usize) -> StationRun {
        StationRun {
            station: station.to_string(),
            outcome: StationOutcome::Completed(StationDayReport {
                station: station.to_string(),
                cohorts_skipped: skipped,
                ..StationDayReport::default()
            }),
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let summary = RunSummary {
            date: "2024-03-19".to_string(),
            stations: vec![
                completed("alpha", 2),
                StationRun {
                    station: "beta".to_string(),
                    outcome: StationOutcome::Failed {
                        error: "disk full".to_string(),
                    },
                },
                completed("gamma", 1),
            ],
        };

        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.cohorts_skipped(), 3);
        assert!(summary.outcome("delta").is_none());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let failed = serde_json::to_value(StationOutcome::Failed {
            error: "locked".to_string(),
        })
        .unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["error"], "locked");

        let done = serde_json::to_value(completed("alpha", 0).outcome).unwrap();
        assert_eq!(done["status"], "completed");
        assert_eq!(done["station"], "alpha");
    }
}

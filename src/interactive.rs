//! On-demand gap filling for one device, one day, one signal.
//!
//! Unlike the bulk path, the sibling context is a single window of at most
//! `max_batch_width` devices anchored on the target (see
//! [`context_window`](crate::matrix::context_window)), so some siblings of a
//! large inverter never appear in a given request.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cleaner::{CleanedSeries, Cleaner};
use crate::ensemble::{interpolate_series, FillOutcome, LERP_MODEL};
use crate::loader::{align_irradiance, load_day, load_irradiance};
use crate::matrix::{context_window, ImputationMatrix};
use crate::pipeline::{EngineError, ImputationEngine};
use crate::store::TelemetryStore;
use crate::telemetry::{DeviceId, Reading, Signal, SLOTS_PER_DAY};
use crate::time_window::resolve_day_window;

pub const ORIGINAL_TAG: &str = "original";
pub const ZERO_FILL_TAG: &str = "zero_fill";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Local wall-clock `YYYY-MM-DD HH:MM:SS`.
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputeCandidate {
    pub model_name: String,
    pub confidence: f64,
    pub series: Vec<SeriesPoint>,
}

/// The target and its cleaned sibling window over the day's slot grid.
struct TargetContext {
    labels: Vec<String>,
    matrix: ImputationMatrix,
    target: CleanedSeries,
    target_col: usize,
    usable_cohort: bool,
}

pub struct InteractiveImputer<'e> {
    engine: &'e ImputationEngine,
}

impl ImputationEngine {
    pub fn interactive(&self) -> InteractiveImputer<'_> {
        InteractiveImputer { engine: self }
    }
}

impl<'e> InteractiveImputer<'e> {
    /// Up to `max_candidates` reconstructions, one per available model.
    pub fn impute<S: TelemetryStore + ?Sized>(
        &self,
        store: &S,
        device_id: &str,
        date: &str,
        signal: Signal,
    ) -> Result<Vec<ImputeCandidate>, EngineError> {
        let Some(ctx) = self.prepare(store, device_id, date, signal)? else {
            return Ok(vec![self.no_data(date)?]);
        };
        if ctx.target.is_degenerate() {
            return Ok(vec![zero_fill(&ctx)]);
        }
        if !ctx.target.has_missing() {
            return Ok(vec![original(&ctx)]);
        }

        let config = self.engine.config();
        let candidates = self.engine.ensemble().candidates(
            &ctx.matrix,
            config.limits(signal).norm_max,
            config.max_candidates,
        );
        if candidates.is_empty() {
            return Ok(vec![lerp(&ctx)]);
        }

        info!(
            component = "interactive",
            event = "interactive.impute.candidates",
            station = store.station(),
            device_id,
            date,
            signal = signal.as_str(),
            candidates = candidates.len()
        );
        Ok(candidates
            .into_iter()
            .map(|candidate| {
                let column: Vec<f64> = candidate.values.column(ctx.target_col).to_vec();
                ImputeCandidate {
                    model_name: candidate.model,
                    confidence: 1.0,
                    series: merge_series(&ctx, &column),
                }
            })
            .collect())
    }

    /// Exactly one series: the originals, a zero fill for a dead day, the
    /// selected model when siblings can help, or single-device interpolation.
    pub fn repair<S: TelemetryStore + ?Sized>(
        &self,
        store: &S,
        device_id: &str,
        date: &str,
        signal: Signal,
    ) -> Result<Vec<ImputeCandidate>, EngineError> {
        let Some(ctx) = self.prepare(store, device_id, date, signal)? else {
            return Ok(vec![self.no_data(date)?]);
        };
        if ctx.target.is_degenerate() {
            return Ok(vec![zero_fill(&ctx)]);
        }
        if !ctx.target.has_missing() {
            return Ok(vec![original(&ctx)]);
        }

        if ctx.usable_cohort {
            let norm_max = self.engine.config().limits(signal).norm_max;
            if let FillOutcome::Filled { model, values } = self.engine.ensemble().fill(&ctx.matrix, norm_max) {
                let column: Vec<f64> = values.column(ctx.target_col).to_vec();
                return Ok(vec![ImputeCandidate {
                    model_name: model,
                    confidence: 1.0,
                    series: merge_series(&ctx, &column),
                }]);
            }
        }

        debug!(
            component = "interactive",
            event = "interactive.repair.lerp",
            station = store.station(),
            device_id,
            date,
            usable_cohort = ctx.usable_cohort
        );
        Ok(vec![lerp(&ctx)])
    }

    /// Writes a chosen 24-hour series into `fixed_*` of the device's existing
    /// rows, rounded to two decimals and clamped at zero. Returns rows updated.
    pub fn save_series<S: TelemetryStore + ?Sized>(
        &self,
        store: &mut S,
        device_id: &str,
        date: &str,
        signal: Signal,
        values: &[f64],
    ) -> Result<usize, EngineError> {
        DeviceId::parse(device_id)?;
        let window = resolve_day_window(date, &self.engine.config().timezone)?;
        if values.len() != SLOTS_PER_DAY {
            return Err(EngineError::InvalidSeries(format!(
                "expected {SLOTS_PER_DAY} values, got {}",
                values.len()
            )));
        }
        if let Some(bad) = values.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::InvalidSeries(format!("value at hour {bad} is not finite")));
        }

        let updates: Vec<(i64, f64)> = window
            .slots
            .iter()
            .zip(values)
            .map(|(ts, v)| (*ts, round_cents(v.max(0.0))))
            .collect();

        let station = store.station().to_string();
        let updated = self
            .engine
            .locks()
            .with_day(&station, window.day_marker(), || store.update_fixed(device_id, signal, &updates))?;

        info!(
            component = "interactive",
            event = "interactive.series.saved",
            station = %station,
            device_id,
            date = %window.date,
            signal = signal.as_str(),
            updated
        );
        Ok(updated)
    }

    /// The stored corrected series, only when every row of the day has one.
    pub fn stored_fixed_series<S: TelemetryStore + ?Sized>(
        &self,
        store: &S,
        device_id: &str,
        date: &str,
        signal: Signal,
    ) -> Result<Option<Vec<SeriesPoint>>, EngineError> {
        let id = DeviceId::parse(device_id)?;
        let tz = &self.engine.config().timezone;
        let window = resolve_day_window(date, tz)?;

        let mut rows: Vec<Reading> = load_day(store, &window, Some(&id.scope()))?
            .into_iter()
            .filter(|row| row.device_id == device_id)
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by_key(|row| row.timestamp);

        Ok(rows
            .iter()
            .map(|row| {
                row.fixed(signal).map(|value| SeriesPoint {
                    date: tz.local_label(row.timestamp),
                    value,
                })
            })
            .collect::<Option<Vec<_>>>())
    }

    fn prepare<S: TelemetryStore + ?Sized>(
        &self,
        store: &S,
        device_id: &str,
        date: &str,
        signal: Signal,
    ) -> Result<Option<TargetContext>, EngineError> {
        let id = DeviceId::parse(device_id)?;
        let config = self.engine.config();
        let window = resolve_day_window(date, &config.timezone)?;
        let rows = load_day(store, &window, Some(&id.scope()))?;

        let mut cohort: Vec<String> = rows.iter().map(|row| row.device_id.clone()).collect();
        cohort.sort_unstable();
        cohort.dedup();
        let Some(rank) = cohort.iter().position(|d| d == device_id) else {
            return Ok(None);
        };

        let range = context_window(cohort.len(), rank, config.max_batch_width);
        let target_col = rank - range.start;
        let device_ids = cohort[range].to_vec();

        let mut columns = vec![vec![None; window.slots.len()]; device_ids.len()];
        for row in &rows {
            let (Some(col), Some(slot)) = (
                device_ids.iter().position(|d| *d == row.device_id),
                window.slot_index(row.timestamp),
            ) else {
                continue;
            };
            columns[col][slot] = row.value(signal);
        }

        let irradiance = load_irradiance(store, &window).map(|points| align_irradiance(&points, &window.slots));
        let mut cleaned = Cleaner::for_signal(config, signal).clean_cohort(&columns, irradiance.as_deref());

        let usable_cohort = cleaned
            .iter()
            .enumerate()
            .any(|(col, series)| col != target_col && !series.is_degenerate());

        let matrix = {
            let refs: Vec<&[f64]> = cleaned.iter().map(|s| s.values.as_slice()).collect();
            ImputationMatrix::from_columns(signal, device_ids, window.slots.clone(), &refs)
        };
        let target = cleaned.swap_remove(target_col);
        let labels = window
            .slots
            .iter()
            .map(|ts| config.timezone.local_label(*ts))
            .collect();

        Ok(Some(TargetContext {
            labels,
            matrix,
            target,
            target_col,
            usable_cohort,
        }))
    }

    fn no_data(&self, date: &str) -> Result<ImputeCandidate, EngineError> {
        let tz = &self.engine.config().timezone;
        let window = resolve_day_window(date, tz)?;
        Ok(ImputeCandidate {
            model_name: ZERO_FILL_TAG.to_string(),
            confidence: 0.0,
            series: window
                .slots
                .iter()
                .map(|ts| SeriesPoint {
                    date: tz.local_label(*ts),
                    value: 0.0,
                })
                .collect(),
        })
    }
}

fn original(ctx: &TargetContext) -> ImputeCandidate {
    ImputeCandidate {
        model_name: ORIGINAL_TAG.to_string(),
        confidence: 1.0,
        series: points(ctx, ctx.target.values.iter().copied()),
    }
}

fn zero_fill(ctx: &TargetContext) -> ImputeCandidate {
    ImputeCandidate {
        model_name: ZERO_FILL_TAG.to_string(),
        confidence: 0.0,
        series: points(ctx, ctx.target.values.iter().copied()),
    }
}

fn lerp(ctx: &TargetContext) -> ImputeCandidate {
    ImputeCandidate {
        model_name: LERP_MODEL.to_string(),
        confidence: 1.0,
        series: points(ctx, interpolate_series(&ctx.target.values).into_iter()),
    }
}

/// Valid originals, model values at the gaps.
fn merge_series(ctx: &TargetContext, model_column: &[f64]) -> Vec<SeriesPoint> {
    let merged = ctx
        .target
        .values
        .iter()
        .zip(model_column)
        .map(|(original, filled)| if original.is_nan() { *filled } else { *original });
    points(ctx, merged)
}

/// Gaps a model could not fill render as zero; nothing goes below zero.
fn points(ctx: &TargetContext, values: impl Iterator<Item = f64>) -> Vec<SeriesPoint> {
    ctx.labels
        .iter()
        .zip(values)
        .map(|(label, value)| SeriesPoint {
            date: label.clone(),
            value: if value.is_nan() { 0.0 } else { value.max(0.0) },
        })
        .collect()
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

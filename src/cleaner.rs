//! Per-cohort cleaning of one signal and the daily quality counters it yields.
//!
//! Missing cells are `f64::NAN` from here on. Cleaning runs in three passes
//! over every column of a sibling cohort:
//!
//! 1. negative values become missing (error),
//! 2. bidirectional spikes become missing (error),
//! 3. interior zeros become missing when corroborated (missing).
//!
//! Pass 3 judges siblings on their pass-2 values, so the order columns are
//! processed in never changes the outcome.

use crate::config::{EngineConfig, IrradiancePolicy, SignalLimits};
use crate::telemetry::{QualityRecord, Signal, SLOTS_PER_DAY};

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedSeries {
    pub values: Vec<f64>,
    /// Negatives and spikes.
    pub error_count: u32,
    /// Raw gaps plus confirmed interior zeros.
    pub missing_count: u32,
}

impl CleanedSeries {
    pub fn has_missing(&self) -> bool {
        self.values.iter().any(|v| v.is_nan())
    }

    /// No non-zero valid value anywhere in the day.
    pub fn is_degenerate(&self) -> bool {
        !self.values.iter().any(|v| is_running(*v))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Cleaner {
    limits: SignalLimits,
    policy: IrradiancePolicy,
}

impl Cleaner {
    pub fn new(limits: SignalLimits, policy: IrradiancePolicy) -> Self {
        Self { limits, policy }
    }

    pub fn for_signal(config: &EngineConfig, signal: Signal) -> Self {
        Self::new(config.limits(signal), config.irradiance_policy)
    }

    /// Cleans every column of one cohort. `irradiance` is `None` when the
    /// station has no irradiance signal for the day; otherwise it is aligned
    /// with the columns, `None` cells meaning no point at that timestamp.
    pub fn clean_cohort(
        &self,
        columns: &[Vec<Option<f64>>],
        irradiance: Option<&[Option<f64>]>,
    ) -> Vec<CleanedSeries> {
        let mut staged: Vec<(Vec<f64>, u32, u32)> = columns
            .iter()
            .map(|column| {
                let mut values: Vec<f64> =
                    column.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                let gaps = count_missing(&values);
                let negatives = reject_negatives(&mut values);
                let spikes = reject_spikes(&mut values, self.limits.spike_threshold);
                (values, negatives + spikes, gaps)
            })
            .collect();

        let snapshot: Vec<Vec<f64>> = staged.iter().map(|(values, _, _)| values.clone()).collect();

        for (col, (values, _, missing)) in staged.iter_mut().enumerate() {
            let Some((first, last)) = interior_bounds(values) else {
                continue;
            };
            for row in (first + 1)..last {
                if values[row] != 0.0 {
                    continue;
                }
                if self.corroborated(&snapshot, col, row, irradiance) {
                    values[row] = f64::NAN;
                    *missing += 1;
                }
            }
        }

        staged
            .into_iter()
            .map(|(values, errors, missing)| CleanedSeries {
                values,
                error_count: clamp_count(errors),
                missing_count: clamp_count(missing),
            })
            .collect()
    }

    /// A sibling is running at `row` and the sun is up (or not measured).
    fn corroborated(
        &self,
        snapshot: &[Vec<f64>],
        col: usize,
        row: usize,
        irradiance: Option<&[Option<f64>]>,
    ) -> bool {
        let sibling_running = snapshot
            .iter()
            .enumerate()
            .any(|(other, values)| other != col && values.get(row).is_some_and(|v| is_running(*v)));
        if !sibling_running {
            return false;
        }

        match irradiance {
            Some(series) => matches!(series.get(row), Some(Some(value)) if *value != 0.0),
            None => self.policy == IrradiancePolicy::SiblingsSufficient,
        }
    }
}

/// Negative readings become missing; returns how many were rejected.
pub fn reject_negatives(values: &mut [f64]) -> u32 {
    let mut rejected = 0;
    for v in values.iter_mut() {
        if *v < 0.0 {
            *v = f64::NAN;
            rejected += 1;
        }
    }
    rejected
}

/// Flags points that jump past `threshold` against both neighbours in the
/// same direction. Edges have only one neighbour and are never flagged;
/// comparisons against a missing neighbour are false.
pub fn reject_spikes(values: &mut [f64], threshold: f64) -> u32 {
    if values.len() < 3 {
        return 0;
    }

    let flagged: Vec<usize> = (1..values.len() - 1)
        .filter(|&i| {
            let diff_prev = values[i] - values[i - 1];
            let diff_next = values[i] - values[i + 1];
            (diff_prev > threshold && diff_next > threshold)
                || (diff_prev < -threshold && diff_next < -threshold)
        })
        .collect();

    for &i in &flagged {
        values[i] = f64::NAN;
    }
    flagged.len() as u32
}

/// Indices of the first and last running value, when at least two exist.
pub fn interior_bounds(values: &[f64]) -> Option<(usize, usize)> {
    let first = values.iter().position(|v| is_running(*v))?;
    let last = values.iter().rposition(|v| is_running(*v))?;
    (last > first).then_some((first, last))
}

pub fn quality_records(
    day_marker: i64,
    device_ids: &[String],
    intensity: &[CleanedSeries],
    voltage: &[CleanedSeries],
) -> Vec<QualityRecord> {
    device_ids
        .iter()
        .zip(intensity.iter().zip(voltage.iter()))
        .map(|(device_id, (current, volt))| QualityRecord {
            day_marker,
            device_id: device_id.clone(),
            error_count_intensity: current.error_count,
            missing_count_intensity: current.missing_count,
            error_count_voltage: volt.error_count,
            missing_count_voltage: volt.missing_count,
        })
        .collect()
}

fn is_running(v: f64) -> bool {
    !v.is_nan() && v != 0.0
}

fn count_missing(values: &[f64]) -> u32 {
    values.iter().filter(|v| v.is_nan()).count() as u32
}

fn clamp_count(count: u32) -> u32 {
    count.min(SLOTS_PER_DAY as u32)
}

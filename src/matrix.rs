//! Sibling cohorts, model-sized batches and the `(time, device)` matrices
//! handed to the imputation models.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use ndarray::Array2;
use thiserror::Error;

use crate::cleaner::CleanedSeries;
use crate::telemetry::{DeviceScope, Reading, Signal, SLOTS_PER_DAY};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cohort {box_id}-{inverter_id} has {time_steps} time steps, expected 24")]
pub struct ShapeError {
    pub box_id: String,
    pub inverter_id: String,
    pub time_steps: usize,
}

/// All rows of one `(box_id, inverter_id)` cohort for one day.
#[derive(Debug, Clone)]
pub struct DeviceGroup {
    pub scope: DeviceScope,
    /// Plain string order, so `1-1-10` precedes `1-1-9`.
    pub device_ids: Vec<String>,
    /// Distinct timestamps present in the cohort, ascending.
    pub timestamps: Vec<i64>,
    pub readings: Vec<Reading>,
}

impl DeviceGroup {
    fn new(scope: DeviceScope, readings: Vec<Reading>) -> Self {
        let mut device_ids: Vec<String> = readings.iter().map(|r| r.device_id.clone()).collect();
        device_ids.sort_unstable();
        device_ids.dedup();

        let mut timestamps: Vec<i64> = readings.iter().map(|r| r.timestamp).collect();
        timestamps.sort_unstable();
        timestamps.dedup();

        Self {
            scope,
            device_ids,
            timestamps,
            readings,
        }
    }

    pub fn check_shape(&self) -> Result<(), ShapeError> {
        if self.timestamps.len() == SLOTS_PER_DAY {
            Ok(())
        } else {
            Err(ShapeError {
                box_id: self.scope.box_id.clone(),
                inverter_id: self.scope.inverter_id.clone(),
                time_steps: self.timestamps.len(),
            })
        }
    }

    /// One column per device (in `device_ids` order) over `timestamps`;
    /// absent rows and null readings are both `None`.
    pub fn columns(&self, signal: Signal) -> Vec<Vec<Option<f64>>> {
        let col_of: HashMap<&str, usize> = self
            .device_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut columns = vec![vec![None; self.timestamps.len()]; self.device_ids.len()];
        for reading in &self.readings {
            let (Some(&col), Ok(row)) = (
                col_of.get(reading.device_id.as_str()),
                self.timestamps.binary_search(&reading.timestamp),
            ) else {
                continue;
            };
            columns[col][row] = reading.value(signal);
        }
        columns
    }
}

/// Splits rows into cohorts, ordered by `(box_id, inverter_id)`.
pub fn group_by_cohort(rows: Vec<Reading>) -> Vec<DeviceGroup> {
    let mut cohorts: BTreeMap<DeviceScope, Vec<Reading>> = BTreeMap::new();
    for row in rows {
        cohorts.entry(row.scope()).or_default().push(row);
    }
    cohorts
        .into_iter()
        .map(|(scope, readings)| DeviceGroup::new(scope, readings))
        .collect()
}

/// Bulk policy: consecutive disjoint batches of at most `max_width` that
/// cover every device once. 23 devices at width 18 give `0..18` and `18..23`.
pub fn partition_batches(device_count: usize, max_width: usize) -> Vec<Range<usize>> {
    let width = max_width.max(1);
    (0..device_count)
        .step_by(width)
        .map(|start| start..(start + width).min(device_count))
        .collect()
}

/// Interactive policy: one window of at most `max_width` that always holds the
/// target. Small cohorts are used whole. Otherwise the front window when the
/// target ranks inside it, the back window when it ranks inside that, else
/// the full-width bulk batch containing it.
pub fn context_window(device_count: usize, target_rank: usize, max_width: usize) -> Range<usize> {
    let width = max_width.max(1);
    if device_count <= width || target_rank < width {
        0..device_count.min(width)
    } else if target_rank >= device_count - width {
        (device_count - width)..device_count
    } else {
        let start = (target_rank / width) * width;
        start..start + width
    }
}

/// One signal for one batch: rows are timestamps, columns devices.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputationMatrix {
    pub signal: Signal,
    pub device_ids: Vec<String>,
    pub timestamps: Vec<i64>,
    pub values: Array2<f64>,
}

impl ImputationMatrix {
    pub fn from_columns(
        signal: Signal,
        device_ids: Vec<String>,
        timestamps: Vec<i64>,
        columns: &[&[f64]],
    ) -> Self {
        let rows = timestamps.len();
        let values = Array2::from_shape_fn((rows, columns.len()), |(t, d)| {
            columns[d].get(t).copied().unwrap_or(f64::NAN)
        });
        Self {
            signal,
            device_ids,
            timestamps,
            values,
        }
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn missing_cells(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_cells() == 0
    }

    pub fn is_all_missing(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBatch {
    pub device_ids: Vec<String>,
    pub intensity: ImputationMatrix,
    pub voltage: ImputationMatrix,
}

impl MatrixBatch {
    pub fn matrix(&self, signal: Signal) -> &ImputationMatrix {
        match signal {
            Signal::Intensity => &self.intensity,
            Signal::Voltage => &self.voltage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatrixBuilder {
    max_width: usize,
}

impl MatrixBuilder {
    pub fn new(max_width: usize) -> Self {
        Self {
            max_width: max_width.max(1),
        }
    }

    /// Assembles the bulk batches of one cleaned cohort. `intensity` and
    /// `voltage` are parallel to `group.device_ids`.
    pub fn build(
        &self,
        group: &DeviceGroup,
        intensity: &[CleanedSeries],
        voltage: &[CleanedSeries],
    ) -> Result<Vec<MatrixBatch>, ShapeError> {
        group.check_shape()?;

        let batches = partition_batches(group.device_ids.len(), self.max_width)
            .into_iter()
            .map(|range| {
                let device_ids = group.device_ids[range.clone()].to_vec();
                let matrix = |signal: Signal, cleaned: &[CleanedSeries]| {
                    let columns: Vec<&[f64]> = cleaned[range.clone()]
                        .iter()
                        .map(|series| series.values.as_slice())
                        .collect();
                    ImputationMatrix::from_columns(
                        signal,
                        device_ids.clone(),
                        group.timestamps.clone(),
                        &columns,
                    )
                };
                MatrixBatch {
                    intensity: matrix(Signal::Intensity, intensity),
                    voltage: matrix(Signal::Voltage, voltage),
                    device_ids,
                }
            })
            .collect();
        Ok(batches)
    }
}

//! Merges filled matrices back into per-row corrected values.

use std::collections::HashMap;

use ndarray::Array2;

use crate::matrix::ImputationMatrix;
use crate::telemetry::Reading;

/// The corrected value for one device-hour.
///
/// A valid cleaned cell re-affirms the raw reading. A missing cell takes the
/// filled value when one exists, otherwise stays null. Never negative.
pub fn reconcile_cell(cleaned: f64, raw: Option<f64>, filled: Option<f64>) -> Option<f64> {
    if !cleaned.is_nan() {
        return raw.map(|v| v.max(0.0));
    }
    filled.filter(|v| !v.is_nan()).map(|v| v.max(0.0))
}

/// Writes `fixed_*` for `matrix.signal` on every row the matrix covers.
/// Rows outside the matrix are left as they are. Returns rows touched.
pub fn apply(rows: &mut [Reading], matrix: &ImputationMatrix, filled: Option<&Array2<f64>>) -> usize {
    let col_of: HashMap<&str, usize> = matrix
        .device_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let signal = matrix.signal;
    let mut touched = 0;
    for row in rows.iter_mut() {
        let (Some(&col), Ok(t)) = (
            col_of.get(row.device_id.as_str()),
            matrix.timestamps.binary_search(&row.timestamp),
        ) else {
            continue;
        };
        let cleaned = matrix.values[[t, col]];
        let fill = filled.and_then(|values| values.get((t, col)).copied());
        let fixed = reconcile_cell(cleaned, row.value(signal), fill);
        row.set_fixed(signal, fixed);
        touched += 1;
    }
    touched
}

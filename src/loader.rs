//! One station-day of raw telemetry, pulled from a [`TelemetryStore`].

use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{StoreError, TelemetryStore};
use crate::telemetry::{DeviceScope, IrradiancePoint, Reading};
use crate::time_window::DayWindow;

#[derive(Debug, Error)]
#[error("failed to load telemetry for station '{station}': {source}")]
pub struct LoadError {
    pub station: String,
    #[source]
    pub source: StoreError,
}

/// Raw rows for `window`, unsorted and uncleaned. `scope` narrows the read to
/// one sibling cohort.
pub fn load_day<S: TelemetryStore + ?Sized>(
    store: &S,
    window: &DayWindow,
    scope: Option<&DeviceScope>,
) -> Result<Vec<Reading>, LoadError> {
    let rows = store
        .read(&window.range, scope)
        .map_err(|source| LoadError {
            station: store.station().to_string(),
            source,
        })?;

    debug!(
        component = "loader",
        event = "loader.day.loaded",
        station = store.station(),
        date = %window.date,
        scoped = scope.is_some(),
        rows = rows.len()
    );
    Ok(rows)
}

/// Irradiance for `window`. `None` means the station has no usable signal for
/// the day; a failed read degrades to `None` with a warning.
pub fn load_irradiance<S: TelemetryStore + ?Sized>(
    store: &S,
    window: &DayWindow,
) -> Option<Vec<IrradiancePoint>> {
    match store.read_irradiance(&window.range) {
        Ok(points) if points.is_empty() => None,
        Ok(points) => Some(points),
        Err(err) => {
            warn!(
                component = "loader",
                event = "loader.irradiance.unavailable",
                station = store.station(),
                date = %window.date,
                error = %err
            );
            None
        }
    }
}

/// Irradiance aligned to `timestamps`; a timestamp with no point reads as `None`.
pub fn align_irradiance(points: &[IrradiancePoint], timestamps: &[i64]) -> Vec<Option<f64>> {
    timestamps
        .iter()
        .map(|ts| {
            points
                .binary_search_by_key(ts, |point| point.timestamp)
                .ok()
                .map(|idx| points[idx].value)
        })
        .collect()
}

use std::path::PathBuf;

use pv_gapfill::{
    init_logging, log_app_start, logging_config_from_env, store_config_from_env, DeviceId,
    IrradiancePoint, Reading, SqliteStoreFactory, StationStoreFactory,
};
use serde::Deserialize;
use tracing::info;

const BATCH_SIZE: usize = 5_000;

#[derive(Debug, Deserialize)]
struct ReadingRow {
    timestamp: i64,
    device_id: String,
    intensity: Option<f64>,
    voltage: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IrradianceRow {
    timestamp: i64,
    irradiance: Option<f64>,
}

/// Usage: `telemetry_import <station> readings|irradiance <file.csv>`
///
/// Readings CSV: `timestamp,device_id,intensity,voltage`.
/// Irradiance CSV: `timestamp,irradiance`. Empty cells load as nulls.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("telemetry_import", &logging_cfg);

    let mut args = std::env::args().skip(1);
    let usage = "usage: telemetry_import <station> readings|irradiance <file.csv>";
    let station = args.next().ok_or(usage)?;
    let kind = args.next().ok_or(usage)?;
    let path = PathBuf::from(args.next().ok_or(usage)?);

    let factory = SqliteStoreFactory::new(store_config_from_env());
    let mut store = factory.open(&station)?;
    let mut reader = csv::Reader::from_path(&path)?;

    let mut total = 0usize;
    match kind.as_str() {
        "readings" => {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            for row in reader.deserialize::<ReadingRow>() {
                let row = row?;
                let id = DeviceId::parse(&row.device_id)?;
                batch.push(Reading::raw(row.timestamp, &id, row.intensity, row.voltage));
                if batch.len() == BATCH_SIZE {
                    total += store.upsert_readings(&batch)?;
                    batch.clear();
                }
            }
            total += store.upsert_readings(&batch)?;
        }
        "irradiance" => {
            let points: Vec<IrradiancePoint> = reader
                .deserialize::<IrradianceRow>()
                .filter_map(|row| match row {
                    Ok(IrradianceRow {
                        timestamp,
                        irradiance: Some(value),
                    }) => Some(Ok(IrradiancePoint { timestamp, value })),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<_, _>>()?;
            total += store.upsert_irradiance(&points)?;
        }
        other => return Err(format!("unknown import kind '{other}'; {usage}").into()),
    }

    info!(
        component = "telemetry_import",
        event = "import.finish",
        station = %station,
        kind = %kind,
        path = %path.display(),
        rows = total
    );
    println!("Imported {total} {kind} rows into station {station}");
    Ok(())
}

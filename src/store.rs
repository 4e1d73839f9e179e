//! Station telemetry and quality storage.
//!
//! One SQLite file per station holds three tables: hourly string readings,
//! station-level ambient irradiance, and the per-device daily quality overview.
//! Writers replace a whole day at a time inside one `BEGIN IMMEDIATE`
//! transaction; a dropped [`rusqlite::Transaction`] rolls back.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::telemetry::{
    DeviceScope, IrradiancePoint, QualityRecord, Reading, Signal, TimeRange,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid station name '{0}'")]
    InvalidStationName(String),
}

/// Table handles for one station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationTables {
    pub station_info: String,
    pub string_info: String,
    pub string_overview: String,
}

impl StationTables {
    /// `<station>StationInfo`, `<station>StringInfo`, `<station>StringOverview`.
    pub fn for_station(station: &str) -> Result<Self, StoreError> {
        validate_station_name(station)?;
        Ok(Self {
            station_info: format!("{station}StationInfo"),
            string_info: format!("{station}StringInfo"),
            string_overview: format!("{station}StringOverview"),
        })
    }
}

pub trait TelemetryStore {
    fn station(&self) -> &str;

    /// Raw rows in `range`, optionally restricted to one sibling cohort. Unsorted.
    fn read(&self, range: &TimeRange, scope: Option<&DeviceScope>)
        -> Result<Vec<Reading>, StoreError>;

    /// Empty when the station has no irradiance signal for `range`.
    fn read_irradiance(&self, range: &TimeRange) -> Result<Vec<IrradiancePoint>, StoreError>;

    /// Deletes every row in `range` and inserts `rows`, all or nothing.
    fn replace_readings(&mut self, range: &TimeRange, rows: &[Reading]) -> Result<usize, StoreError>;

    /// Sets one signal's corrected value on existing rows of one device.
    fn update_fixed(
        &mut self,
        device_id: &str,
        signal: Signal,
        values: &[(i64, f64)],
    ) -> Result<usize, StoreError>;
}

pub trait QualityStore {
    /// Deletes the records for `day_marker` and inserts `records`, all or nothing.
    fn replace_quality(&mut self, day_marker: i64, records: &[QualityRecord])
        -> Result<usize, StoreError>;

    fn read_quality(
        &self,
        range: &TimeRange,
        device_id: Option<&str>,
    ) -> Result<Vec<QualityRecord>, StoreError>;
}

/// Opens one store handle per worker.
pub trait StationStoreFactory: Send + Sync {
    type Store: TelemetryStore + QualityStore;

    fn open(&self, station: &str) -> Result<Self::Store, StoreError>;
}

pub struct SqliteStationStore {
    station: String,
    tables: StationTables,
    conn: Connection,
}

impl SqliteStationStore {
    pub fn open(path: &Path, station: &str) -> Result<Self, StoreError> {
        let tables = StationTables::for_station(station)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            PRAGMA busy_timeout=5000;
            ",
        )?;
        ensure_schema(&conn, &tables)?;

        debug!(
            component = "store",
            event = "store.open",
            station,
            path = %path.display()
        );

        Ok(Self {
            station: station.to_string(),
            tables,
            conn,
        })
    }

    pub fn tables(&self) -> &StationTables {
        &self.tables
    }

    /// Ingestion path: inserts raw readings, overwriting the raw columns of
    /// rows that already exist while keeping their corrected values.
    pub fn upsert_readings(&mut self, rows: &[Reading]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "
            INSERT INTO {table} (
                timestamp, device_id, string_id, inverter_id, box_id,
                intensity, voltage, fixed_intensity, fixed_voltage
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(timestamp, device_id) DO UPDATE SET
                intensity = excluded.intensity,
                voltage = excluded.voltage
            ",
            table = self.tables.string_info
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                stmt.execute(params![
                    row.timestamp,
                    row.device_id,
                    row.string_id,
                    row.inverter_id,
                    row.box_id,
                    row.intensity,
                    row.voltage,
                    row.fixed_intensity,
                    row.fixed_voltage,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn upsert_irradiance(&mut self, points: &[IrradiancePoint]) -> Result<usize, StoreError> {
        if points.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "
            INSERT INTO {table} (timestamp, irradiance) VALUES (?1, ?2)
            ON CONFLICT(timestamp) DO UPDATE SET irradiance = excluded.irradiance
            ",
            table = self.tables.station_info
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for point in points {
                stmt.execute(params![point.timestamp, point.value])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

impl TelemetryStore for SqliteStationStore {
    fn station(&self) -> &str {
        &self.station
    }

    fn read(
        &self,
        range: &TimeRange,
        scope: Option<&DeviceScope>,
    ) -> Result<Vec<Reading>, StoreError> {
        let base = format!(
            "
            SELECT timestamp, device_id, string_id, inverter_id, box_id,
                   intensity, voltage, fixed_intensity, fixed_voltage
            FROM {table}
            WHERE timestamp >= ?1
              AND timestamp <= ?2
            ",
            table = self.tables.string_info
        );

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Reading> {
            Ok(Reading {
                timestamp: row.get(0)?,
                device_id: row.get(1)?,
                string_id: row.get(2)?,
                inverter_id: row.get(3)?,
                box_id: row.get(4)?,
                intensity: row.get(5)?,
                voltage: row.get(6)?,
                fixed_intensity: row.get(7)?,
                fixed_voltage: row.get(8)?,
            })
        };

        let rows = match scope {
            Some(scope) => {
                let sql = format!("{base} AND box_id = ?3 AND inverter_id = ?4");
                let mut stmt = self.conn.prepare(&sql)?;
                let mapped = stmt.query_map(
                    params![range.start_ts, range.end_ts, scope.box_id, scope.inverter_id],
                    map_row,
                )?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&base)?;
                let mapped = stmt.query_map(params![range.start_ts, range.end_ts], map_row)?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(rows)
    }

    fn read_irradiance(&self, range: &TimeRange) -> Result<Vec<IrradiancePoint>, StoreError> {
        let sql = format!(
            "
            SELECT timestamp, irradiance
            FROM {table}
            WHERE timestamp >= ?1
              AND timestamp <= ?2
              AND irradiance IS NOT NULL
            ORDER BY timestamp ASC
            ",
            table = self.tables.station_info
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mapped = stmt.query_map(params![range.start_ts, range.end_ts], |row| {
            Ok(IrradiancePoint {
                timestamp: row.get(0)?,
                value: row.get(1)?,
            })
        })?;
        Ok(mapped.collect::<Result<Vec<_>, _>>()?)
    }

    fn replace_readings(&mut self, range: &TimeRange, rows: &[Reading]) -> Result<usize, StoreError> {
        let table = self.tables.string_info.clone();
        let tx = self.write_tx()?;
        let deleted = delete_range(&tx, &table, range)?;
        let inserted = bulk_insert(&tx, &table, rows)?;
        tx.commit()?;

        info!(
            component = "store",
            event = "store.readings.replaced",
            station = %self.station,
            start_ts = range.start_ts,
            end_ts = range.end_ts,
            deleted,
            inserted
        );
        Ok(inserted)
    }

    fn update_fixed(
        &mut self,
        device_id: &str,
        signal: Signal,
        values: &[(i64, f64)],
    ) -> Result<usize, StoreError> {
        let column = match signal {
            Signal::Intensity => "fixed_intensity",
            Signal::Voltage => "fixed_voltage",
        };
        let sql = format!(
            "UPDATE {table} SET {column} = ?1 WHERE device_id = ?2 AND timestamp = ?3",
            table = self.tables.string_info
        );

        let tx = self.write_tx()?;
        let mut updated = 0usize;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (timestamp, value) in values {
                updated += stmt.execute(params![value, device_id, timestamp])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }
}

impl QualityStore for SqliteStationStore {
    fn replace_quality(
        &mut self,
        day_marker: i64,
        records: &[QualityRecord],
    ) -> Result<usize, StoreError> {
        let table = self.tables.string_overview.clone();
        let tx = self.write_tx()?;
        let deleted = tx.execute(
            &format!("DELETE FROM {table} WHERE timestamp = ?1"),
            params![day_marker],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "
                INSERT INTO {table} (
                    timestamp, device_id,
                    error_count_intensity, missing_count_intensity,
                    error_count_voltage, missing_count_voltage
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "
            ))?;
            for record in records {
                stmt.execute(params![
                    record.day_marker,
                    record.device_id,
                    record.error_count_intensity,
                    record.missing_count_intensity,
                    record.error_count_voltage,
                    record.missing_count_voltage,
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            component = "store",
            event = "store.quality.replaced",
            station = %self.station,
            day_marker,
            deleted,
            inserted = records.len()
        );
        Ok(records.len())
    }

    fn read_quality(
        &self,
        range: &TimeRange,
        device_id: Option<&str>,
    ) -> Result<Vec<QualityRecord>, StoreError> {
        let base = format!(
            "
            SELECT timestamp, device_id,
                   error_count_intensity, missing_count_intensity,
                   error_count_voltage, missing_count_voltage
            FROM {table}
            WHERE timestamp >= ?1
              AND timestamp <= ?2
            ",
            table = self.tables.string_overview
        );

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<QualityRecord> {
            Ok(QualityRecord {
                day_marker: row.get(0)?,
                device_id: row.get(1)?,
                error_count_intensity: row.get(2)?,
                missing_count_intensity: row.get(3)?,
                error_count_voltage: row.get(4)?,
                missing_count_voltage: row.get(5)?,
            })
        };

        let records = match device_id {
            Some(device_id) => {
                let sql = format!("{base} AND device_id = ?3 ORDER BY timestamp ASC");
                let mut stmt = self.conn.prepare(&sql)?;
                let mapped =
                    stmt.query_map(params![range.start_ts, range.end_ts, device_id], map_row)?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("{base} ORDER BY timestamp ASC, device_id ASC");
                let mut stmt = self.conn.prepare(&sql)?;
                let mapped = stmt.query_map(params![range.start_ts, range.end_ts], map_row)?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }
}

/// One SQLite file per station under `data_root`.
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    config: StoreConfig,
}

impl SqliteStoreFactory {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn station_path(&self, station: &str) -> PathBuf {
        self.config.data_root.join(format!("{station}.sqlite"))
    }
}

impl StationStoreFactory for SqliteStoreFactory {
    type Store = SqliteStationStore;

    fn open(&self, station: &str) -> Result<Self::Store, StoreError> {
        validate_station_name(station)?;
        SqliteStationStore::open(&self.station_path(station), station)
    }
}

fn delete_range(tx: &Transaction<'_>, table: &str, range: &TimeRange) -> Result<usize, StoreError> {
    Ok(tx.execute(
        &format!("DELETE FROM {table} WHERE timestamp >= ?1 AND timestamp <= ?2"),
        params![range.start_ts, range.end_ts],
    )?)
}

fn bulk_insert(tx: &Transaction<'_>, table: &str, rows: &[Reading]) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare(&format!(
        "
        INSERT INTO {table} (
            timestamp, device_id, string_id, inverter_id, box_id,
            intensity, voltage, fixed_intensity, fixed_voltage
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "
    ))?;
    for row in rows {
        stmt.execute(params![
            row.timestamp,
            row.device_id,
            row.string_id,
            row.inverter_id,
            row.box_id,
            row.intensity,
            row.voltage,
            row.fixed_intensity,
            row.fixed_voltage,
        ])?;
    }
    Ok(rows.len())
}

fn ensure_schema(conn: &Connection, tables: &StationTables) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {station_info} (
            timestamp INTEGER NOT NULL PRIMARY KEY,
            irradiance REAL
        );
        CREATE TABLE IF NOT EXISTS {string_info} (
            timestamp INTEGER NOT NULL,
            device_id TEXT NOT NULL,
            string_id TEXT NOT NULL,
            inverter_id TEXT NOT NULL,
            box_id TEXT NOT NULL,
            intensity REAL,
            voltage REAL,
            fixed_intensity REAL,
            fixed_voltage REAL,
            PRIMARY KEY(timestamp, device_id)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS idx_{string_info}_cohort
            ON {string_info} (box_id, inverter_id, timestamp);
        CREATE TABLE IF NOT EXISTS {string_overview} (
            timestamp INTEGER NOT NULL,
            device_id TEXT NOT NULL,
            error_count_intensity INTEGER NOT NULL,
            missing_count_intensity INTEGER NOT NULL,
            error_count_voltage INTEGER NOT NULL,
            missing_count_voltage INTEGER NOT NULL,
            PRIMARY KEY(timestamp, device_id)
        ) WITHOUT ROWID;
        ",
        station_info = tables.station_info,
        string_info = tables.string_info,
        string_overview = tables.string_overview,
    ))?;
    Ok(())
}

fn validate_station_name(station: &str) -> Result<(), StoreError> {
    let valid = !station.is_empty()
        && station
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidStationName(station.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::DeviceId;
    use tempfile::tempdir;

    fn reading(ts: i64, device: &str, intensity: f64) -> Reading {
        let id = DeviceId::parse(device).unwrap();
        Reading::raw(ts, &id, Some(intensity), Some(600.0))
    }

    #[test]
    fn station_names_are_restricted_to_identifier_characters() {
        assert!(StationTables::for_station("datu").is_ok());
        assert!(StationTables::for_station("datu; DROP TABLE x").is_err());
        assert!(StationTables::for_station("").is_err());
        let tables = StationTables::for_station("datu").unwrap();
        assert_eq!(tables.string_info, "datuStringInfo");
    }

    #[test]
    fn scoped_read_returns_only_the_cohort() {
        let temp = tempdir().unwrap();
        let mut store = SqliteStationStore::open(&temp.path().join("s.sqlite"), "s").unwrap();
        store
            .upsert_readings(&[
                reading(0, "001-001-001", 1.0),
                reading(0, "001-002-001", 2.0),
                reading(3_600, "001-001-002", 3.0),
            ])
            .unwrap();

        let range = TimeRange {
            start_ts: 0,
            end_ts: 86_399,
        };
        let scope = DeviceScope {
            box_id: "001".to_string(),
            inverter_id: "001".to_string(),
        };
        let rows = store.read(&range, Some(&scope)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.inverter_id == "001"));
        assert_eq!(store.read(&range, None).unwrap().len(), 3);
    }

    #[test]
    fn failed_replace_rolls_back_to_previous_rows() {
        let temp = tempdir().unwrap();
        let mut store = SqliteStationStore::open(&temp.path().join("s.sqlite"), "s").unwrap();
        store
            .upsert_readings(&[reading(0, "001-001-001", 1.0)])
            .unwrap();

        let range = TimeRange {
            start_ts: 0,
            end_ts: 86_399,
        };
        // Duplicate primary key inside the batch fails the insert half.
        let duplicate = vec![reading(0, "001-001-001", 5.0), reading(0, "001-001-001", 6.0)];
        assert!(store.replace_readings(&range, &duplicate).is_err());

        let rows = store.read(&range, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].intensity, Some(1.0));
    }

    #[test]
    fn upsert_keeps_existing_corrected_values() {
        let temp = tempdir().unwrap();
        let mut store = SqliteStationStore::open(&temp.path().join("s.sqlite"), "s").unwrap();
        let mut row = reading(0, "001-001-001", 1.0);
        row.fixed_intensity = Some(1.0);
        store.upsert_readings(&[row]).unwrap();
        store
            .upsert_readings(&[reading(0, "001-001-001", 9.0)])
            .unwrap();

        let rows = store
            .read(
                &TimeRange {
                    start_ts: 0,
                    end_ts: 10,
                },
                None,
            )
            .unwrap();
        assert_eq!(rows[0].intensity, Some(9.0));
        assert_eq!(rows[0].fixed_intensity, Some(1.0));
    }
}

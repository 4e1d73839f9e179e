//! Read models over the per-device daily quality records.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pipeline::EngineError;
use crate::store::QualityStore;
use crate::telemetry::{compare_device_ids, DeviceId, QualityRecord, Signal, TimeRange, SLOTS_PER_DAY};
use crate::time_window::{dates_between, day_window_for, parse_date, StationTimezone};

/// One node of the station → box → inverter → string tree. Rates are whole
/// percentages; parents carry the rounded mean of their children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityNode {
    pub name: String,
    pub key: String,
    pub err_rate: u32,
    pub missing_rate: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<QualityNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyQualityTotal {
    pub date: String,
    pub error_value: u64,
    pub missing_value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationQualityOverview {
    pub station: Option<QualityNode>,
    pub daily: Vec<DailyQualityTotal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQualityDay {
    pub date: String,
    pub missing_count: u32,
    pub error_count: u32,
}

/// Quality tree and per-day totals for `[start, end)` local dates.
pub fn station_quality_overview<S: QualityStore + ?Sized>(
    store: &S,
    station: &str,
    signal: Signal,
    start: &str,
    end: &str,
    tz: &StationTimezone,
) -> Result<StationQualityOverview, EngineError> {
    let range = half_open_range(start, end, tz)?;
    let records = store.read_quality(&range, None)?;
    if records.is_empty() {
        return Ok(StationQualityOverview {
            station: None,
            daily: Vec::new(),
        });
    }

    let mut per_day: BTreeMap<i64, (u64, u64)> = BTreeMap::new();
    for record in &records {
        let entry = per_day.entry(record.day_marker).or_default();
        entry.0 += u64::from(record.error_count(signal));
        entry.1 += u64::from(record.missing_count(signal));
    }
    let daily = per_day
        .into_iter()
        .map(|(marker, (error_value, missing_value))| DailyQualityTotal {
            date: tz.local_label(marker),
            error_value,
            missing_value,
        })
        .collect();

    Ok(StationQualityOverview {
        station: Some(quality_tree(station, signal, &records)),
        daily,
    })
}

fn quality_tree(station: &str, signal: Signal, records: &[QualityRecord]) -> QualityNode {
    struct StringTotals {
        errors: u64,
        missing: u64,
        days: usize,
    }

    let mut strings: HashMap<&str, (DeviceId, StringTotals)> = HashMap::new();
    let mut seen_days: HashMap<&str, Vec<i64>> = HashMap::new();
    for record in records {
        let Ok(id) = DeviceId::parse(&record.device_id) else {
            continue;
        };
        let days = seen_days.entry(record.device_id.as_str()).or_default();
        let new_day = !days.contains(&record.day_marker);
        if new_day {
            days.push(record.day_marker);
        }
        let (_, totals) = strings.entry(record.device_id.as_str()).or_insert((
            id,
            StringTotals {
                errors: 0,
                missing: 0,
                days: 0,
            },
        ));
        totals.errors += u64::from(record.error_count(signal));
        totals.missing += u64::from(record.missing_count(signal));
        if new_day {
            totals.days += 1;
        }
    }

    let mut device_ids: Vec<&str> = strings.keys().copied().collect();
    device_ids.sort_by(|a, b| compare_device_ids(a, b));

    // box -> inverter -> strings, in device order
    let mut boxes: Vec<(String, Vec<(String, Vec<QualityNode>)>)> = Vec::new();
    for device_id in device_ids {
        let (id, totals) = &strings[device_id];
        let hours = (totals.days * SLOTS_PER_DAY) as f64;
        let leaf = QualityNode {
            name: format!("string {}", id.string_id),
            key: format!("{station},{},{},{}", id.box_id, id.inverter_id, id.string_id),
            err_rate: percent(totals.errors as f64, hours),
            missing_rate: percent(totals.missing as f64, hours),
            children: Vec::new(),
        };

        if boxes.last().map(|(b, _)| b != &id.box_id).unwrap_or(true) {
            boxes.push((id.box_id.clone(), Vec::new()));
        }
        let Some((_, inverters)) = boxes.last_mut() else {
            continue;
        };
        if inverters.last().map(|(i, _)| i != &id.inverter_id).unwrap_or(true) {
            inverters.push((id.inverter_id.clone(), Vec::new()));
        }
        if let Some((_, leaves)) = inverters.last_mut() {
            leaves.push(leaf);
        }
    }

    let mut station_err = 0u64;
    let mut station_missing = 0u64;
    let mut station_strings = 0usize;
    let mut box_nodes = Vec::with_capacity(boxes.len());
    for (box_id, inverters) in boxes {
        let mut box_err = 0u64;
        let mut box_missing = 0u64;
        let mut box_strings = 0usize;
        let mut inverter_nodes = Vec::with_capacity(inverters.len());
        for (inverter_id, leaves) in inverters {
            let err: u64 = leaves.iter().map(|l| u64::from(l.err_rate)).sum();
            let missing: u64 = leaves.iter().map(|l| u64::from(l.missing_rate)).sum();
            let n = leaves.len();
            inverter_nodes.push(QualityNode {
                name: format!("inverter {inverter_id}"),
                key: format!("{station},{box_id},{inverter_id}"),
                err_rate: mean_rate(err, n),
                missing_rate: mean_rate(missing, n),
                children: leaves,
            });
            box_err += err;
            box_missing += missing;
            box_strings += n;
        }
        box_nodes.push(QualityNode {
            name: format!("box {box_id}"),
            key: format!("{station},{box_id}"),
            err_rate: mean_rate(box_err, box_strings),
            missing_rate: mean_rate(box_missing, box_strings),
            children: inverter_nodes,
        });
        station_err += box_err;
        station_missing += box_missing;
        station_strings += box_strings;
    }

    QualityNode {
        name: station.to_string(),
        key: station.to_string(),
        err_rate: mean_rate(station_err, station_strings),
        missing_rate: mean_rate(station_missing, station_strings),
        children: box_nodes,
    }
}

/// Per-day counts for one device over `[start, end)`; days without a record
/// report zeros.
pub fn device_quality_history<S: QualityStore + ?Sized>(
    store: &S,
    device_id: &str,
    signal: Signal,
    start: &str,
    end: &str,
    tz: &StationTimezone,
) -> Result<Vec<DeviceQualityDay>, EngineError> {
    DeviceId::parse(device_id)?;
    let range = half_open_range(start, end, tz)?;
    let records = store.read_quality(&range, Some(device_id))?;

    let mut by_date: BTreeMap<NaiveDate, (u32, u32)> = BTreeMap::new();
    for day in dates_between(parse_date(start)?, parse_date(end)?) {
        by_date.insert(day, (0, 0));
    }
    for record in &records {
        if let Some(date) = tz.local_date(record.day_marker) {
            by_date.insert(date, (record.missing_count(signal), record.error_count(signal)));
        }
    }

    Ok(by_date
        .into_iter()
        .map(|(date, (missing_count, error_count))| DeviceQualityDay {
            date: date.to_string(),
            missing_count,
            error_count,
        })
        .collect())
}

/// `Σ max(err_i, err_v) / (24 · devices)` for one day marker; zero without
/// records.
pub fn daily_error_rate<S: QualityStore + ?Sized>(store: &S, day_marker: i64) -> Result<f64, EngineError> {
    let records = store.read_quality(
        &TimeRange {
            start_ts: day_marker,
            end_ts: day_marker,
        },
        None,
    )?;
    if records.is_empty() {
        return Ok(0.0);
    }
    let worst: u64 = records
        .iter()
        .map(|r| u64::from(r.error_count_intensity.max(r.error_count_voltage)))
        .sum();
    Ok(worst as f64 / (SLOTS_PER_DAY * records.len()) as f64)
}

fn half_open_range(start: &str, end: &str, tz: &StationTimezone) -> Result<TimeRange, EngineError> {
    let start = day_window_for(parse_date(start)?, tz)?;
    let end = day_window_for(parse_date(end)?, tz)?;
    Ok(TimeRange {
        start_ts: start.range.start_ts,
        end_ts: end.range.start_ts - 1,
    })
}

fn percent(count: f64, hours: f64) -> u32 {
    if hours <= 0.0 {
        0
    } else {
        (count / hours * 100.0).round() as u32
    }
}

fn mean_rate(sum: u64, n: usize) -> u32 {
    if n == 0 {
        0
    } else {
        (sum as f64 / n as f64).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_round_to_whole_percent() {
        assert_eq!(percent(3.0, 24.0), 13);
        assert_eq!(percent(0.0, 0.0), 0);
        assert_eq!(mean_rate(25, 2), 13);
        assert_eq!(mean_rate(7, 0), 0);
    }
}

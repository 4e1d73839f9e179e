//! All-or-nothing replacement of one station-day.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::store::{QualityStore, StoreError, TelemetryStore};
use crate::telemetry::{compare_device_ids, QualityRecord, Reading};
use crate::time_window::DayWindow;

/// In-process mutual exclusion per `(station, day_marker)`. Cross-process
/// exclusion comes from the store's immediate transactions.
#[derive(Debug, Default)]
pub struct DayLocks {
    table: Mutex<HashMap<(String, i64), Arc<Mutex<()>>>>,
}

impl DayLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<(String, i64), Arc<Mutex<()>>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, key: &(String, i64)) -> Arc<Mutex<()>> {
        Arc::clone(
            self.table()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drops the table entry once no other caller holds or waits on it.
    fn release(&self, key: &(String, i64), lock: Arc<Mutex<()>>) {
        let mut table = self.table();
        // the table's handle plus ours
        if Arc::strong_count(&lock) == 2 {
            table.remove(key);
        }
    }

    /// Runs `f` while holding the lock for `(station, day_marker)`.
    pub fn with_day<R>(&self, station: &str, day_marker: i64, f: impl FnOnce() -> R) -> R {
        let key = (station.to_string(), day_marker);
        let lock = self.acquire(&key);
        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release(&key, lock);
        out
    }

    /// Days currently locked or waited on.
    pub fn active(&self) -> usize {
        self.table().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub rows_written: usize,
    pub quality_records: usize,
    pub fingerprint: String,
}

pub struct TransactionalWriter<'a> {
    locks: &'a DayLocks,
}

impl<'a> TransactionalWriter<'a> {
    pub fn new(locks: &'a DayLocks) -> Self {
        Self { locks }
    }

    /// Replaces the day's readings, then its quality records. Each replacement
    /// is its own transaction; a failure in either leaves that table untouched.
    pub fn commit_day<S>(
        &self,
        store: &mut S,
        window: &DayWindow,
        mut rows: Vec<Reading>,
        mut quality: Vec<QualityRecord>,
    ) -> Result<WriteReport, StoreError>
    where
        S: TelemetryStore + QualityStore,
    {
        sort_rows(&mut rows);
        quality.sort_by(|a, b| compare_device_ids(&a.device_id, &b.device_id));
        let station = store.station().to_string();
        let day_marker = window.day_marker();

        self.locks.with_day(&station, day_marker, || -> Result<WriteReport, StoreError> {
            let rows_written = store.replace_readings(&window.range, &rows)?;
            let quality_records = store.replace_quality(day_marker, &quality)?;
            let fingerprint = rows_fingerprint(&rows);

            info!(
                component = "writer",
                event = "writer.day.committed",
                station = %station,
                date = %window.date,
                day_marker,
                rows_written,
                quality_records,
                fingerprint = %fingerprint
            );

            Ok(WriteReport {
                rows_written,
                quality_records,
                fingerprint,
            })
        })
    }
}

/// Canonical write order: timestamp, then device.
pub fn sort_rows(rows: &mut [Reading]) {
    rows.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| compare_device_ids(&a.device_id, &b.device_id))
    });
}

/// SHA-256 over the rows in write order, hex encoded.
pub fn rows_fingerprint(rows: &[Reading]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.timestamp.to_le_bytes());
        hasher.update(row.device_id.as_bytes());
        for value in [
            row.intensity,
            row.voltage,
            row.fixed_intensity,
            row.fixed_voltage,
        ] {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update(v.to_bits().to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::DeviceId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn fingerprint_is_order_and_value_sensitive() {
        let id = DeviceId::parse("1-1-1").unwrap();
        let a = Reading::raw(0, &id, Some(1.0), Some(2.0));
        let mut b = a.clone();
        b.fixed_intensity = Some(1.0);

        assert_eq!(rows_fingerprint(&[a.clone()]), rows_fingerprint(&[a.clone()]));
        assert_ne!(rows_fingerprint(&[a.clone()]), rows_fingerprint(&[b.clone()]));
        assert_ne!(
            rows_fingerprint(&[a.clone(), b.clone()]),
            rows_fingerprint(&[b, a])
        );
    }

    #[test]
    fn day_lock_serializes_same_key() {
        let locks = Arc::new(DayLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    locks.with_day("s", 1, || {
                        if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(std::time::Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn day_lock_entries_are_pruned_after_use() {
        let locks = DayLocks::new();
        for day in 0..100 {
            let held = locks.with_day("s", day * 86_400, || locks.active());
            assert_eq!(held, 1);
        }
        locks.with_day("s", 0, || locks.with_day("t", 0, || assert_eq!(locks.active(), 2)));
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn rows_sort_by_time_then_device() {
        let nine = DeviceId::parse("1-1-9").unwrap();
        let ten = DeviceId::parse("1-1-10").unwrap();
        let mut rows = vec![
            Reading::raw(3_600, &nine, None, None),
            Reading::raw(0, &ten, None, None),
            Reading::raw(0, &nine, None, None),
        ];
        sort_rows(&mut rows);
        let order: Vec<(i64, &str)> = rows
            .iter()
            .map(|r| (r.timestamp, r.device_id.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "1-1-9"), (0, "1-1-10"), (3_600, "1-1-9")]);
    }
}

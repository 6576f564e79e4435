//! ==============================================================================
//! store.rs - append-only time-series store (sqlite)
//! ==============================================================================
//!
//! purpose:
//!     persists every SensorReading keyed by (sensor, timestamp) and answers
//!     "latest", "range" and "recent" queries for the detector, the chart
//!     renderer and the api.
//!
//! concurrency:
//!     two connections to the same WAL-mode database file:
//!     - writer: serialized behind a mutex, synchronous=FULL so an append is
//!       durable before it returns
//!     - readers: a small pool of separate connections, so readers only ever
//!       see committed rows, never wait on a write in progress, and the
//!       scheduler and the api do not queue behind each other
//!
//! relationships:
//!     - written by: ingest.rs (sole writer)
//!     - read by: detector.rs, chart.rs, api.rs
//!
//! ==============================================================================

use crate::domain::{SensorId, SensorReading, TimeRange};
use crate::error::{StoreError, WriteError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

const READINGS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor TEXT NOT NULL,
    value REAL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_time
    ON sensor_data(sensor, timestamp, id);
";

/// read connections per store
const READER_POOL: usize = 4;

pub struct ReadingStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

/// open a connection in WAL mode with full sync.
///
/// shared with the subscriber registry, which lives in the same file.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// lock a connection, recovering from a poisoned mutex
pub(crate) fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReadingStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let writer = open_connection(path)?;
        writer.execute_batch(READINGS_SCHEMA)?;
        let readers = (0..READER_POOL)
            .map(|_| open_connection(path).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(path = %path.display(), readers = READER_POOL, "[STORE] Reading store ready");
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// first idle read connection, starting round-robin; waits on one only
    /// when the whole pool is busy
    fn reader(&self) -> MutexGuard<'_, Connection> {
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        for i in 0..self.readers.len() {
            match self.readers[(start + i) % self.readers.len()].try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {}
            }
        }
        lock(&self.readers[start])
    }

    /// persist one reading. values are stored verbatim (NaN included);
    /// validation happens upstream in ingestion.
    pub fn append(
        &self,
        sensor: SensorId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        let conn = lock(&self.writer);
        conn.execute(
            "INSERT INTO sensor_data (sensor, value, timestamp) VALUES (?1, ?2, ?3)",
            params![sensor.as_str(), value, timestamp.timestamp_millis()],
        )
        .map(|_| ())
        .map_err(|source| WriteError { sensor, source })
    }

    /// most recent reading by timestamp, or None when the sensor has no history
    pub fn latest(&self, sensor: SensorId) -> Result<Option<SensorReading>, StoreError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT value, timestamp FROM sensor_data
                 WHERE sensor = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![sensor.as_str()],
                |row| Ok((value_at(row)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        row.map(|(value, ts)| to_reading(sensor, value, ts)).transpose()
    }

    /// readings within [from, to], oldest first. empty when nothing falls inside.
    pub fn range(&self, sensor: SensorId, range: TimeRange) -> Result<Vec<SensorReading>, StoreError> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT value, timestamp FROM sensor_data
             WHERE sensor = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                sensor.as_str(),
                range.from.timestamp_millis(),
                range.to.timestamp_millis()
            ],
            |row| Ok((value_at(row)?, row.get::<_, i64>(1)?)),
        )?;

        let mut readings = Vec::new();
        for row in rows {
            let (value, ts) = row?;
            readings.push(to_reading(sensor, value, ts)?);
        }
        Ok(readings)
    }

    /// the `n` most recent readings, newest first. shorter when history is.
    pub fn recent(&self, sensor: SensorId, n: usize) -> Result<Vec<SensorReading>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT value, timestamp FROM sensor_data
             WHERE sensor = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sensor.as_str(), limit], |row| {
            Ok((value_at(row)?, row.get::<_, i64>(1)?))
        })?;

        let mut readings = Vec::with_capacity(n.min(64));
        for row in rows {
            let (value, ts) = row?;
            readings.push(to_reading(sensor, value, ts)?);
        }
        Ok(readings)
    }

    /// total number of readings for a sensor (status api)
    pub fn count(&self, sensor: SensorId) -> Result<u64, StoreError> {
        let conn = self.reader();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sensor_data WHERE sensor = ?1",
            params![sensor.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// sqlite stores NaN as NULL, so NULL reads back as NaN
fn value_at(row: &rusqlite::Row<'_>) -> rusqlite::Result<f64> {
    Ok(row.get::<_, Option<f64>>(0)?.unwrap_or(f64::NAN))
}

fn to_reading(sensor: SensorId, value: f64, ts_ms: i64) -> Result<SensorReading, StoreError> {
    let timestamp = DateTime::from_timestamp_millis(ts_ms).ok_or(StoreError::BadTimestamp(ts_ms))?;
    Ok(SensorReading::new(sensor, value, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ReadingStore) {
        let dir = TempDir::new().unwrap();
        let store = ReadingStore::open(&dir.path().join("readings.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn latest_is_absent_without_history() {
        let (_dir, store) = setup();
        assert!(store.latest(SensorId::Humidity).unwrap().is_none());
    }

    #[test]
    fn latest_returns_most_recent_by_timestamp() {
        let (_dir, store) = setup();
        let now = Utc::now();
        store.append(SensorId::Humidity, 40.0, now - Duration::seconds(10)).unwrap();
        store.append(SensorId::Humidity, 45.0, now).unwrap();
        store.append(SensorId::IndoorTemp, 21.0, now + Duration::seconds(5)).unwrap();

        let latest = store.latest(SensorId::Humidity).unwrap().unwrap();
        assert_eq!(latest.value, 45.0);
        assert_eq!(latest.sensor_id, SensorId::Humidity);
    }

    #[test]
    fn range_is_inclusive_and_ascending() {
        let (_dir, store) = setup();
        let base = Utc::now();
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            store.append(SensorId::IndoorTemp, *v, base + Duration::seconds(i as i64)).unwrap();
        }

        let readings = store
            .range(
                SensorId::IndoorTemp,
                TimeRange::new(base + Duration::seconds(1), base + Duration::seconds(3)),
            )
            .unwrap();
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(readings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn empty_range_is_not_an_error() {
        let (_dir, store) = setup();
        let now = Utc::now();
        store.append(SensorId::IndoorTemp, 20.0, now - Duration::hours(10)).unwrap();

        let readings = store
            .range(SensorId::IndoorTemp, TimeRange::last_minutes(now, 60))
            .unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn recent_is_newest_first_and_short_when_history_is() {
        let (_dir, store) = setup();
        let base = Utc::now();
        for (i, v) in [10.0, 11.0, 12.0].iter().enumerate() {
            store.append(SensorId::ThermalFlow, *v, base + Duration::seconds(i as i64)).unwrap();
        }

        let recent = store.recent(SensorId::ThermalFlow, 5).unwrap();
        let values: Vec<f64> = recent.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![12.0, 11.0, 10.0]);
        assert!(store.recent(SensorId::Humidity, 5).unwrap().is_empty());
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let (_dir, store) = setup();
        let now = Utc::now();
        store.append(SensorId::IndoorTemp, 1.0, now).unwrap();
        store.append(SensorId::IndoorTemp, 2.0, now).unwrap();

        assert_eq!(store.latest(SensorId::IndoorTemp).unwrap().unwrap().value, 2.0);
        let asc = store.range(SensorId::IndoorTemp, TimeRange::new(now, now)).unwrap();
        assert_eq!(asc.iter().map(|r| r.value).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[test]
    fn nan_and_negative_values_are_stored_verbatim() {
        let (_dir, store) = setup();
        let now = Utc::now();
        store.append(SensorId::ThermalFlow, -12.5, now).unwrap();
        store.append(SensorId::ThermalFlow, f64::NAN, now + Duration::seconds(1)).unwrap();

        let recent = store.recent(SensorId::ThermalFlow, 2).unwrap();
        assert!(recent[0].value.is_nan());
        assert_eq!(recent[1].value, -12.5);
    }

    #[test]
    fn busy_reader_does_not_block_other_reads() {
        let (_dir, store) = setup();
        store.append(SensorId::Humidity, 50.0, Utc::now()).unwrap();

        let held: Vec<_> = (0..READER_POOL - 1).map(|_| store.reader()).collect();
        assert_eq!(store.latest(SensorId::Humidity).unwrap().unwrap().value, 50.0);
        drop(held);
        assert_eq!(store.count(SensorId::Humidity).unwrap(), 1);
    }

    #[test]
    fn readings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.db");
        {
            let store = ReadingStore::open(&path).unwrap();
            store.append(SensorId::Humidity, 55.0, Utc::now()).unwrap();
        }
        let store = ReadingStore::open(&path).unwrap();
        assert_eq!(store.count(SensorId::Humidity).unwrap(), 1);
    }
}

//! ==============================================================================
//! ingest.rs - ingestion subscriber (decode + append)
//! ==============================================================================
//!
//! purpose:
//!     turns raw (topic, payload) messages into stored readings. this is the
//!     single ingestion path: live broker and synthetic generator both feed
//!     it through the same channel (see source.rs).
//!
//! rules:
//!     - topic -> sensor mapping is static config; unmapped topics are ignored
//!     - payload is a utf-8 decimal number; anything else is a DecodeError,
//!       logged and dropped, ingestion carries on
//!     - readings are stamped with the wall clock at arrival, never with
//!       anything from the payload. a clock stepping backwards is clamped to
//!       the sensor's previous stamp so per-sensor time never decreases.
//!
//! relationships:
//!     - fed by: source.rs (mpsc channel)
//!     - writes: store.rs (sole writer)
//!
//! ==============================================================================

use crate::config::TopicsConfig;
use crate::domain::{SensorId, SensorReading};
use crate::error::{DecodeError, IngestError};
use crate::store::ReadingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// one inbound broker message, undecoded
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }
}

/// counters shared with the status api
#[derive(Debug, Default)]
pub struct IngestStats {
    stored: AtomicU64,
    decode_errors: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub stored: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounts {
        IngestCounts {
            stored: self.stored.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// parse a payload as a finite decimal number
pub fn decode_payload(topic: &str, payload: &[u8]) -> Result<f64, DecodeError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::NotUtf8 { topic: topic.to_string() })?
        .trim();
    let value: f64 = text.parse().map_err(|_| DecodeError::NotANumber {
        topic: topic.to_string(),
        payload: text.chars().take(64).collect(),
    })?;
    if !value.is_finite() {
        return Err(DecodeError::NotFinite { topic: topic.to_string(), value });
    }
    Ok(value)
}

pub struct Ingestor {
    topics: TopicsConfig,
    store: Arc<ReadingStore>,
    last_stamp: HashMap<SensorId, DateTime<Utc>>,
    stats: Arc<IngestStats>,
    show_data: bool,
}

impl Ingestor {
    pub fn new(topics: TopicsConfig, store: Arc<ReadingStore>, show_data: bool) -> Self {
        Self {
            topics,
            store,
            last_stamp: HashMap::new(),
            stats: Arc::new(IngestStats::default()),
            show_data,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// decode and persist one message.
    ///
    /// Ok(None) means the topic is not mapped to any sensor.
    pub fn handle(
        &mut self,
        message: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<SensorReading>, IngestError> {
        let Some(sensor) = self.topics.sensor_for(&message.topic) else {
            tracing::debug!(topic = %message.topic, "[INGEST] Ignoring unmapped topic");
            return Ok(None);
        };

        let value = decode_payload(&message.topic, &message.payload)?;
        let timestamp = self.stamp(sensor, now);
        self.store.append(sensor, value, timestamp)?;
        self.last_stamp.insert(sensor, timestamp);

        Ok(Some(SensorReading::new(sensor, value, timestamp)))
    }

    fn stamp(&self, sensor: SensorId, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_stamp.get(&sensor) {
            Some(last) if *last > now => *last,
            _ => now,
        }
    }

    /// receive loop. ends when every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawMessage>) {
        tracing::info!("[INGEST] Receive loop started");
        while let Some(message) = rx.recv().await {
            match self.handle(&message, Utc::now()) {
                Ok(Some(reading)) => {
                    self.stats.stored.fetch_add(1, Ordering::Relaxed);
                    if self.show_data {
                        tracing::info!(sensor = %reading.sensor_id, value = reading.value, "[INGEST] Stored");
                    }
                }
                Ok(None) => {}
                Err(IngestError::Decode(e)) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "[INGEST] Dropped malformed payload");
                }
                Err(IngestError::Write(e)) => {
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "[INGEST] Write failed");
                }
            }
        }
        tracing::warn!("[INGEST] Receive loop stopped: all sources closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<ReadingStore>, Ingestor) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ReadingStore::open(&dir.path().join("ingest.db")).unwrap());
        let ingestor = Ingestor::new(TopicsConfig::default(), store.clone(), false);
        (dir, store, ingestor)
    }

    #[test]
    fn decodes_trimmed_decimal() {
        assert_eq!(decode_payload("t", b" 21.5\n").unwrap(), 21.5);
        assert_eq!(decode_payload("t", b"-3").unwrap(), -3.0);
    }

    #[test]
    fn rejects_garbage_payloads() {
        assert!(matches!(decode_payload("t", b"warm"), Err(DecodeError::NotANumber { .. })));
        assert!(matches!(decode_payload("t", &[0xff, 0xfe]), Err(DecodeError::NotUtf8 { .. })));
        assert!(matches!(decode_payload("t", b"NaN"), Err(DecodeError::NotFinite { .. })));
        assert!(matches!(decode_payload("t", b""), Err(DecodeError::NotANumber { .. })));
    }

    #[test]
    fn stores_mapped_topic_with_arrival_time() {
        let (_dir, store, mut ingestor) = setup();
        let now = Utc::now();
        let reading = ingestor
            .handle(&RawMessage::new("sensors/temperature", "22.5"), now)
            .unwrap()
            .unwrap();

        assert_eq!(reading.sensor_id, SensorId::IndoorTemp);
        let latest = store.latest(SensorId::IndoorTemp).unwrap().unwrap();
        assert_eq!(latest.value, 22.5);
        assert_eq!(latest.timestamp.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn unmapped_topic_is_ignored() {
        let (_dir, store, mut ingestor) = setup();
        let out = ingestor.handle(&RawMessage::new("sensors/co2", "400"), Utc::now()).unwrap();
        assert!(out.is_none());
        for sensor in SensorId::ALL {
            assert!(store.latest(sensor).unwrap().is_none());
        }
    }

    #[test]
    fn malformed_payload_is_dropped_and_next_one_stored() {
        let (_dir, store, mut ingestor) = setup();
        let err = ingestor.handle(&RawMessage::new("sensors/humidity", "n/a"), Utc::now());
        assert!(matches!(err, Err(IngestError::Decode(_))));

        ingestor.handle(&RawMessage::new("sensors/humidity", "48"), Utc::now()).unwrap();
        assert_eq!(store.count(SensorId::Humidity).unwrap(), 1);
    }

    #[test]
    fn backwards_clock_is_clamped_per_sensor() {
        let (_dir, store, mut ingestor) = setup();
        let now = Utc::now();
        ingestor.handle(&RawMessage::new("sensors/thermal", "1"), now).unwrap();
        let earlier = now - Duration::seconds(30);
        let second = ingestor.handle(&RawMessage::new("sensors/thermal", "2"), earlier).unwrap().unwrap();

        assert_eq!(second.timestamp, now);
        let recent = store.recent(SensorId::ThermalFlow, 2).unwrap();
        assert_eq!(recent[0].value, 2.0);
        assert_eq!(recent[1].value, 1.0);
    }

    #[tokio::test]
    async fn run_loop_counts_outcomes() {
        let (_dir, store, ingestor) = setup();
        let stats = ingestor.stats();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(ingestor.run(rx));

        tx.send(RawMessage::new("sensors/temperature", "20")).await.unwrap();
        tx.send(RawMessage::new("sensors/temperature", "oops")).await.unwrap();
        tx.send(RawMessage::new("sensors/temperature", "21")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            stats.snapshot(),
            IngestCounts { stored: 2, decode_errors: 1, write_errors: 0 }
        );
        assert_eq!(store.latest(SensorId::IndoorTemp).unwrap().unwrap().value, 21.0);
    }
}

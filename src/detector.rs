//! ==============================================================================
//! detector.rs - spike detection over the recent reading window
//! ==============================================================================
//!
//! purpose:
//!     decides, per monitored sensor, whether the newest reading is a spike
//!     relative to the mean of the readings just before it.
//!
//! window:
//!     the 5 most recent readings. current = newest, baseline = mean of the
//!     other (up to 4). fewer than 2 readings is "insufficient data", which is
//!     reported separately from "calm".
//!
//! rules:
//!     - reference-aware: spike must exceed the threshold AND the current value
//!       must sit more than `margin` away from the outdoor reference, on the
//!       same side as the spike
//!     - local-only: |diff| > threshold, nothing else
//!
//! ```text
//!     which physical sensor gets which rule is configuration (config.rs).
//! ```
//!
//! relationships:
//!     - reads: store.rs (recent)
//!     - calls: reference.rs (at most once per cycle, only when needed)
//!     - produces: DetectionVerdict for dispatch.rs
//!
//! ==============================================================================

use crate::config::DetectorConfig;
use crate::domain::{DetectionVerdict, Direction, SensorId, VerdictStatus};
use crate::error::StoreError;
use crate::reference::ReferenceProvider;
use crate::store::ReadingStore;
use std::sync::Arc;

/// readings considered per evaluation (current + up to 4 baseline values)
pub const WINDOW: usize = 5;

/// current value and baseline mean of a newest-first window.
/// None when the window holds fewer than 2 values.
pub fn baseline_split(newest_first: &[f64]) -> Option<(f64, f64)> {
    let window = &newest_first[..newest_first.len().min(WINDOW)];
    let (current, previous) = window.split_first()?;
    if previous.is_empty() {
        return None;
    }
    let baseline = previous.iter().sum::<f64>() / previous.len() as f64;
    Some((*current, baseline))
}

/// reference-aware rule as a pure function of the window and the reference
pub fn evaluate_reference_aware(
    sensor: SensorId,
    newest_first: &[f64],
    reference: f64,
    spike_threshold: f64,
    margin: f64,
) -> DetectionVerdict {
    let Some((current, baseline)) = baseline_split(newest_first) else {
        return DetectionVerdict::insufficient(sensor);
    };
    let diff = current - baseline;

    let direction = if diff > spike_threshold && (current - reference) > margin {
        Direction::Increase
    } else if diff < -spike_threshold && (reference - current) > margin {
        Direction::Decrease
    } else {
        Direction::None
    };

    DetectionVerdict {
        sensor_id: sensor,
        status: if direction == Direction::None { VerdictStatus::Calm } else { VerdictStatus::Triggered },
        magnitude: Some(diff.abs()),
        direction,
        current_value: Some(current),
        reference_value: Some(reference),
    }
}

/// local-only rule as a pure function of the window
pub fn evaluate_local(sensor: SensorId, newest_first: &[f64], threshold: f64) -> DetectionVerdict {
    let Some((current, baseline)) = baseline_split(newest_first) else {
        return DetectionVerdict::insufficient(sensor);
    };
    let diff = current - baseline;
    let triggered = diff.abs() > threshold;

    // sign of the change is reported whether or not it crossed the threshold
    let direction = if diff > 0.0 { Direction::Increase } else { Direction::Decrease };

    DetectionVerdict {
        sensor_id: sensor,
        status: if triggered { VerdictStatus::Triggered } else { VerdictStatus::Calm },
        magnitude: Some(diff.abs()),
        direction,
        current_value: Some(current),
        reference_value: None,
    }
}

pub struct AnomalyDetector {
    store: Arc<ReadingStore>,
    reference: Arc<dyn ReferenceProvider>,
    detectors: Vec<DetectorConfig>,
}

impl AnomalyDetector {
    pub fn new(
        store: Arc<ReadingStore>,
        reference: Arc<dyn ReferenceProvider>,
        detectors: Vec<DetectorConfig>,
    ) -> Self {
        Self { store, reference, detectors }
    }

    pub fn detectors(&self) -> &[DetectorConfig] {
        &self.detectors
    }

    fn window(&self, sensor: SensorId) -> Result<Vec<f64>, StoreError> {
        Ok(self.store.recent(sensor, WINDOW)?.into_iter().map(|r| r.value).collect())
    }

    /// one verdict per configured detector, in config order.
    ///
    /// the reference is fetched lazily and at most once per call.
    pub async fn evaluate(&self) -> Result<Vec<DetectionVerdict>, StoreError> {
        let mut reference: Option<f64> = None;
        let mut verdicts = Vec::with_capacity(self.detectors.len());

        for detector in &self.detectors {
            let sensor = detector.sensor();
            let window = self.window(sensor)?;

            let verdict = match detector {
                DetectorConfig::ReferenceAware { spike_threshold, margin, .. } => {
                    if window.len() < 2 {
                        DetectionVerdict::insufficient(sensor)
                    } else {
                        let r = match reference {
                            Some(r) => r,
                            None => {
                                let r = self.reference.fetch().await;
                                reference = Some(r);
                                r
                            }
                        };
                        evaluate_reference_aware(sensor, &window, r, *spike_threshold, *margin)
                    }
                }
                DetectorConfig::Local { threshold, .. } => evaluate_local(sensor, &window, *threshold),
            };

            tracing::debug!(
                sensor = %sensor,
                status = ?verdict.status,
                magnitude = ?verdict.magnitude,
                "[DETECT] Verdict"
            );
            verdicts.push(verdict);
        }

        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::FixedReference;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// oldest -> newest, as the readings arrive
    fn newest_first(oldest_first: &[f64]) -> Vec<f64> {
        oldest_first.iter().rev().copied().collect()
    }

    #[test]
    fn local_step_up_triggers_increase() {
        let v = evaluate_local(SensorId::IndoorTemp, &newest_first(&[10.0, 10.0, 10.0, 10.0, 30.0]), 10.0);
        assert!(v.triggered());
        assert_eq!(v.direction, Direction::Increase);
        assert_eq!(v.magnitude, Some(20.0));
        assert_eq!(v.current_value, Some(30.0));
        assert_eq!(v.reference_value, None);
    }

    #[test]
    fn local_step_down_triggers_decrease() {
        let v = evaluate_local(SensorId::IndoorTemp, &newest_first(&[22.0, 22.0, 22.0, 22.0, 5.0]), 10.0);
        assert!(v.triggered());
        assert_eq!(v.direction, Direction::Decrease);
        assert_eq!(v.magnitude, Some(17.0));
    }

    #[test]
    fn local_small_change_is_calm_with_magnitude() {
        let v = evaluate_local(SensorId::IndoorTemp, &newest_first(&[20.0, 20.0, 21.0]), 10.0);
        assert_eq!(v.status, VerdictStatus::Calm);
        assert_eq!(v.direction, Direction::Increase);
        assert_eq!(v.magnitude, Some(1.0));
    }

    #[test]
    fn local_calm_verdict_keeps_sign_of_change() {
        let up = evaluate_local(SensorId::IndoorTemp, &[25.0, 20.0, 20.0, 20.0, 20.0], 10.0);
        assert_eq!(up.status, VerdictStatus::Calm);
        assert_eq!(up.direction, Direction::Increase);
        assert_eq!(up.magnitude, Some(5.0));

        let down = evaluate_local(SensorId::IndoorTemp, &[17.0, 20.0, 20.0, 20.0, 20.0], 10.0);
        assert_eq!(down.status, VerdictStatus::Calm);
        assert_eq!(down.direction, Direction::Decrease);
    }

    #[test]
    fn reference_aware_increase_beyond_margin() {
        let v = evaluate_reference_aware(
            SensorId::ThermalFlow,
            &newest_first(&[5.0, 5.0, 5.0, 5.0, 8.0]),
            1.0,
            2.0,
            5.0,
        );
        assert!(v.triggered());
        assert_eq!(v.direction, Direction::Increase);
        assert_eq!(v.magnitude, Some(3.0));
        assert_eq!(v.reference_value, Some(1.0));
    }

    #[test]
    fn reference_aware_within_margin_is_calm_but_keeps_magnitude() {
        let v = evaluate_reference_aware(
            SensorId::ThermalFlow,
            &newest_first(&[5.0, 5.0, 5.0, 5.0, 8.0]),
            4.0,
            2.0,
            5.0,
        );
        assert_eq!(v.status, VerdictStatus::Calm);
        assert_eq!(v.direction, Direction::None);
        assert_eq!(v.magnitude, Some(3.0));
        assert_eq!(v.current_value, Some(8.0));
    }

    #[test]
    fn reference_aware_decrease_below_reference() {
        let v = evaluate_reference_aware(
            SensorId::ThermalFlow,
            &newest_first(&[10.0, 10.0, 10.0, 10.0, 2.0]),
            12.0,
            2.0,
            5.0,
        );
        assert!(v.triggered());
        assert_eq!(v.direction, Direction::Decrease);
        assert_eq!(v.magnitude, Some(8.0));
    }

    #[test]
    fn fewer_than_two_readings_is_insufficient_for_both_rules() {
        for window in [vec![], vec![100.0]] {
            let local = evaluate_local(SensorId::IndoorTemp, &window, 0.0);
            let aware = evaluate_reference_aware(SensorId::ThermalFlow, &window, -50.0, 0.0, 0.0);
            for v in [local, aware] {
                assert!(v.is_insufficient());
                assert!(!v.triggered());
                assert_eq!(v.magnitude, None);
            }
        }
    }

    #[test]
    fn baseline_uses_at_most_four_previous_values() {
        // the 6th value (1000) is outside the window
        let (current, baseline) = baseline_split(&[30.0, 10.0, 10.0, 10.0, 10.0, 1000.0]).unwrap();
        assert_eq!(current, 30.0);
        assert_eq!(baseline, 10.0);
        assert_eq!(baseline_split(&[3.0, 1.0]), Some((3.0, 1.0)));
    }

    struct CountingReference {
        value: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReferenceProvider for CountingReference {
        async fn fetch(&self) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.value
        }
    }

    fn store_with(dir: &TempDir, sensor: SensorId, oldest_first: &[f64]) -> Arc<ReadingStore> {
        let store = Arc::new(ReadingStore::open(&dir.path().join("detect.db")).unwrap());
        let base = Utc::now() - Duration::minutes(10);
        for (i, v) in oldest_first.iter().enumerate() {
            store.append(sensor, *v, base + Duration::seconds(i as i64)).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn evaluates_every_configured_detector_from_the_store() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, SensorId::ThermalFlow, &[5.0, 5.0, 5.0, 5.0, 8.0]);
        let detector = AnomalyDetector::new(
            store,
            Arc::new(FixedReference(1.0)),
            crate::config::default_detectors(),
        );

        let verdicts = detector.evaluate().await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].sensor_id, SensorId::ThermalFlow);
        assert!(verdicts[0].triggered());
        assert_eq!(verdicts[1].sensor_id, SensorId::IndoorTemp);
        assert!(verdicts[1].is_insufficient());
    }

    #[tokio::test]
    async fn reference_not_fetched_without_enough_history() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, SensorId::ThermalFlow, &[5.0]);
        let reference = Arc::new(CountingReference { value: 0.0, calls: AtomicUsize::new(0) });
        let detector = AnomalyDetector::new(store, reference.clone(), crate::config::default_detectors());

        let verdicts = detector.evaluate().await.unwrap();
        assert!(verdicts.iter().all(|v| v.is_insufficient()));
        assert_eq!(reference.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reference_fetched_once_per_cycle() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ReadingStore::open(&dir.path().join("detect.db")).unwrap());
        let now = Utc::now();
        for (i, v) in [1.0, 2.0].iter().enumerate() {
            store.append(SensorId::ThermalFlow, *v, now + Duration::seconds(i as i64)).unwrap();
            store.append(SensorId::IndoorTemp, *v, now + Duration::seconds(i as i64)).unwrap();
        }
        let reference = Arc::new(CountingReference { value: 0.0, calls: AtomicUsize::new(0) });
        let detectors = vec![
            DetectorConfig::ReferenceAware { sensor: SensorId::ThermalFlow, spike_threshold: 2.0, margin: 5.0 },
            DetectorConfig::ReferenceAware { sensor: SensorId::IndoorTemp, spike_threshold: 2.0, margin: 5.0 },
        ];
        let detector = AnomalyDetector::new(store, reference.clone(), detectors);

        detector.evaluate().await.unwrap();
        assert_eq!(reference.calls.load(Ordering::SeqCst), 1);
    }
}

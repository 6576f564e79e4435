//! ==============================================================================
//! dispatch.rs - alert composition and fan-out
//! ==============================================================================
//!
//! purpose:
//!     turns one cycle's verdicts into a single human-readable report,
//!     renders one annotated chart per triggered sensor, and broadcasts the
//!     lot to every registered subscriber.
//!
//! rules:
//!     - nothing triggered -> the canonical "no anomaly" report, no delivery
//!     - one fragment per triggered sensor, joined with "; "
//!     - a chart that comes back empty (no data in the look-back window) is
//!       skipped for that sensor only; a renderer error is logged and skipped
//!     - one recipient failing never stops delivery to the others
//!
//! relationships:
//!     - consumes: DetectionVerdict from detector.rs
//!     - calls: chart.rs (ChartRenderer), notify.rs (Notifier)
//!     - reads: subscribers.rs (SubscriberRegistry)
//!
//! ==============================================================================

use crate::chart::{ChartImage, ChartRenderer};
use crate::domain::{DetectionVerdict, Direction, SensorId, TimeRange};
use crate::error::DeliveryError;
use crate::notify::Notifier;
use crate::subscribers::SubscriberRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const NO_ANOMALY_TEXT: &str = "No sharp change detected or not enough data.";
pub const REPORT_PREFIX: &str = "Sharp change detected: ";
pub const BROADCAST_PREFIX: &str = "Automatic alert! ";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Fragment {
    pub sensor_id: SensorId,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertReport {
    pub triggered: bool,
    pub text: String,
    pub fragments: Vec<Fragment>,
}

/// outcome of one broadcast
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub recipients: usize,
    pub delivered: usize,
    pub charts: usize,
    pub failures: Vec<DeliveryError>,
    /// set when the subscriber list itself could not be read
    pub registry_error: Option<String>,
}

/// `<label> (<direction>: change <mag><unit>, current <cur><unit>[, reference <ref><unit>])`
pub fn fragment(verdict: &DetectionVerdict) -> String {
    let unit = verdict.sensor_id.unit();
    let direction = match verdict.direction {
        Direction::None => "change",
        Direction::Increase => "increase",
        Direction::Decrease => "decrease",
    };
    let mut text = format!(
        "{} ({}: change {:.2}{unit}",
        verdict.sensor_id.label(),
        direction,
        verdict.magnitude.unwrap_or(0.0)
    );
    if let Some(current) = verdict.current_value {
        text.push_str(&format!(", current {current:.2}{unit}"));
    }
    if let Some(reference) = verdict.reference_value {
        text.push_str(&format!(", reference {reference:.2}{unit}"));
    }
    text.push(')');
    text
}

/// compose the report for one cycle
pub fn compose(verdicts: &[DetectionVerdict]) -> AlertReport {
    let fragments: Vec<Fragment> = verdicts
        .iter()
        .filter(|v| v.triggered())
        .map(|v| Fragment { sensor_id: v.sensor_id, text: fragment(v) })
        .collect();

    if fragments.is_empty() {
        return AlertReport { triggered: false, text: NO_ANOMALY_TEXT.to_string(), fragments };
    }

    let joined = fragments.iter().map(|f| f.text.as_str()).collect::<Vec<_>>().join("; ");
    AlertReport {
        triggered: true,
        text: format!("{REPORT_PREFIX}{joined}"),
        fragments,
    }
}

pub struct AlertDispatcher {
    renderer: Arc<dyn ChartRenderer>,
    notifier: Arc<dyn Notifier>,
    subscribers: Arc<SubscriberRegistry>,
    lookback_minutes: u64,
}

impl AlertDispatcher {
    pub fn new(
        renderer: Arc<dyn ChartRenderer>,
        notifier: Arc<dyn Notifier>,
        subscribers: Arc<SubscriberRegistry>,
        lookback_minutes: u64,
    ) -> Self {
        Self { renderer, notifier, subscribers, lookback_minutes }
    }

    /// one annotated chart per triggered sensor; empty windows are skipped
    pub fn render_charts(&self, report: &AlertReport, now: DateTime<Utc>) -> Vec<ChartImage> {
        let range = TimeRange::last_minutes(now, self.lookback_minutes);
        let mut charts = Vec::new();
        for fragment in &report.fragments {
            match self.renderer.render(fragment.sensor_id, range, Some(&fragment.text)) {
                Ok(Some(chart)) => charts.push(chart),
                Ok(None) => {
                    tracing::info!(sensor = %fragment.sensor_id, "[DISPATCH] No chart for sensor");
                }
                Err(e) => {
                    tracing::error!(sensor = %fragment.sensor_id, error = %e, "[DISPATCH] Chart rendering failed");
                }
            }
        }
        charts
    }

    /// plain chart of one sensor over an arbitrary window, no annotation
    pub fn render_period(&self, sensor: SensorId, range: TimeRange) -> anyhow::Result<Option<ChartImage>> {
        self.renderer.render(sensor, range, None)
    }

    /// deliver the report and charts to every subscriber, isolating failures
    pub async fn broadcast(&self, text: &str, report: &AlertReport, charts: &[ChartImage]) -> DispatchSummary {
        let recipients = match self.subscribers.list() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "[DISPATCH] Could not load subscribers");
                return DispatchSummary {
                    charts: charts.len(),
                    registry_error: Some(e.to_string()),
                    ..DispatchSummary::default()
                };
            }
        };

        let mut summary = DispatchSummary {
            recipients: recipients.len(),
            charts: charts.len(),
            ..DispatchSummary::default()
        };

        for subscriber in &recipients {
            match self.deliver(&subscriber.recipient, text, report, charts).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        recipient = %subscriber.recipient,
                        channel = self.notifier.channel_name(),
                        error = %e,
                        "[DISPATCH] Delivery failed"
                    );
                    summary.failures.push(e);
                }
            }
        }

        tracing::info!(
            recipients = summary.recipients,
            delivered = summary.delivered,
            failed = summary.failures.len(),
            charts = summary.charts,
            "[DISPATCH] Broadcast finished"
        );
        summary
    }

    async fn deliver(
        &self,
        recipient: &str,
        text: &str,
        report: &AlertReport,
        charts: &[ChartImage],
    ) -> Result<(), DeliveryError> {
        self.notifier.notify(recipient, text, None).await?;
        for chart in charts {
            let caption = report
                .fragments
                .iter()
                .find(|f| f.sensor_id == chart.sensor_id)
                .map(|f| f.text.as_str())
                .unwrap_or("");
            self.notifier.notify(recipient, caption, Some(chart)).await?;
        }
        Ok(())
    }

    /// periodic path: compose, and only when something triggered, chart and
    /// broadcast. returns the report and, when sent, the delivery summary.
    pub async fn dispatch(
        &self,
        verdicts: &[DetectionVerdict],
        now: DateTime<Utc>,
    ) -> (AlertReport, Option<DispatchSummary>) {
        let report = compose(verdicts);
        if !report.triggered {
            tracing::info!("[DISPATCH] {}", report.text);
            return (report, None);
        }

        let charts = self.render_charts(&report, now);
        let text = format!("{BROADCAST_PREFIX}{}", report.text);
        let summary = self.broadcast(&text, &report, &charts).await;
        (report, Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VerdictStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn verdict(sensor: SensorId, status: VerdictStatus, direction: Direction) -> DetectionVerdict {
        DetectionVerdict {
            sensor_id: sensor,
            status,
            magnitude: Some(3.0),
            direction,
            current_value: Some(8.0),
            reference_value: if sensor == SensorId::ThermalFlow { Some(1.0) } else { None },
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String, bool)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, recipient: &str, text: &str, image: Option<&ChartImage>) -> Result<(), DeliveryError> {
            if self.fail_for.as_deref() == Some(recipient) {
                return Err(DeliveryError::Other { recipient: recipient.into(), reason: "unreachable".into() });
            }
            self.sent.lock().unwrap().push((recipient.into(), text.into(), image.is_some()));
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "recorder"
        }
    }

    /// returns a chart for thermal flow only
    struct PartialRenderer;

    impl ChartRenderer for PartialRenderer {
        fn render(&self, sensor: SensorId, _range: TimeRange, _annotation: Option<&str>) -> anyhow::Result<Option<ChartImage>> {
            Ok((sensor == SensorId::ThermalFlow).then(|| ChartImage { sensor_id: sensor, path: "tf.svg".into() }))
        }
    }

    fn dispatcher(dir: &TempDir, notifier: Arc<Recorder>, recipients: &[&str]) -> AlertDispatcher {
        let registry = Arc::new(SubscriberRegistry::open(&dir.path().join("d.db")).unwrap());
        for r in recipients {
            registry.add(r).unwrap();
        }
        AlertDispatcher::new(Arc::new(PartialRenderer), notifier, registry, 360)
    }

    #[test]
    fn calm_cycle_yields_canonical_report() {
        let report = compose(&[
            verdict(SensorId::ThermalFlow, VerdictStatus::Calm, Direction::None),
            DetectionVerdict::insufficient(SensorId::IndoorTemp),
        ]);
        assert!(!report.triggered);
        assert_eq!(report.text, NO_ANOMALY_TEXT);
        assert!(report.fragments.is_empty());
    }

    #[test]
    fn report_concatenates_triggered_fragments() {
        let report = compose(&[
            verdict(SensorId::ThermalFlow, VerdictStatus::Triggered, Direction::Increase),
            verdict(SensorId::Humidity, VerdictStatus::Calm, Direction::None),
            verdict(SensorId::IndoorTemp, VerdictStatus::Triggered, Direction::Decrease),
        ]);
        assert!(report.triggered);
        assert_eq!(report.fragments.len(), 2);
        assert_eq!(
            report.text,
            "Sharp change detected: outdoor thermal flow (increase: change 3.00°C, current 8.00°C, reference 1.00°C); \
             indoor temperature (decrease: change 3.00°C, current 8.00°C)"
        );
    }

    #[tokio::test]
    async fn calm_cycle_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(Recorder::default());
        let d = dispatcher(&dir, notifier.clone(), &["a", "b"]);

        let (report, summary) = d
            .dispatch(&[verdict(SensorId::ThermalFlow, VerdictStatus::Calm, Direction::None)], Utc::now())
            .await;
        assert!(!report.triggered);
        assert!(summary.is_none());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_chart_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(Recorder::default());
        let d = dispatcher(&dir, notifier.clone(), &["a"]);

        let (_, summary) = d
            .dispatch(
                &[
                    verdict(SensorId::ThermalFlow, VerdictStatus::Triggered, Direction::Increase),
                    verdict(SensorId::IndoorTemp, VerdictStatus::Triggered, Direction::Increase),
                ],
                Utc::now(),
            )
            .await;
        let summary = summary.unwrap();
        assert_eq!(summary.charts, 1);
        assert_eq!(summary.delivered, 1);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.starts_with(BROADCAST_PREFIX));
        assert!(!sent[0].2);
        assert!(sent[1].1.starts_with("outdoor thermal flow"));
        assert!(sent[1].2);
    }

    #[tokio::test]
    async fn unreadable_registry_is_reported_not_mistaken_for_no_subscribers() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(Recorder::default());
        let d = dispatcher(&dir, notifier.clone(), &["a"]);
        rusqlite::Connection::open(dir.path().join("d.db"))
            .unwrap()
            .execute_batch("DROP TABLE subscribers")
            .unwrap();

        let (_, summary) = d
            .dispatch(&[verdict(SensorId::IndoorTemp, VerdictStatus::Triggered, Direction::Increase)], Utc::now())
            .await;
        let summary = summary.unwrap();
        assert_eq!(summary.recipients, 0);
        assert!(summary.registry_error.is_some());
        assert!(notifier.sent.lock().unwrap().is_empty());

        let empty = TempDir::new().unwrap();
        let (_, summary) = dispatcher(&empty, Arc::new(Recorder::default()), &[])
            .dispatch(&[verdict(SensorId::IndoorTemp, VerdictStatus::Triggered, Direction::Increase)], Utc::now())
            .await;
        assert!(summary.unwrap().registry_error.is_none());
    }

    #[tokio::test]
    async fn one_failing_recipient_does_not_block_the_rest() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(Recorder { fail_for: Some("b".into()), ..Recorder::default() });
        let d = dispatcher(&dir, notifier.clone(), &["a", "b", "c", "d"]);

        let (_, summary) = d
            .dispatch(&[verdict(SensorId::IndoorTemp, VerdictStatus::Triggered, Direction::Increase)], Utc::now())
            .await;
        let summary = summary.unwrap();
        assert_eq!(summary.recipients, 4);
        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.failures.len(), 1);

        let mut reached: Vec<String> = notifier.sent.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        reached.dedup();
        assert_eq!(reached, vec!["a", "c", "d"]);
    }
}

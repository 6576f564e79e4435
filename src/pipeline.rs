//! ==============================================================================
//! pipeline.rs - shared handle to the detection/dispatch core
//! ==============================================================================
//!
//! purpose:
//!     one clone-able handle that the scheduler and the http api both hold.
//!     it owns the detector and dispatcher and guarantees that at most one
//!     detection cycle is in flight at a time, whoever asked for it.
//!
//! cycle kinds:
//!     - scheduled (`run_cycle`): evaluate, and broadcast when triggered
//!     - on-demand (`check`): evaluate, compose, render charts, no broadcast
//!
//! relationships:
//!     - used by: scheduler.rs, api.rs, main.rs
//!     - calls: detector.rs, dispatch.rs
//!
//! ==============================================================================

use crate::chart::ChartImage;
use crate::detector::AnomalyDetector;
use crate::dispatch::{compose, AlertDispatcher, AlertReport};
use crate::domain::{DetectionVerdict, SensorId, TimeRange};
use crate::error::StoreError;
use crate::ingest::{IngestCounts, IngestStats};
use crate::source::ConnectionState;
use crate::store::ReadingStore;
use crate::subscribers::SubscriberRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// what the last scheduled cycle did, for /api/status
#[derive(Clone, Debug, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub triggered: bool,
    pub report: String,
    pub verdicts: Vec<DetectionVerdict>,
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
    pub charts: usize,
    /// subscriber list unreadable; nobody was attempted
    pub registry_error: Option<String>,
}

/// result of an on-demand check
#[derive(Clone, Debug, Serialize)]
pub struct CheckOutcome {
    pub report: AlertReport,
    pub verdicts: Vec<DetectionVerdict>,
    pub charts: Vec<ChartImage>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub connection: Option<ConnectionState>,
    pub ingest: Option<IngestCounts>,
    pub cycles: u64,
    pub last_cycle: Option<CycleSummary>,
}

struct Inner {
    store: Arc<ReadingStore>,
    subscribers: Arc<SubscriberRegistry>,
    detector: AnomalyDetector,
    dispatcher: AlertDispatcher,
    // held for the whole of a cycle, scheduled or on-demand
    cycle_lock: tokio::sync::Mutex<()>,
    history: Mutex<(u64, Option<CycleSummary>)>,
    connection: Option<watch::Receiver<ConnectionState>>,
    ingest: Option<Arc<IngestStats>>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        store: Arc<ReadingStore>,
        subscribers: Arc<SubscriberRegistry>,
        detector: AnomalyDetector,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self::with_status(store, subscribers, detector, dispatcher, None, None)
    }

    pub fn with_status(
        store: Arc<ReadingStore>,
        subscribers: Arc<SubscriberRegistry>,
        detector: AnomalyDetector,
        dispatcher: AlertDispatcher,
        connection: Option<watch::Receiver<ConnectionState>>,
        ingest: Option<Arc<IngestStats>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                subscribers,
                detector,
                dispatcher,
                cycle_lock: tokio::sync::Mutex::new(()),
                history: Mutex::new((0, None)),
                connection,
                ingest,
            }),
        }
    }

    pub fn store(&self) -> &Arc<ReadingStore> {
        &self.inner.store
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.inner.subscribers
    }

    /// scheduled cycle: evaluate every detector, broadcast if anything fired
    pub async fn run_cycle(&self) -> Result<CycleSummary, StoreError> {
        let _cycle = self.inner.cycle_lock.lock().await;
        let started_at = Utc::now();

        let verdicts = self.inner.detector.evaluate().await?;
        let (report, delivery) = self.inner.dispatcher.dispatch(&verdicts, started_at).await;
        let delivery = delivery.unwrap_or_default();

        let summary = CycleSummary {
            started_at,
            finished_at: Utc::now(),
            triggered: report.triggered,
            report: report.text,
            verdicts,
            recipients: delivery.recipients,
            delivered: delivery.delivered,
            failed: delivery.failures.len(),
            charts: delivery.charts,
            registry_error: delivery.registry_error,
        };

        let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        history.0 += 1;
        history.1 = Some(summary.clone());
        Ok(summary)
    }

    /// on-demand check: same evaluation, charts rendered, nothing sent
    pub async fn check(&self) -> Result<CheckOutcome, StoreError> {
        let _cycle = self.inner.cycle_lock.lock().await;
        let verdicts = self.inner.detector.evaluate().await?;
        let report = compose(&verdicts);
        let charts = if report.triggered {
            self.inner.dispatcher.render_charts(&report, Utc::now())
        } else {
            Vec::new()
        };
        tracing::info!(triggered = report.triggered, charts = charts.len(), "[CHECK] On-demand check finished");
        Ok(CheckOutcome { report, verdicts, charts })
    }

    /// un-annotated chart for the last `minutes`; None when the window is empty
    pub fn period_chart(&self, sensor: SensorId, minutes: u64) -> anyhow::Result<Option<ChartImage>> {
        let range = TimeRange::last_minutes(Utc::now(), minutes);
        self.inner.dispatcher.render_period(sensor, range)
    }

    pub fn status(&self) -> PipelineStatus {
        let (cycles, last_cycle) = self.inner.history.lock().unwrap_or_else(|e| e.into_inner()).clone();
        PipelineStatus {
            connection: self.inner.connection.as_ref().map(|rx| *rx.borrow()),
            ingest: self.inner.ingest.as_ref().map(|s| s.snapshot()),
            cycles,
            last_cycle,
        }
    }
}

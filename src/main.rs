//! ==============================================================================
//! main.rs - thermowatch entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the pipeline together and keeps it running.
//!
//! responsibilities:
//!     - load configuration and install logging
//!     - open the reading store and subscriber registry (the only fatal step)
//!     - spawn the reading source, the ingestion loop, the scheduler and the
//!       optional operator api as independent tasks
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                      thermowatch (this file)                  │
//!     │  ┌─────────────┐  mpsc  ┌─────────────┐                       │
//!     │  │   source    │ ─────▶ │   ingest    │ ──▶ store (sqlite)    │
//!     │  │ mqtt/synth  │        └─────────────┘          ▲            │
//!     │  └─────────────┘                                 │ reads      │
//!     │  ┌─────────────┐        ┌──────────────────────────┴───────┐  │
//!     │  │  scheduler  │ ─────▶ │ pipeline (detector + dispatcher) │  │
//!     │  └─────────────┘        └──────────────────────────▲───────┘  │
//!     │  ┌─────────────┐                                 │            │
//!     │  │ api (:3000) │ ────────────────────────────────┘            │
//!     │  └─────────────┘                                              │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use thermowatch::{
    api,
    chart::SvgChartRenderer,
    config::{AppConfig, SourceKind},
    detector::AnomalyDetector,
    dispatch::AlertDispatcher,
    ingest::Ingestor,
    logging, notify,
    pipeline::Pipeline,
    reference,
    scheduler::Scheduler,
    source::{MqttSource, ReadingSource, SyntheticSource},
    store::ReadingStore,
    subscribers::SubscriberRegistry,
};
use tokio::sync::mpsc;

const INGEST_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  thermowatch - sensor spike detection and alerting");
    println!("===========================================================");

    // step 1: configuration, then logging at the configured level
    let config = AppConfig::load_or_default().context("failed to load configuration")?;
    logging::init(&config.logging.level)?;
    config.log_summary();

    // step 2: persistence. failing here is the one fatal error.
    let store = Arc::new(
        ReadingStore::open(&config.storage.path)
            .with_context(|| format!("failed to open reading store at {}", config.storage.path.display()))?,
    );
    let subscribers = Arc::new(
        SubscriberRegistry::open(&config.storage.path).context("failed to open subscriber registry")?,
    );
    for recipient in &config.notify.recipients {
        if subscribers.add(recipient)? {
            tracing::info!(recipient = %recipient, "[STARTUP] Registered subscriber from config");
        }
    }
    tracing::info!("[STARTUP] ✓ Store ready");

    // step 3: reading source + ingestion
    let (tx, rx) = mpsc::channel(INGEST_QUEUE);
    let (mut source, connection) = match config.source.kind {
        SourceKind::Mqtt => {
            let mqtt = MqttSource::new(config.broker.clone(), config.topics.clone(), config.reconnect_backoff());
            let state = mqtt.state();
            (Box::new(mqtt) as Box<dyn ReadingSource>, Some(state))
        }
        SourceKind::Synthetic => {
            let interval = Duration::from_secs(config.source.interval_seconds.max(1));
            (Box::new(SyntheticSource::new(config.topics.clone(), interval)) as Box<dyn ReadingSource>, None)
        }
    };
    tracing::info!(source = source.name(), "[STARTUP] ✓ Reading source selected");

    let ingestor = Ingestor::new(config.topics.clone(), store.clone(), config.logging.show_sensor_data);
    let ingest_stats = ingestor.stats();

    // step 4: detection and dispatch
    let reference: Arc<dyn reference::ReferenceProvider> = Arc::from(reference::from_config(&config.reference)?);
    let notifier: Arc<dyn notify::Notifier> = Arc::from(notify::from_config(&config.notify)?);
    tracing::info!(channel = notifier.channel_name(), "[STARTUP] ✓ Notifier ready");

    let renderer = Arc::new(SvgChartRenderer::new(store.clone(), config.alerts.chart_dir.clone()));
    let detector = AnomalyDetector::new(store.clone(), reference, config.detectors.clone());
    let dispatcher = AlertDispatcher::new(renderer, notifier, subscribers.clone(), config.alerts.chart_lookback_minutes);
    let pipeline = Pipeline::with_status(store, subscribers, detector, dispatcher, connection, Some(ingest_stats));

    // step 5: spawn everything
    let source_task = tokio::spawn(async move { source.run(tx).await });
    let ingest_task = tokio::spawn(ingestor.run(rx));
    let scheduler_task = tokio::spawn(
        Scheduler::new(
            pipeline.clone(),
            Duration::from_secs(config.scheduler.interval_seconds),
            Duration::from_secs(config.scheduler.first_delay_seconds),
        )
        .run(),
    );

    if config.api.enabled {
        let bind = config.api.bind.clone();
        let api_pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run_server(&bind, api_pipeline).await {
                tracing::error!(error = %e, "[API] Server error");
            }
        });
        tracing::info!(bind = %config.api.bind, "[STARTUP] ✓ Operator api enabled");
    }

    println!("────────────────────────────────────────────────────────────");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[SHUTDOWN] Interrupt received");
        }
        r = source_task => tracing::error!(result = ?r, "[SHUTDOWN] Reading source stopped"),
        r = ingest_task => tracing::error!(result = ?r, "[SHUTDOWN] Ingestion stopped"),
        r = scheduler_task => tracing::error!(result = ?r, "[SHUTDOWN] Scheduler stopped"),
    }
    Ok(())
}

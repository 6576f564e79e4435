//! ==============================================================================
//! source.rs - Reading Source Abstraction
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for where raw sensor messages come from.
//!     abstracts away the difference between a live mqtt broker and the
//!     synthetic generator used for demos and development machines.
//!
//! design:
//!     - one trait, two implementations, selected by `source.kind`
//!     - both emit RawMessage on the configured topics, so the rest of the
//!       pipeline (ingest.rs onwards) cannot tell them apart
//!     - the broker source runs an explicit reconnect state machine:
//!
//! ```text
//!         disconnected ──attempt──▶ connecting ──connack──▶ connected
//!              ▲                        │                       │
//!              └────────── failure ─────┴───────────────────────┘
//!
//!       with a constant backoff between attempts and no terminal state.
//! ```
//!
//! relationships:
//!     - used by: main.rs (spawned as its own task)
//!     - feeds: ingest.rs (mpsc channel)
//!     - publishes: ConnectionState on a watch channel (read by api.rs)
//!
//! ==============================================================================

use crate::config::{BrokerConfig, TopicsConfig};
use crate::domain::SensorId;
use crate::error::ConnectError;
use crate::ingest::RawMessage;
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[async_trait]
pub trait ReadingSource: Send {
    /// short name for logs
    fn name(&self) -> &'static str;

    /// produce messages until the receiving side goes away
    async fn run(&mut self, tx: mpsc::Sender<RawMessage>);
}

// ==============================================================================
// connection state machine
// ==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// a connect attempt has started
    Attempt,
    /// broker acknowledged the connection
    Established,
    /// connect failed or an established link dropped
    Lost,
}

impl ConnectionState {
    pub fn on(self, event: LinkEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::Disconnected, LinkEvent::Attempt) => ConnectionState::Connecting,
            (ConnectionState::Connecting, LinkEvent::Established) => ConnectionState::Connected,
            (_, LinkEvent::Lost) => ConnectionState::Disconnected,
            (state, _) => state,
        }
    }
}

// ==============================================================================
// LIVE BROKER
// ==============================================================================

pub struct MqttSource {
    broker: BrokerConfig,
    topics: TopicsConfig,
    backoff: Duration,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
}

impl MqttSource {
    pub fn new(broker: BrokerConfig, topics: TopicsConfig, backoff: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            topics,
            backoff,
            state: ConnectionState::Disconnected,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn transition(&mut self, event: LinkEvent) {
        let next = self.state.on(event);
        if next != self.state {
            tracing::info!(from = ?self.state, to = ?next, "[MQTT] Connection state");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.broker.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(Duration::from_secs(self.broker.keep_alive_seconds.max(5)));
        options.set_clean_session(true);
        options
    }

    fn subscribe_all(&self, client: &AsyncClient) {
        for (sensor, topic) in self.topics.iter() {
            match client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => tracing::info!(sensor = %sensor, topic, "[MQTT] Subscribed"),
                Err(e) => tracing::error!(topic, error = %e, "[MQTT] Subscribe failed"),
            }
        }
    }
}

#[async_trait]
impl ReadingSource for MqttSource {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn run(&mut self, tx: mpsc::Sender<RawMessage>) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);

        loop {
            if self.state == ConnectionState::Disconnected {
                self.transition(LinkEvent::Attempt);
            }

            // rumqttc reconnects on the next poll after an error
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.transition(LinkEvent::Established);
                    self.subscribe_all(&client);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = RawMessage::new(publish.topic, publish.payload.to_vec());
                    if tx.send(message).await.is_err() {
                        tracing::warn!("[MQTT] Ingestion channel closed, stopping");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let err = ConnectError {
                        host: self.broker.host.clone(),
                        port: self.broker.port,
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %err, retry_in_s = self.backoff.as_secs(), "[MQTT] Connection lost");
                    self.transition(LinkEvent::Lost);
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

// ==============================================================================
// SYNTHETIC GENERATOR (for development machines without a broker)
// ==============================================================================

/// emits plausible readings for every mapped sensor each tick; every second
/// tick the indoor temperature jumps into 30-35 °C so the detectors have
/// something to find.
pub struct SyntheticSource {
    topics: TopicsConfig,
    interval: Duration,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(topics: TopicsConfig, interval: Duration) -> Self {
        Self { topics, interval, tick: 0 }
    }

    /// one batch of messages for the current tick
    pub fn next_batch(&mut self) -> Vec<RawMessage> {
        self.tick += 1;
        let spike = self.tick % 2 == 0;
        let mut rng = rand::thread_rng();

        self.topics
            .iter()
            .map(|(sensor, topic)| {
                let value: f64 = match sensor {
                    SensorId::IndoorTemp if spike => rng.gen_range(30.0..35.0),
                    SensorId::IndoorTemp => rng.gen_range(18.0..25.0),
                    SensorId::Humidity => rng.gen_range(30.0..60.0),
                    SensorId::ThermalFlow => rng.gen_range(0.0..50.0),
                };
                RawMessage::new(topic, format!("{value:.2}"))
            })
            .collect()
    }
}

#[async_trait]
impl ReadingSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn run(&mut self, tx: mpsc::Sender<RawMessage>) {
        tracing::info!(interval_s = self.interval.as_secs(), "[SYNTHETIC] Generating readings");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for message in self.next_batch() {
                if tx.send(message).await.is_err() {
                    tracing::warn!("[SYNTHETIC] Ingestion channel closed, stopping");
                    return;
                }
            }
        }
    }
}

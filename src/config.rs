//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `thermowatch.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BrokerConfig: where the mqtt broker lives and how fast to retry it.
//!     - SourceConfig: live broker or synthetic generator.
//!     - TopicsConfig: topic -> sensor mapping (process lifetime, static).
//!     - ReferenceConfig: outdoor temperature lookup (coordinates, timeout, fallback).
//!     - SchedulerConfig / AlertsConfig: detection cadence and chart look-back.
//!     - DetectorConfig: which sensor is reference-aware and which is local-only.
//!     - NotifyConfig / ApiConfig / LoggingConfig: outer surfaces.
//!
//! ==============================================================================

use crate::domain::SensorId;
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub source: SourceConfig,
    pub topics: TopicsConfig,
    pub storage: StorageConfig,
    pub reference: ReferenceConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertsConfig,
    pub detectors: Vec<DetectorConfig>,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_seconds: u64,
    /// constant delay between reconnect attempts
    pub reconnect_backoff_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Mqtt,
    Synthetic,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// tick for the synthetic generator
    pub interval_seconds: u64,
}

/// sensor -> topic. one text topic per sensor.
#[derive(Debug, Deserialize, Clone)]
#[serde(transparent)]
pub struct TopicsConfig(pub BTreeMap<SensorId, String>);

impl TopicsConfig {
    pub fn topic_for(&self, sensor: SensorId) -> Option<&str> {
        self.0.get(&sensor).map(String::as_str)
    }

    pub fn sensor_for(&self, topic: &str) -> Option<SensorId> {
        self.0.iter().find(|(_, t)| t.as_str() == topic).map(|(s, _)| *s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SensorId, &str)> {
        self.0.iter().map(|(s, t)| (*s, t.as_str()))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    OpenMeteo,
    Fixed,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReferenceConfig {
    pub kind: ReferenceKind,
    pub endpoint: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timeout_seconds: u64,
    /// returned whenever the lookup fails (and always, for kind = "fixed")
    pub fallback: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_seconds: u64,
    pub first_delay_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    /// chart look-back, independent of the 5-reading detection window
    pub chart_lookback_minutes: u64,
    pub chart_dir: PathBuf,
}

/// one monitored sensor and the rule applied to it
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    ReferenceAware {
        sensor: SensorId,
        spike_threshold: f64,
        margin: f64,
    },
    Local {
        sensor: SensorId,
        threshold: f64,
    },
}

impl DetectorConfig {
    pub fn sensor(&self) -> SensorId {
        match self {
            DetectorConfig::ReferenceAware { sensor, .. } => *sensor,
            DetectorConfig::Local { sensor, .. } => *sensor,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    Log,
    Webhook,
    Telegram,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub webhook_url: Option<String>,
    pub telegram_token: Option<String>,
    pub timeout_seconds: u64,
    /// seeded into the subscriber registry at startup
    pub recipients: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

// ==============================================================================
// defaults
// ==============================================================================

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "thermowatch".to_string(),
            keep_alive_seconds: 30,
            reconnect_backoff_seconds: 5,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { kind: SourceKind::Mqtt, interval_seconds: 60 }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        let mut topics = BTreeMap::new();
        topics.insert(SensorId::IndoorTemp, "sensors/temperature".to_string());
        topics.insert(SensorId::Humidity, "sensors/humidity".to_string());
        topics.insert(SensorId::ThermalFlow, "sensors/thermal".to_string());
        Self(topics)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("sensor_data.db") }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            kind: ReferenceKind::OpenMeteo,
            endpoint: "https://api.open-meteo.com/v1/forecast".to_string(),
            latitude: 55.0084,
            longitude: 82.9357,
            timeout_seconds: 10,
            fallback: 5.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_seconds: 300, first_delay_seconds: 10 }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { chart_lookback_minutes: 360, chart_dir: PathBuf::from("charts") }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::Log,
            webhook_url: None,
            telegram_token: None,
            timeout_seconds: 10,
            recipients: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

/// reference-aware on the outdoor sensor, local-only on the indoor one
pub fn default_detectors() -> Vec<DetectorConfig> {
    vec![
        DetectorConfig::ReferenceAware {
            sensor: SensorId::ThermalFlow,
            spike_threshold: 2.0,
            margin: 5.0,
        },
        DetectorConfig::Local { sensor: SensorId::IndoorTemp, threshold: 10.0 },
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            source: SourceConfig::default(),
            topics: TopicsConfig::default(),
            storage: StorageConfig::default(),
            reference: ReferenceConfig::default(),
            scheduler: SchedulerConfig::default(),
            alerts: AlertsConfig::default(),
            detectors: default_detectors(),
            notify: NotifyConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ==============================================================================
// loading
// ==============================================================================

impl AppConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse and validate a toml document
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback.
    ///
    /// `THERMOWATCH_CONFIG` wins when set; a broken explicit file is an error
    /// rather than a silent fallback.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        if let Ok(explicit) = std::env::var("THERMOWATCH_CONFIG") {
            let config = Self::load(&explicit)?;
            tracing::info!(path = %explicit, "[CONFIG] Loaded");
            return Ok(config);
        }

        let paths = [
            PathBuf::from("config").join("thermowatch.toml"),
            PathBuf::from("..").join("config").join("thermowatch.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "[CONFIG] Loaded");
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "[CONFIG] Failed to load");
                    }
                }
            }
        }

        tracing::warn!("[CONFIG] No config file found - using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.scheduler.interval_seconds == 0 {
            return invalid("scheduler.interval_seconds must be > 0".into());
        }
        if self.broker.reconnect_backoff_seconds == 0 {
            return invalid("broker.reconnect_backoff_seconds must be > 0".into());
        }
        if self.source.kind == SourceKind::Synthetic && self.source.interval_seconds == 0 {
            return invalid("source.interval_seconds must be > 0".into());
        }
        if self.reference.timeout_seconds == 0 {
            return invalid("reference.timeout_seconds must be > 0".into());
        }

        let mut seen = HashSet::new();
        for (sensor, topic) in self.topics.iter() {
            if topic.is_empty() {
                return invalid(format!("topic for {sensor} is empty"));
            }
            if !seen.insert(topic) {
                return invalid(format!("topic '{topic}' is mapped to more than one sensor"));
            }
        }

        let mut monitored = HashSet::new();
        for detector in &self.detectors {
            let sensor = detector.sensor();
            if self.topics.topic_for(sensor).is_none() {
                return invalid(format!("detector on {sensor} but no topic is mapped to it"));
            }
            if !monitored.insert(sensor) {
                return invalid(format!("more than one detector on {sensor}"));
            }
            let negative = match detector {
                DetectorConfig::ReferenceAware { spike_threshold, margin, .. } => {
                    *spike_threshold < 0.0 || *margin < 0.0
                }
                DetectorConfig::Local { threshold, .. } => *threshold < 0.0,
            };
            if negative {
                return invalid(format!("detector on {sensor} has a negative threshold"));
            }
        }

        match self.notify.kind {
            NotifyKind::Webhook if self.notify.webhook_url.is_none() => {
                invalid("notify.kind = \"webhook\" needs notify.webhook_url".into())
            }
            NotifyKind::Telegram if self.notify.telegram_token.is_none() => {
                invalid("notify.kind = \"telegram\" needs notify.telegram_token".into())
            }
            _ => Ok(()),
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.broker.reconnect_backoff_seconds)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            source = ?self.source.kind,
            broker = %format!("{}:{}", self.broker.host, self.broker.port),
            storage = %self.storage.path.display(),
            "[CONFIG] pipeline"
        );
        tracing::info!(
            interval_s = self.scheduler.interval_seconds,
            first_delay_s = self.scheduler.first_delay_seconds,
            lookback_min = self.alerts.chart_lookback_minutes,
            detectors = self.detectors.len(),
            notify = ?self.notify.kind,
            "[CONFIG] detection"
        );
        for detector in &self.detectors {
            tracing::info!(detector = ?detector, "[CONFIG] detector");
        }
    }
}

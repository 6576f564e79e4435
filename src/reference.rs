//! outdoor reference temperature.
//!
//! `fetch()` never fails: any timeout, http error or malformed body turns into
//! the configured fallback so the reference-aware detector always has a value.

use crate::config::{ReferenceConfig, ReferenceKind};
use crate::error::ReferenceFetchError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait ReferenceProvider: Send + Sync {
    async fn fetch(&self) -> f64;
}

/// constant reference, for offline sites and tests
pub struct FixedReference(pub f64);

#[async_trait]
impl ReferenceProvider for FixedReference {
    async fn fetch(&self) -> f64 {
        self.0
    }
}

/// key-less open-meteo "current weather" lookup
pub struct OpenMeteoProvider {
    client: reqwest::Client,
    url: String,
    fallback: f64,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current_weather: Option<CurrentWeather>,
}

#[derive(Deserialize)]
struct CurrentWeather {
    temperature: Option<f64>,
}

impl OpenMeteoProvider {
    pub fn new(config: &ReferenceConfig) -> Result<Self, ReferenceFetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        let url = format!(
            "{}?latitude={}&longitude={}&current_weather=true",
            config.endpoint.trim_end_matches('?'),
            config.latitude,
            config.longitude
        );
        Ok(Self { client, url, fallback: config.fallback })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// single bounded request; errors are surfaced here and nowhere else
    pub async fn try_fetch(&self) -> Result<f64, ReferenceFetchError> {
        let body: ForecastResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.current_weather
            .and_then(|w| w.temperature)
            .filter(|t| t.is_finite())
            .ok_or(ReferenceFetchError::Malformed)
    }
}

#[async_trait]
impl ReferenceProvider for OpenMeteoProvider {
    async fn fetch(&self) -> f64 {
        match self.try_fetch().await {
            Ok(t) => {
                tracing::debug!(temperature = t, "[REFERENCE] Fetched outdoor temperature");
                t
            }
            Err(e) => {
                tracing::warn!(error = %e, fallback = self.fallback, "[REFERENCE] Lookup failed, using fallback");
                self.fallback
            }
        }
    }
}

/// build the provider selected by config
pub fn from_config(config: &ReferenceConfig) -> anyhow::Result<Box<dyn ReferenceProvider>> {
    Ok(match config.kind {
        ReferenceKind::Fixed => Box::new(FixedReference(config.fallback)),
        ReferenceKind::OpenMeteo => Box::new(OpenMeteoProvider::new(config)?),
    })
}

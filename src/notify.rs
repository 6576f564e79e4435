//! Notification delivery with pluggable channel support.
//!
//! A [`Notifier`] delivers one text (and optionally one chart) to one
//! recipient. Delivery is fire-and-forget from the pipeline's point of view:
//! an error is reported for that recipient only and never retried here.

use crate::chart::ChartImage;
use crate::config::{NotifyConfig, NotifyKind};
use crate::error::DeliveryError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, text: &str, image: Option<&ChartImage>) -> Result<(), DeliveryError>;

    /// Returns the channel type name (e.g. `"webhook"`).
    fn channel_name(&self) -> &str;
}

/// Writes notifications to the log. Default when nothing else is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, text: &str, image: Option<&ChartImage>) -> Result<(), DeliveryError> {
        tracing::info!(
            recipient,
            image = ?image.map(|i| i.path.display().to_string()),
            "[NOTIFY] {text}"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

/// POSTs `{recipient, text, image}` as JSON to a fixed url.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, recipient: &str, text: &str, image: Option<&ChartImage>) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "recipient": recipient,
            "text": text,
            "image": image.map(|i| i.path.display().to_string()),
            "sensor": image.map(|i| i.sensor_id),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|source| DeliveryError::Http { recipient: recipient.to_string(), source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected { recipient: recipient.to_string(), status: status.as_u16() });
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Telegram Bot API: `sendMessage` for text, `sendDocument` for charts.
/// The recipient is the chat id.
pub struct TelegramNotifier {
    client: reqwest::Client,
    base: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_base(format!("https://api.telegram.org/bot{token}"), timeout)
    }

    pub fn with_base(base: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base: base.into(),
        })
    }

    async fn check(recipient: &str, result: Result<reqwest::Response, reqwest::Error>) -> Result<(), DeliveryError> {
        let response = result.map_err(|source| DeliveryError::Http { recipient: recipient.to_string(), source })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected { recipient: recipient.to_string(), status: status.as_u16() })
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: &str, text: &str, image: Option<&ChartImage>) -> Result<(), DeliveryError> {
        match image {
            None => {
                let result = self
                    .client
                    .post(format!("{}/sendMessage", self.base))
                    .json(&serde_json::json!({ "chat_id": recipient, "text": text }))
                    .send()
                    .await;
                Self::check(recipient, result).await
            }
            Some(chart) => {
                let bytes = tokio::fs::read(&chart.path).await.map_err(|source| DeliveryError::Attachment {
                    path: chart.path.display().to_string(),
                    source,
                })?;
                let file_name = chart
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "chart.svg".to_string());
                let form = reqwest::multipart::Form::new()
                    .text("chat_id", recipient.to_string())
                    .text("caption", text.to_string())
                    .part("document", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
                // svg is not accepted by sendPhoto, so charts go out as documents
                let result = self
                    .client
                    .post(format!("{}/sendDocument", self.base))
                    .multipart(form)
                    .send()
                    .await;
                Self::check(recipient, result).await
            }
        }
    }

    fn channel_name(&self) -> &str {
        "telegram"
    }
}

/// build the notifier selected by config
pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Box<dyn Notifier>> {
    let timeout = Duration::from_secs(config.timeout_seconds.max(1));
    Ok(match config.kind {
        NotifyKind::Log => Box::new(LogNotifier),
        NotifyKind::Webhook => {
            let url = config
                .webhook_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("notify.webhook_url is not set"))?;
            Box::new(WebhookNotifier::new(url, timeout)?)
        }
        NotifyKind::Telegram => {
            let token = config
                .telegram_token
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("notify.telegram_token is not set"))?;
            Box::new(TelegramNotifier::new(token, timeout)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn hook(State(seen): State<Seen>, Json(body): Json<serde_json::Value>) -> StatusCode {
        let reject = body["recipient"] == "blocked";
        seen.lock().unwrap().push(body);
        if reject {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::OK
        }
    }

    async fn serve() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new().route("/hook", post(hook)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), seen)
    }

    #[tokio::test]
    async fn webhook_posts_json_body() {
        let (url, seen) = serve().await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        notifier.notify("1001", "hello", None).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["recipient"], "1001");
        assert_eq!(seen[0]["text"], "hello");
        assert!(seen[0]["image"].is_null());
    }

    #[tokio::test]
    async fn webhook_non_success_is_rejected() {
        let (url, _seen) = serve().await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        let err = notifier.notify("blocked", "hello", None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn telegram_missing_chart_is_attachment_error() {
        let notifier = TelegramNotifier::with_base("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let chart = ChartImage {
            sensor_id: crate::domain::SensorId::IndoorTemp,
            path: "/nonexistent/chart.svg".into(),
        };
        let err = notifier.notify("1", "caption", Some(&chart)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Attachment { .. }));
    }

    #[test]
    fn config_selects_channel() {
        let webhook = NotifyConfig {
            kind: NotifyKind::Webhook,
            webhook_url: Some("http://localhost/hook".into()),
            ..NotifyConfig::default()
        };
        assert_eq!(from_config(&webhook).unwrap().channel_name(), "webhook");
        assert_eq!(from_config(&NotifyConfig::default()).unwrap().channel_name(), "log");
    }
}

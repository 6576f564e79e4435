//! ==============================================================================
//! api.rs - operator http surface
//! ==============================================================================
//!
//! purpose:
//!     small json api for looking at the store, running an on-demand check
//!     and managing the subscriber registry.
//!
//! routes:
//!     GET    /api/readings/latest            latest reading per sensor
//!     GET    /api/readings/:sensor?minutes=N range over the last N minutes
//!     GET    /api/charts?minutes=N           period chart for every sensor
//!     GET    /api/charts/:sensor?minutes=N   period chart for one sensor
//!     GET    /api/check                      on-demand cycle, no broadcast
//!     GET    /api/subscribers                list recipients
//!     POST   /api/subscribers                {"recipient": "..."}
//!     DELETE /api/subscribers/:recipient     remove a recipient
//!     GET    /api/status                     connection state + last cycle
//!
//! ==============================================================================

use crate::domain::{SensorId, SensorReading, TimeRange};
use crate::chart::ChartImage;
use crate::pipeline::{CheckOutcome, Pipeline, PipelineStatus};
use crate::subscribers::Subscriber;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::cors::CorsLayer;

const DEFAULT_RANGE_MINUTES: u64 = 60;

/// error body for every failing handler
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

fn parse_sensor(raw: &str) -> std::result::Result<SensorId, ApiError> {
    raw.parse().map_err(|e: crate::domain::UnknownSensor| ApiError::bad_request(e.to_string()))
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{:#}", e.into()) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.message, "[API] Request failed");
        }
        (self.status, Json(serde_json::json!({ "status": "error", "message": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/api/readings/latest", get(latest_handler))
        .route("/api/readings/:sensor", get(range_handler))
        .route("/api/charts", get(all_charts_handler))
        .route("/api/charts/:sensor", get(chart_handler))
        .route("/api/check", get(check_handler))
        .route("/api/subscribers", get(list_subscribers).post(add_subscriber))
        .route("/api/subscribers/:recipient", delete(remove_subscriber))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

pub async fn run_server(bind: &str, pipeline: Pipeline) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "[API] Listening");
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

async fn latest_handler(State(pipeline): State<Pipeline>) -> ApiResult<BTreeMap<SensorId, Option<SensorReading>>> {
    let mut latest = BTreeMap::new();
    for sensor in SensorId::ALL {
        latest.insert(sensor, pipeline.store().latest(sensor)?);
    }
    Ok(Json(latest))
}

#[derive(Deserialize)]
struct RangeParams {
    minutes: Option<u64>,
}

#[derive(Serialize)]
struct RangeBody {
    sensor: SensorId,
    range: TimeRange,
    readings: Vec<SensorReading>,
}

async fn range_handler(
    State(pipeline): State<Pipeline>,
    Path(sensor): Path<String>,
    Query(params): Query<RangeParams>,
) -> ApiResult<RangeBody> {
    let sensor = parse_sensor(&sensor)?;
    let range = TimeRange::last_minutes(Utc::now(), params.minutes.unwrap_or(DEFAULT_RANGE_MINUTES));
    let readings = pipeline.store().range(sensor, range)?;
    Ok(Json(RangeBody { sensor, range, readings }))
}

async fn chart_handler(
    State(pipeline): State<Pipeline>,
    Path(sensor): Path<String>,
    Query(params): Query<RangeParams>,
) -> ApiResult<ChartImage> {
    let sensor = parse_sensor(&sensor)?;
    let minutes = params.minutes.unwrap_or(DEFAULT_RANGE_MINUTES);
    match pipeline.period_chart(sensor, minutes)? {
        Some(chart) => Ok(Json(chart)),
        None => Err(ApiError::not_found(format!("no {sensor} readings in the last {minutes} minutes"))),
    }
}

/// every sensor with data in the window; sensors without data are left out
async fn all_charts_handler(
    State(pipeline): State<Pipeline>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<ChartImage>> {
    let minutes = params.minutes.unwrap_or(DEFAULT_RANGE_MINUTES);
    let mut charts = Vec::new();
    for sensor in SensorId::ALL {
        if let Some(chart) = pipeline.period_chart(sensor, minutes)? {
            charts.push(chart);
        }
    }
    Ok(Json(charts))
}

async fn check_handler(State(pipeline): State<Pipeline>) -> ApiResult<CheckOutcome> {
    Ok(Json(pipeline.check().await?))
}

async fn list_subscribers(State(pipeline): State<Pipeline>) -> ApiResult<Vec<Subscriber>> {
    Ok(Json(pipeline.subscribers().list()?))
}

#[derive(Deserialize)]
struct NewSubscriber {
    recipient: String,
}

async fn add_subscriber(
    State(pipeline): State<Pipeline>,
    Json(body): Json<NewSubscriber>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let recipient = body.recipient.trim();
    if recipient.is_empty() {
        return Err(ApiError::bad_request("recipient must not be empty"));
    }
    let added = pipeline.subscribers().add(recipient)?;
    tracing::info!(recipient, added, "[API] Subscriber registration");
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(serde_json::json!({ "recipient": recipient, "added": added }))))
}

async fn remove_subscriber(
    State(pipeline): State<Pipeline>,
    Path(recipient): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    if pipeline.subscribers().remove(&recipient)? {
        tracing::info!(recipient = %recipient, "[API] Subscriber removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown recipient {recipient}")))
    }
}

async fn status_handler(State(pipeline): State<Pipeline>) -> Json<PipelineStatus> {
    Json(pipeline.status())
}

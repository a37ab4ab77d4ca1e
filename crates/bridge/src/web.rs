use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::control::{parse_source, Dispatcher, FanMode, FanState};
use crate::db::{Db, Device};
use crate::error::Error;
use crate::mqtt::ControlPublisher;
use crate::state::SharedState;

const DEFAULT_READINGS_LIMIT: i64 = 100;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 1000;

pub struct AppState<P> {
    pub db: Db,
    pub dispatcher: Arc<Dispatcher<P>>,
    pub shared: SharedState,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: ControlPublisher> AppState<P> {
    pub fn new(db: Db, publisher: P, shared: SharedState) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(db.clone(), publisher)),
            db,
            shared,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body `{"success": false, "error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Device not found".to_string(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) | Error::Decode(msg) => ApiError::bad_request(msg),
            Error::NotFound(_) => ApiError::not_found(),
            Error::Publish { .. } => ApiError::internal("Failed to send control command"),
            Error::Storage(_) | Error::Migration(_) => {
                error!("API storage error: {err}");
                ApiError::internal("Internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceBody {
    name: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<i64>,
}

fn resolve_limit(limit: Option<i64>, default: i64) -> Result<i64, ApiError> {
    match limit {
        None => Ok(default),
        Some(n) if n < 1 => Err(ApiError::bad_request("limit must be at least 1")),
        Some(n) => Ok(n.min(MAX_LIMIT)),
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<P: ControlPublisher + 'static>(state: AppState<P>) -> Router {
    Router::new()
        .route("/health", get(health::<P>))
        .route("/status", get(status::<P>))
        .route("/devices", get(list_devices::<P>))
        .route("/devices/{id}", get(get_device::<P>).put(update_device::<P>))
        .route("/devices/{id}/sensor-data", get(sensor_data::<P>))
        .route("/devices/{id}/control-history", get(control_history::<P>))
        .route("/control/{id}/fan", post(control_fan::<P>))
        .route("/control/{id}/mode", post(control_mode::<P>))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    success: bool,
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    version: &'static str,
    mqtt_connected: bool,
}

async fn health<P>(State(state): State<AppState<P>>) -> Json<HealthResponse> {
    let mqtt_connected = state.shared.read().await.mqtt_connected;
    Json(HealthResponse {
        success: true,
        status: "ok",
        timestamp: OffsetDateTime::now_utc(),
        version: env!("CARGO_PKG_VERSION"),
        mqtt_connected,
    })
}

async fn status<P>(State(state): State<AppState<P>>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn list_devices<P>(State(state): State<AppState<P>>) -> ApiResult {
    let devices = state.db.list_devices().await?;
    Ok(Json(json!({ "success": true, "devices": devices })))
}

async fn require_device(db: &Db, id: &str) -> Result<Device, ApiError> {
    db.get_device(id).await?.ok_or_else(ApiError::not_found)
}

async fn get_device<P>(State(state): State<AppState<P>>, Path(id): Path<String>) -> ApiResult {
    let device = require_device(&state.db, &id).await?;
    Ok(Json(json!({ "success": true, "device": device })))
}

async fn update_device<P>(
    State(state): State<AppState<P>>,
    Path(id): Path<String>,
    body: Result<Json<UpdateDeviceBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| ApiError::bad_request(format!("No data provided: {e}")))?;

    if body.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("name must not be empty"));
    }

    let device = state
        .db
        .update_device_info(&id, body.name.as_deref(), body.location.as_deref())
        .await?
        .ok_or_else(ApiError::not_found)?;

    info!(device = %id, "device info updated");
    Ok(Json(json!({ "success": true, "device": device })))
}

async fn sensor_data<P>(
    State(state): State<AppState<P>>,
    Path(id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = resolve_limit(query.limit, DEFAULT_READINGS_LIMIT)?;
    require_device(&state.db, &id).await?;

    let readings = state.db.recent_readings(&id, limit).await?;
    Ok(Json(
        json!({ "success": true, "device_id": id, "sensor_data": readings }),
    ))
}

async fn control_history<P>(
    State(state): State<AppState<P>>,
    Path(id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = resolve_limit(query.limit, DEFAULT_HISTORY_LIMIT)?;
    require_device(&state.db, &id).await?;

    let history = state.db.recent_control_records(&id, limit).await?;
    Ok(Json(
        json!({ "success": true, "device_id": id, "control_history": history }),
    ))
}

/// Pull `key` out of a JSON object body, 400 when absent.
fn required_field<'a>(body: &'a Value, key: &str) -> Result<&'a Value, ApiError> {
    body.get(key)
        .ok_or_else(|| ApiError::bad_request(format!("No {key} provided")))
}

async fn control_fan<P: ControlPublisher>(
    State(state): State<AppState<P>>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| ApiError::bad_request(format!("No status provided: {e}")))?;
    let fan = FanState::parse(required_field(&body, "status")?)?;
    let source = parse_source(body.get("source"))?;
    require_device(&state.db, &id).await?;

    let ok = state.dispatcher.set_fan(&id, fan, source).await;
    state
        .shared
        .write()
        .await
        .record_control(&id, &format!("fan {}", fan.as_str()), ok);
    if !ok {
        return Err(ApiError::internal("Failed to send control command"));
    }

    Ok(Json(
        json!({ "success": true, "device_id": id, "fan_status": fan.is_on() }),
    ))
}

async fn control_mode<P: ControlPublisher>(
    State(state): State<AppState<P>>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| ApiError::bad_request(format!("No mode provided: {e}")))?;
    let mode = FanMode::parse(required_field(&body, "mode")?)?;
    let source = parse_source(body.get("source"))?;
    require_device(&state.db, &id).await?;

    let ok = state.dispatcher.set_mode(&id, mode, source).await;
    state
        .shared
        .write()
        .await
        .record_control(&id, &format!("mode {}", mode.as_str()), ok);
    if !ok {
        return Err(ApiError::internal("Failed to send mode command"));
    }

    Ok(Json(
        json!({ "success": true, "device_id": id, "auto_mode": mode.is_auto() }),
    ))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<P: ControlPublisher + 'static>(state: AppState<P>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::{stop_requested, AppContext};
use crate::automation::{manual_water, ManualWaterError};
use crate::settings;
use crate::sync::SyncReason;

const DEFAULT_READINGS: u32 = 20;
const MAX_READINGS: u32 = 1000;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/readings", get(api_readings))
        .route("/api/settings", get(api_get_settings).put(api_put_settings))
        .route("/api/water", post(api_water))
        .with_state(ctx)
}

async fn api_status(State(ctx): State<AppContext>) -> impl IntoResponse {
    let mut status = ctx.state.read().await.to_status();
    // The event feed can trail the link by a moment; report it live.
    status.link = ctx.link.state();
    Json(status)
}

#[derive(Deserialize)]
struct ReadingsQuery {
    limit: Option<u32>,
}

async fn api_readings(
    State(ctx): State<AppContext>,
    query: Result<Query<ReadingsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = q.limit.unwrap_or(DEFAULT_READINGS).min(MAX_READINGS);
    let readings = ctx.db.recent_readings(limit).await?;
    Ok(Json(readings))
}

async fn api_get_settings(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.db.get_all_settings().await?))
}

/// Partial update. Every key and value is checked before anything is
/// written; one bad entry rejects the whole request.
async fn api_put_settings(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let updates: BTreeMap<String, Value> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid settings body: {e}")))?;
    if updates.is_empty() {
        return Err(ApiError::bad_request("no settings given"));
    }

    let mut normalized = Vec::with_capacity(updates.len());
    for (key, value) in &updates {
        let raw = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(ApiError::bad_request(format!(
                    "invalid value for {key}: {other}"
                )))
            }
        };
        let stored = settings::normalize(key, &raw).map_err(ApiError::bad_request)?;
        normalized.push((key.as_str(), stored));
    }

    let pairs: Vec<(&str, &str)> = normalized.iter().map(|(k, v)| (*k, v.as_str())).collect();
    ctx.db.update_settings(&pairs).await?;
    for (key, value) in &pairs {
        info!(key, value, "setting updated");
    }
    ctx.sync.request(SyncReason::SettingsChanged);

    Ok(Json(ctx.db.get_all_settings().await?))
}

#[derive(Deserialize)]
struct WaterRequest {
    seconds: Option<u32>,
}

async fn api_water(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let requested = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<WaterRequest>(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid water request: {e}")))?
            .seconds
    };

    let seconds = manual_water(
        &ctx.db,
        &ctx.commands,
        &ctx.events,
        &ctx.config.settings,
        requested,
        ctx.config.web.max_manual_watering_sec,
    )
    .await?;

    Ok(Json(json!({ "seconds": seconds })))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError {
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
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("web: {e:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<ManualWaterError> for ApiError {
    fn from(e: ManualWaterError) -> Self {
        let status = match &e {
            ManualWaterError::NoReading => StatusCode::NOT_FOUND,
            ManualWaterError::TankEmpty => StatusCode::CONFLICT,
            ManualWaterError::InvalidDuration { .. } => StatusCode::BAD_REQUEST,
            ManualWaterError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ManualWaterError::Storage(_) => {
                error!("web: manual watering: {e:#}");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                };
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: AppContext, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.web.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            while !stop_requested(&stop) {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

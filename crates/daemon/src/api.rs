//! Monitoring and control HTTP API
//!
//! Read endpoints derive everything from the registry at request time. Stop endpoints
//! only ask sessions to stop; teardown runs in each session's connection handler.

use crate::monitor::{
    collect_stats, session_metrics, unix_time_ms, HealthSnapshot, SessionCounts, SessionMetrics,
    SharedHostSample, StatsSnapshot,
};
use crate::registry::{RegistryError, SharedRegistry};
use crate::session::{SessionId, StopReason};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// State shared by the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: SharedRegistry,
    pub host: SharedHostSample,
    pub started: Instant,
}

/// Errors returned by API handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Stream not found")]
    NotFound,

    #[error("{0}")]
    Unavailable(String),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::NotFound,
            e @ RegistryError::AtCapacity { .. } => ApiError::Unavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Response of the stop-one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopResponse {
    pub success: bool,
    pub message: String,
}

/// Response of the stop-all endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopAllResponse {
    pub success: bool,
    pub stopped: usize,
    pub message: String,
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(|_| ApiError::NotFound)
}

/// GET /api/streams/stats
async fn get_stats(State(state): State<ApiState>) -> Json<StatsSnapshot> {
    let sessions = state.registry.snapshot().await;
    let host = state.host.read().await.clone();
    Json(collect_stats(
        &sessions,
        state.registry.max_sessions(),
        state.started.elapsed(),
        &host,
    ))
}

/// GET /api/streams/:id
async fn get_stream(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionMetrics>, ApiError> {
    let id = parse_id(&id)?;
    let session = state.registry.get(id).await.ok_or(ApiError::NotFound)?;
    Ok(Json(session_metrics(&session, Instant::now())))
}

/// POST /api/streams/:id/stop
async fn stop_stream(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.registry.stop(id, StopReason::Admin).await?;
    Ok(Json(StopResponse {
        success: true,
        message: format!("Stream {} stopped", id),
    }))
}

/// POST /api/streams/stop-all
async fn stop_all_streams(State(state): State<ApiState>) -> Json<StopAllResponse> {
    let stopped = state.registry.stop_all(StopReason::Admin).await;
    Json(StopAllResponse {
        success: true,
        stopped,
        message: format!("Stopped {} streams", stopped),
    })
}

/// GET /api/health
async fn health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    let memory = state.host.read().await.memory;
    Json(HealthSnapshot {
        status: "ok".to_string(),
        uptime_secs: state.started.elapsed().as_secs_f64(),
        memory,
        sessions: SessionCounts {
            active: state.registry.active_count().await,
            max: state.registry.max_sessions(),
        },
        timestamp_unix_ms: unix_time_ms(),
    })
}

/// Creates the axum Router with the monitoring and control endpoints
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/streams/stats", get(get_stats))
        .route("/api/streams/stop-all", post(stop_all_streams))
        .route("/api/streams/:id", get(get_stream))
        .route("/api/streams/:id/stop", post(stop_stream))
        .route("/api/health", get(health))
        .with_state(state)
}

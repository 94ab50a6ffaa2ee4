//! Dashboard API route handlers.
//!
//! All endpoints are read-only and return JSON. State is shared via
//! `Arc<DashboardState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::engine::Engine;
use crate::error::{ErrorKind, WagerError};
use crate::types::{Bet, Event, EventId, EventOdds, EventStatus, Payout};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub engine: Engine,
    pub service_name: String,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(engine: Engine, service_name: impl Into<String>) -> Self {
        Self {
            engine,
            service_name: service_name.into(),
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueResponse {
    pub pending: usize,
    pub running: Option<String>,
    pub spacing_ms: u64,
    pub consecutive_failures: u32,
    pub executed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Engine error rendered as an HTTP response.
pub struct ApiError(pub WagerError);

impl From<WagerError> for ApiError {
    fn from(e: WagerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::StateConflict
            | ErrorKind::LimitExceeded
            | ErrorKind::AlreadyFinalized => StatusCode::CONFLICT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Dashboard request failed");
        }
        let body = ErrorBody {
            error: self.0.user_message(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/events
///
/// Events that have not been settled or cancelled.
pub async fn list_events(State(state): State<AppState>) -> ApiResult<Vec<Event>> {
    let events = state
        .engine
        .lifecycle
        .list_events(&[
            EventStatus::Pending,
            EventStatus::Open,
            EventStatus::Locked,
            EventStatus::Paused,
        ])
        .await?;
    Ok(Json(events))
}

/// GET /api/events/:id
pub async fn get_event(State(state): State<AppState>, Path(id): Path<EventId>) -> ApiResult<Event> {
    Ok(Json(state.engine.lifecycle.get_event(id).await?))
}

/// GET /api/events/:id/odds
pub async fn get_odds(
    State(state): State<AppState>,
    Path(id): Path<EventId>,
) -> ApiResult<EventOdds> {
    Ok(Json(state.engine.settlement.compute_current_odds(id).await?))
}

/// GET /api/events/:id/bets
pub async fn get_bets(State(state): State<AppState>, Path(id): Path<EventId>) -> ApiResult<Vec<Bet>> {
    Ok(Json(state.engine.ledger.list_by_event(id).await?))
}

/// GET /api/events/:id/payouts
pub async fn get_payouts(
    State(state): State<AppState>,
    Path(id): Path<EventId>,
) -> ApiResult<Vec<Payout>> {
    Ok(Json(state.engine.settlement.list_payouts(id).await?))
}

/// GET /api/queue
pub async fn get_queue(State(state): State<AppState>) -> Json<QueueResponse> {
    let stats = state.engine.announcer().queue().stats();
    Json(QueueResponse {
        pending: stats.pending,
        running: stats.running,
        spacing_ms: stats.spacing.as_millis() as u64,
        consecutive_failures: stats.consecutive_failures,
        executed: stats.executed,
        failed: stats.failed,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

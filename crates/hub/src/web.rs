use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::predict::{start_ml_session, Features, MlStartOutcome, Predictor, FEATURE_COUNT};
use crate::session::{SessionCoordinator, StartOutcome, StopOutcome, StopReason};
use crate::state::{LiveStatus, SharedState};
use crate::usage::{Granularity, SessionKind, UsageAggregator};

const DEFAULT_MANUAL_LABEL: &str = "Manual";

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub connection: ConnectionManager,
    pub sessions: SessionCoordinator,
    pub usage: Arc<UsageAggregator>,
    pub predictor: Option<Arc<dyn Predictor>>,
    pub features: Features,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/connection/retry", post(api_retry))
        .route("/api/irrigation/can-start", get(api_can_start))
        .route("/api/irrigation/start", post(api_start))
        .route("/api/irrigation/stop", post(api_stop))
        .route("/api/ml/start", post(api_ml_start))
        .route("/api/usage", get(api_usage_chart))
        .route("/api/usage/{granularity}", get(api_usage))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn conflict(reason: String) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "allowed": false, "reason": reason })),
    )
        .into_response()
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let live = LiveStatus {
        connection: app.connection.diagnostics(),
        session: app.sessions.view(),
        last_record: app.usage.last_record(),
        recent_messages: app.connection.recent_messages(),
    };
    let st = app.shared.read().await;
    Json(st.to_status(live))
}

async fn api_retry(State(app): State<AppState>) -> impl IntoResponse {
    let phase = app.connection.retry().await;
    Json(json!({
        "phase": phase,
        "diagnostics": app.connection.diagnostics(),
    }))
}

#[derive(Deserialize)]
struct CanStartQuery {
    #[serde(default = "default_kind")]
    kind: SessionKind,
}

fn default_kind() -> SessionKind {
    SessionKind::Manual
}

async fn api_can_start(
    State(app): State<AppState>,
    Query(q): Query<CanStartQuery>,
) -> impl IntoResponse {
    Json(app.sessions.can_start(q.kind))
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default = "default_kind")]
    kind: SessionKind,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    duration_minutes: Option<f64>,
}

async fn api_start(State(app): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    let label = req
        .label
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MANUAL_LABEL.to_string());

    match app
        .sessions
        .start(req.kind, &label, req.duration_minutes, None)
        .await
    {
        StartOutcome::Started(id) => (
            StatusCode::CREATED,
            Json(json!({ "session_id": id, "session": app.sessions.view() })),
        )
            .into_response(),
        StartOutcome::Conflict(reason) => conflict(reason),
        StartOutcome::PublishFailed => error_body(
            StatusCode::BAD_GATEWAY,
            "the on command was not accepted by the broker",
        ),
        StartOutcome::InvalidDuration(reason) => error_body(StatusCode::BAD_REQUEST, reason),
    }
}

async fn api_stop(State(app): State<AppState>) -> Response {
    let report = app.sessions.stop(StopReason::Manual).await;
    let status = match report.outcome {
        StopOutcome::Stopped | StopOutcome::Coalesced => StatusCode::OK,
        StopOutcome::Queued => StatusCode::ACCEPTED,
        StopOutcome::NotActive => StatusCode::CONFLICT,
    };
    (status, Json(report)).into_response()
}

#[derive(Deserialize)]
struct MlStartRequest {
    #[serde(default)]
    features: Option<Vec<f64>>,
}

async fn api_ml_start(State(app): State<AppState>, body: Bytes) -> Response {
    let Some(predictor) = app.predictor.clone() else {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "no prediction service configured",
        );
    };

    let features = if body.is_empty() {
        app.features
    } else {
        let req: MlStartRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
        };
        match req.features {
            None => app.features,
            Some(f) => match Features::try_from(f.as_slice()) {
                Ok(f) if f.iter().all(|v| v.is_finite()) => f,
                _ => {
                    return error_body(
                        StatusCode::BAD_REQUEST,
                        format!("features must be {FEATURE_COUNT} finite numbers"),
                    )
                }
            },
        }
    };

    let outcome = start_ml_session(&app.sessions, predictor.as_ref(), &features).await;
    let status = match &outcome {
        MlStartOutcome::Started { .. } => StatusCode::CREATED,
        MlStartOutcome::Conflict { .. } => StatusCode::CONFLICT,
        MlStartOutcome::PredictionFailed { .. }
        | MlStartOutcome::PublishFailed { .. }
        | MlStartOutcome::InvalidPrediction { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(outcome)).into_response()
}

async fn api_usage(
    State(app): State<AppState>,
    Path(granularity): Path<Granularity>,
) -> impl IntoResponse {
    Json(app.usage.snapshot(granularity, OffsetDateTime::now_utc()))
}

async fn api_usage_chart(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.usage.chart(OffsetDateTime::now_utc()))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// `WEB_PORT` wins over the configured port.
pub fn resolve_port(configured: u16) -> u16 {
    env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(configured)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web: api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

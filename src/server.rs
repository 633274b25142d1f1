//! Agent-facing HTTP API.
//!
//! Agents authenticate with `Authorization: Token <api_token>`. Every handler
//! is a thin wrapper over [`crate::lifecycle`] or [`crate::materializer`].

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::lifecycle::{self, Reporter};
use crate::materializer::{self, Horizon, MaterializeReport};
use crate::store::ScheduleStore;
use crate::types::{Agent, ScheduledScan, ScheduledScanId};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScheduleStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn ScheduleStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Core(Error),
    /// A background task died before producing a result.
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    invalid: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, invalid) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, Vec::new()),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
            ApiError::Core(e) => match e {
                Error::InvalidTarget(list) | Error::InvalidExcludedTarget(list) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, list.clone())
                }
                Error::InvalidField { .. } | Error::InvalidRecurrence(_) | Error::InvalidHorizon(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, Vec::new())
                }
                Error::NotFound { .. } => (StatusCode::NOT_FOUND, Vec::new()),
                Error::InvalidTransition { .. }
                | Error::AgentMismatch { .. }
                | Error::ClaimConflict { .. }
                | Error::DuplicateOccurrence { .. }
                | Error::StaleAgent { .. }
                | Error::Constraint(_) => (StatusCode::CONFLICT, Vec::new()),
            },
        };
        let error = match &self {
            ApiError::Unauthorized => "missing or unknown api token".to_string(),
            ApiError::Core(e) => e.to_string(),
            ApiError::Internal(e) => e.clone(),
        };
        (status, Json(ErrorBody { error, invalid })).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn authenticate(state: &AppState, headers: &HeaderMap) -> std::result::Result<Agent, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;
    match state.store.agent_by_token(token) {
        Ok(agent) => Ok(agent),
        Err(Error::NotFound { .. }) => Err(ApiError::Unauthorized),
        Err(e) => Err(e.into()),
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/checkin", post(post_checkin))
        .route("/claim", post(post_claim))
        .route("/scheduled/{id}/complete", post(post_complete))
        .route("/scheduled/{id}/error", post(post_error))
        .route("/materialize", post(post_materialize))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serve the API on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "agent api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("agent api stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(Health { status: "ok" }))
}

#[derive(Debug, Serialize)]
pub struct Checkin {
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checkin: Option<OffsetDateTime>,
}

async fn post_checkin(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Checkin> {
    let agent = authenticate(&app, &headers)?;
    let agent = lifecycle::check_in(&*app.store, agent.id, OffsetDateTime::now_utc())?;
    Ok(Json(Checkin {
        name: agent.name,
        last_checkin: agent.last_checkin,
    }))
}

async fn post_claim(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Vec<ScheduledScan>> {
    let agent = authenticate(&app, &headers)?;
    let claimed = lifecycle::claim_due(&*app.store, agent.id, OffsetDateTime::now_utc())?;
    Ok(Json(claimed))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    /// Defaults to the time the report arrives.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_time: Option<OffsetDateTime>,
    pub result_file_base_name: String,
}

async fn post_complete(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<ScheduledScan> {
    let agent = authenticate(&app, &headers)?;
    let completed = req.completed_time.unwrap_or_else(OffsetDateTime::now_utc);
    let row = lifecycle::report_completion(
        &*app.store,
        agent.id,
        ScheduledScanId(id),
        completed,
        &req.result_file_base_name,
    )?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ErrorRequest {
    pub reason: String,
    /// Set when the scan never started on the agent.
    #[serde(default)]
    pub preflight: bool,
}

async fn post_error(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(req): Json<ErrorRequest>,
) -> ApiResult<ScheduledScan> {
    let agent = authenticate(&app, &headers)?;
    let row = lifecycle::report_error(
        &*app.store,
        Reporter::Agent(agent.id),
        ScheduledScanId(id),
        &req.reason,
        req.preflight,
    )?;
    Ok(Json(row))
}

#[derive(Debug, Default, Deserialize)]
pub struct MaterializeRequest {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

async fn post_materialize(
    State(app): State<AppState>,
    Json(req): Json<MaterializeRequest>,
) -> ApiResult<MaterializeReport> {
    let now = OffsetDateTime::now_utc();
    let horizon = match (req.start, req.end) {
        (None, None) => app.config.horizon(now)?,
        (start, end) => {
            let start = start.unwrap_or(now);
            match end {
                Some(end) => Horizon::new(start, end)?,
                None => Horizon::starting_at(start, app.config.horizon_length())?,
            }
        }
    };
    let store = Arc::clone(&app.store);
    let allow_private_ips = app.config.allow_private_ips;
    let report = tokio::task::spawn_blocking(move || {
        materializer::materialize_all(&*store, &horizon, allow_private_ips)
    })
    .await
    .map_err(|e| {
        warn!(error = %e, "materialize task failed");
        ApiError::Internal("materialize task failed".to_string())
    })??;
    if !report.rejected.is_empty() {
        warn!(rejected = report.rejected.len(), "materialize trigger rejected occurrences");
    }
    Ok(Json(report))
}

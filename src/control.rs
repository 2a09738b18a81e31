// src/control.rs
//
// =============================================================================
// RAGKEEPER: CONTROL SURFACE
// =============================================================================
//
// A thin HTTP facade over the Scheduler and Pipeline Engine, following the
// `State<Arc<AppState>>` / `Json<T>` handler shape used across the
// enrichment pack's axum services. All error responses use the uniform
// `{error_kind, message, details?}` shape from `error.rs`.

use crate::config::PipelineConfig;
use crate::error::IndexError;
use crate::health;
use crate::pipeline::PipelineEngine;
use crate::report::RunReportLog;
use crate::scheduler::{JobDefinition, Scheduler, SchedulerStatistics};
use crate::trigger::{CronTrigger, IntervalTrigger, OneShotTrigger, Trigger};
use crate::vector_store::{self, VectorStore};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub engine: PipelineEngine,
    pub default_config: PipelineConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/scheduler/status", get(get_scheduler_status))
        .route("/scheduler/jobs", get(list_jobs))
        .route("/scheduler/jobs/cron", post(create_cron_job))
        .route("/scheduler/jobs/interval", post(create_interval_job))
        .route("/scheduler/jobs/onetime", post(create_onetime_job))
        .route("/scheduler/jobs/:id", delete(delete_job))
        .route("/pipeline/run", post(run_pipeline))
        .route("/pipeline/reports", get(list_reports))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError(IndexError);

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IndexError::Config(_) => StatusCode::BAD_REQUEST,
            IndexError::Schedule(_) => StatusCode::CONFLICT,
            IndexError::Load(_) | IndexError::Ledger(_) | IndexError::Embedding(_) | IndexError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            IndexError::Health(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error_kind: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store: Box<dyn VectorStore> = match vector_store::open_store(&state.default_config) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };
    let report = health::check_health(&state.default_config, store.as_ref(), 30).await;
    Json(report).into_response()
}

async fn get_scheduler_status(State(state): State<Arc<AppState>>) -> Json<SchedulerStatistics> {
    Json(state.scheduler.stats())
}

#[derive(Serialize)]
struct JobView {
    id: String,
    trigger: Trigger,
    next_fire_time: Option<chrono::DateTime<chrono::Utc>>,
    last_fire_time: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
}

impl From<JobDefinition> for JobView {
    fn from(job: JobDefinition) -> Self {
        Self {
            id: job.id,
            trigger: job.trigger,
            next_fire_time: job.next_fire_time,
            last_fire_time: job.last_fire_time,
            last_error: job.last_error,
        }
    }
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    Json(state.scheduler.list_jobs().into_iter().map(JobView::from).collect())
}

#[derive(Deserialize)]
struct CreateCronRequest {
    id: String,
    expression: Option<String>,
    minute: Option<u32>,
    hour: Option<u32>,
    day_of_week: Option<String>,
    #[serde(default)]
    config: Option<PipelineConfig>,
}

async fn create_cron_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCronRequest>,
) -> Result<StatusCode, ApiError> {
    let trigger = match req.expression {
        Some(expr) => Trigger::Cron(CronTrigger::from_expression(expr)),
        None => Trigger::Cron(CronTrigger::from_fields(req.minute, req.hour, req.day_of_week)),
    };
    let config = req.config.unwrap_or_else(|| state.default_config.clone());
    state.scheduler.create_job(&req.id, trigger, config)?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct CreateIntervalRequest {
    id: String,
    #[serde(default)]
    minutes: u32,
    #[serde(default)]
    hours: u32,
    #[serde(default)]
    days: u32,
    #[serde(default)]
    config: Option<PipelineConfig>,
}

async fn create_interval_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateIntervalRequest>,
) -> Result<StatusCode, ApiError> {
    let trigger = Trigger::Interval(IntervalTrigger {
        minutes: req.minutes,
        hours: req.hours,
        days: req.days,
    });
    let config = req.config.unwrap_or_else(|| state.default_config.clone());
    state.scheduler.create_job(&req.id, trigger, config)?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct CreateOnetimeRequest {
    id: String,
    fire_at: chrono::DateTime<chrono::Utc>,
    lateness_tolerance_minutes: Option<i64>,
    #[serde(default)]
    config: Option<PipelineConfig>,
}

async fn create_onetime_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOnetimeRequest>,
) -> Result<StatusCode, ApiError> {
    let trigger = Trigger::OneShot(OneShotTrigger {
        fire_at: req.fire_at,
        lateness_tolerance_minutes: req.lateness_tolerance_minutes,
    });
    let config = req.config.unwrap_or_else(|| state.default_config.clone());
    state.scheduler.create_job(&req.id, trigger, config)?;
    Ok(StatusCode::CREATED)
}

async fn delete_job(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> StatusCode {
    match state.scheduler.delete_job(&id) {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct RunPipelineRequest {
    #[serde(default)]
    config: Option<PipelineConfig>,
}

async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunPipelineRequest>,
) -> Json<crate::report::RunReport> {
    let config = req.config.unwrap_or_else(|| state.default_config.clone());
    let report = state.engine.run("manual", &config).await;
    Json(report)
}

async fn list_reports(State(state): State<Arc<AppState>>) -> Result<Json<Vec<crate::report::RunReport>>, ApiError> {
    let log = RunReportLog::new(&state.default_config.reports_path);
    let reports = log
        .read_all()
        .map_err(|e| ApiError(IndexError::Config(e.to_string())))?;
    Ok(Json(reports))
}

//! ETL routes
//!
//! Control endpoints for the ingestion pipeline. They do NOT require
//! authentication; deploy behind the network boundary.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use super::commands::{start_job::handle as handle_start_job, StartJobCommand};
use super::queries::{
    get_status::{handle as handle_get_status, GetStatusError},
    tail_logs::handle as handle_tail_logs,
    validate::handle as handle_validate,
    GetStatusQuery, TailLogsQuery, ValidateQuery,
};
use crate::error::AppError;
use crate::ingest::service::StartRequest;
use crate::ingest::EtlService;

/// Create ETL routes
pub fn etl_routes() -> Router<EtlService> {
    Router::new()
        .route("/validate", get(validate))
        .route("/start", post(start))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
}

/// Pre-flight checks
///
/// GET /validate
async fn validate(State(service): State<EtlService>) -> Response {
    let report = handle_validate(service, ValidateQuery).await;
    (StatusCode::OK, Json(json!(report))).into_response()
}

/// Start a background run
///
/// POST /start with an optional JSON body:
/// `{"force", "skip_download", "tables", "period", "truncate", "resume"}`
async fn start(
    State(service): State<EtlService>,
    body: Option<Json<StartRequest>>,
) -> Result<Response, AppError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let response = handle_start_job(service, StartJobCommand { request }).await?;
    Ok((StatusCode::OK, Json(json!(response))).into_response())
}

/// Current or specific job status
///
/// GET /status?job_id=etl_20240511_120000
async fn status(
    State(service): State<EtlService>,
    Query(query): Query<GetStatusQuery>,
) -> Result<Response, AppError> {
    match handle_get_status(service, query).await {
        Ok(record) => Ok((StatusCode::OK, Json(json!(record))).into_response()),
        Err(GetStatusError::NotFound(job_id)) => Err(AppError::NotFound(job_id)),
        Err(GetStatusError::Database(e)) => Err(AppError::Database(e)),
    }
}

/// Tail of the newest log file
///
/// GET /logs?lines=100
async fn logs(
    State(service): State<EtlService>,
    Query(query): Query<TailLogsQuery>,
) -> Result<Response, AppError> {
    let tail = handle_tail_logs(service, query)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read logs: {:#}", e)))?;
    Ok((StatusCode::OK, Json(json!(tail))).into_response())
}

/// POST /pause
async fn pause(State(service): State<EtlService>) -> Result<Response, AppError> {
    service.pause()?;
    Ok(StatusCode::OK.into_response())
}

/// POST /resume
async fn resume(State(service): State<EtlService>) -> Result<Response, AppError> {
    service.resume()?;
    Ok(StatusCode::OK.into_response())
}

// HTTP route handlers for the Tribunal API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tribunal_common::redis;
use tribunal_common::types::{
    DebugFixRequest, DebugFixResponse, EvaluateRequest, JobPayload, JudgeJob, JudgeResponse, Language, OutcomeKind,
    StatusClass,
};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

pub fn status_for(outcome: OutcomeKind) -> StatusCode {
    match outcome.status_class() {
        StatusClass::Success => StatusCode::OK,
        StatusClass::ClientError if outcome == OutcomeKind::UnsupportedLanguage => StatusCode::UNPROCESSABLE_ENTITY,
        StatusClass::ClientError => StatusCode::BAD_REQUEST,
        StatusClass::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection_message(rejection: &JsonRejection) -> String {
    format!("Invalid request: {}", rejection.body_text())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// POST /evaluate-code - Judge a submission synchronously
pub async fn evaluate_code(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> (StatusCode, Json<JudgeResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let response = JudgeResponse::without_cases(OutcomeKind::InvalidRequest, rejection_message(&rejection));
            metrics::observe("evaluate-code", response.outcome, Default::default());
            return (StatusCode::BAD_REQUEST, Json(response));
        }
    };

    let start = Instant::now();
    // Batch-style full diagnostics unless the caller asks to stop early
    let response = state.service.evaluate(request, false).await;
    metrics::observe("evaluate-code", response.outcome, start.elapsed());
    info!(
        outcome = %response.outcome,
        passed_cases = response.passed_cases,
        total_cases = response.total_cases,
        "Evaluation finished"
    );

    (status_for(response.outcome), Json(response))
}

/// POST /evaluate-debug-fix - Validate a debugging exercise fix
pub async fn evaluate_debug_fix(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DebugFixRequest>, JsonRejection>,
) -> (StatusCode, Json<DebugFixResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let response = DebugFixResponse::invalid(OutcomeKind::InvalidRequest, rejection_message(&rejection));
            metrics::observe("evaluate-debug-fix", response.outcome, Default::default());
            return (StatusCode::BAD_REQUEST, Json(response));
        }
    };

    let start = Instant::now();
    let response = state.service.evaluate_fix(request).await;
    metrics::observe("evaluate-debug-fix", response.outcome, start.elapsed());
    info!(outcome = %response.outcome, valid = response.valid, "Debug-fix validation finished");

    (status_for(response.outcome), Json(response))
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// POST /jobs - Queue a payload for the batch worker
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<JobPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection_message(&rejection)),
    };

    let validation = match &payload {
        JobPayload::Evaluate(request) => request.validate(),
        JobPayload::DebugFix(request) => request.validate(),
    };
    if let Err(message) = validation {
        return error_body(StatusCode::BAD_REQUEST, format!("Invalid request: {}", message));
    }

    let Some(redis_conn) = &state.redis else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Batch queue is not available");
    };

    let job = JudgeJob::new(payload);
    let mut conn = redis_conn.clone();
    match redis::push_job(&mut conn, &job).await {
        Ok(_) => {
            info!(job_id = %job.id, kind = job.kind(), "Job queued");
            (StatusCode::CREATED, Json(SubmitResponse { job_id: job.id })).into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue job");
            error_body(StatusCode::SERVICE_UNAVAILABLE, format!("Failed to queue job: {}", e))
        }
    }
}

/// GET /jobs/:job_id - Query a batch job
pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_uuid = match Uuid::parse_str(&job_id) {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Invalid job ID format"),
    };

    let Some(redis_conn) = &state.redis else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Batch queue is not available");
    };
    let mut conn = redis_conn.clone();

    match redis::get_result(&mut conn, &job_uuid).await {
        Ok(Some(record)) => return (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => {}
        Err(e) => {
            error!(job_id = %job_uuid, error = %e, "Failed to fetch job result");
            return error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query job status: {}", e),
            );
        }
    }

    match redis::get_status(&mut conn, &job_uuid).await {
        Ok(Some(status)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": job_uuid, "status": status })),
        )
            .into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => {
            error!(job_id = %job_uuid, error = %e, "Failed to fetch job status");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query job status: {}", e),
            )
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub name: Language,
    pub executable: bool,
}

/// GET /languages - Recognised languages and whether they can run
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<Vec<LanguageInfo>> {
    Json(
        Language::ALL
            .iter()
            .map(|language| LanguageInfo {
                name: *language,
                executable: state.service.is_executable(*language),
            })
            .collect(),
    )
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

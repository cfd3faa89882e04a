use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/evaluate-code", post(handlers::evaluate_code))
        .route("/evaluate-debug-fix", post(handlers::evaluate_debug_fix))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:job_id", get(handlers::get_job))
        .route("/languages", get(handlers::list_languages))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}

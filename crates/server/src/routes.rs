use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::Utc;
use engine::{Job, JobLedger, SubmitBacktest};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::APP_VERSION;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<JobLedger>,
}

/// Build the HTTP router around a shared ledger
pub fn router(ledger: Arc<JobLedger>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api_root))
        .route("/health", get(api_health))
        .route("/backtest", get(api_list_backtests).post(api_submit_backtest))
        .route("/backtest/:id", get(api_get_backtest))
        .with_state(AppState { ledger })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// Service
// ============================================================================

/// GET /
async fn api_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "LEAN CLI Service",
        "status": "running",
    }))
}

/// GET /health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": APP_VERSION,
        "adapter": state.ledger.adapter_name(),
        "outstanding": state.ledger.outstanding(),
    }))
}

// ============================================================================
// Backtests
// ============================================================================

/// POST /backtest — accept a backtest and start it in the background
async fn api_submit_backtest(
    State(state): State<AppState>,
    payload: Result<Json<SubmitBacktest>, JsonRejection>,
) -> AppResult<Json<serde_json::Value>> {
    let Json(submission) = payload?;
    let job = state.ledger.submit(submission)?;

    Ok(Json(serde_json::json!({
        "id": job.id,
        "status": job.status(),
    })))
}

/// GET /backtest/:id — current snapshot of one job
async fn api_get_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Job>> {
    Ok(Json(state.ledger.get(&id)?))
}

/// GET /backtest — every job held in memory, newest first
async fn api_list_backtests(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs = state.ledger.list();
    Json(serde_json::json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

// HTTP request handlers for the admin surface.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use gps2bq_pipeline::{Phase, PhaseChangeError};

use crate::{ApiError, AppState};

/// POST /v1/cycle - run one pipeline cycle now.
pub(crate) async fn run_cycle(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.controller.run_cycle(&state.token).await;
    info!(
        success = outcome.success,
        records = outcome.total_records,
        ms = outcome.processing_ms,
        "manual cycle finished"
    );
    (StatusCode::OK, Json(outcome))
}

/// POST /v1/recovery - run the recovery sweeper now.
pub(crate) async fn run_recovery(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.controller.run_recovery().await;
    (StatusCode::OK, Json(report))
}

/// GET /v1/snapshot - ledger summary, spool stats and phase.
pub(crate) async fn snapshot(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.controller.snapshot().await))
}

/// GET /v1/phase
pub(crate) async fn get_phase(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "phase": state.controller.phase(),
            "cooldown_active": state.controller.in_cooldown(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetPhaseRequest {
    phase: String,
}

/// PUT /v1/phase - hybrid controller admin.
pub(crate) async fn set_phase(
    State(state): State<AppState>,
    Json(request): Json<SetPhaseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target: Phase = request.phase.parse().map_err(ApiError::bad_request)?;

    match state.controller.set_phase(target) {
        Ok(phase) => Ok(Json(json!({ "phase": phase }))),
        Err(e @ PhaseChangeError::CooldownActive { .. }) => Err(ApiError::conflict(e.to_string())),
    }
}

/// GET /health - component health, 503 when unhealthy.
pub(crate) async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.controller.health().await;
    let status = if health.healthy || health.status == gps2bq_pipeline::HealthStatus::Degraded {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /ready - readiness check.
pub(crate) async fn ready_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ready"})))
}

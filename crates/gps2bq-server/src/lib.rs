// Server mode - HTTP surface over the pipeline core
//
// Exposes the process boundary: trigger a cycle or a recovery sweep,
// read the snapshot, administer the hybrid phase, health checks.
// Structured logging with tracing, graceful shutdown on SIGTERM/Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gps2bq_config::RuntimeConfig;
use gps2bq_pipeline::{CycleScheduler, HybridController};

mod handlers;
mod init;

use handlers::{
    get_phase, health_check, ready_check, run_cycle, run_recovery, set_phase, snapshot,
};
use init::{build_controller, init_tracing};

/// Application state shared across all requests.
#[derive(Clone)]
pub(crate) struct AppState {
    pub controller: Arc<HybridController>,
    /// The scheduler's token; manual cycles honor the same shutdown.
    pub token: CancellationToken,
}

/// JSON error envelope returned by failed handlers.
///
/// Handlers construct these directly with the status they mean; there
/// is deliberately no catch-all conversion from arbitrary errors, so a
/// 500 can only come from an explicit `internal`.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, "request failed: {}", self.message);
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16(),
        }));
        (self.status, body).into_response()
    }
}

/// Resolve once the process is asked to stop (Ctrl+C, or SIGTERM on
/// unix).
async fn wait_for_stop() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm =
            unix_signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => info!("interrupt received, draining before exit"),
            _ = sigterm.recv() => info!("SIGTERM received, draining before exit"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
        info!("interrupt received, draining before exit");
    }
}

/// Entry point for server mode.
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let addr = config
        .server
        .clone()
        .unwrap_or_default()
        .listen_addr;

    let controller = build_controller(&config)
        .await
        .context("Failed to build pipeline components")?;

    let scheduler = Arc::new(CycleScheduler::new(
        Arc::clone(&controller),
        config.pipeline.interval(),
        config.metrics.snapshot_interval(),
    ));
    let token = scheduler.token();
    scheduler.start();

    info!(
        phase = controller.phase().as_str(),
        interval_secs = config.pipeline.interval_secs,
        "pipeline scheduler running"
    );

    let state = AppState {
        controller,
        token,
    };

    let app = Router::new()
        .route("/v1/cycle", post(run_cycle))
        .route("/v1/recovery", post(run_recovery))
        .route("/v1/snapshot", get(snapshot))
        .route("/v1/phase", get(get_phase).put(set_phase))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("gps2bq admin endpoint listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/v1/cycle    - run one pipeline cycle", addr);
    info!("  POST http://{}/v1/recovery - run the recovery sweeper", addr);
    info!("  GET  http://{}/v1/snapshot - ledger + spool + phase", addr);
    info!("  PUT  http://{}/v1/phase    - hybrid controller admin", addr);
    info!("  GET  http://{}/health      - health check", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_stop())
        .await
        .context("Server error")?;

    scheduler.stop().await;
    info!("Server shutdown complete");

    Ok(())
}

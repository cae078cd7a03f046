pub mod error;

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use error::ApiError;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::domain::LocalTime;
use crate::scheduler::Scheduler;

/// Control-surface state shared with every handler
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn crate::domain::Clock>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .route("/health", get(health))
                .route("/status", get(status))
                .route("/tasks", get(tasks))
                .route("/tasks/:id", delete(unregister))
                .route("/control/pause", post(pause))
                .route("/control/resume", post(resume))
                .route("/control/stop-all", post(stop_all))
                .with_state(state),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

/// System status response
#[derive(Debug, Serialize)]
struct SystemStatus {
    timestamp: LocalTime,
    paused: bool,
    degraded: bool,
    window_records: usize,
    production_kw: f64,
    consumption_kw: f64,
    tasks: Vec<String>,
}

async fn status(State(state): State<ApiState>) -> Json<SystemStatus> {
    let snapshot = state.scheduler.window_snapshot();
    let (production_kw, consumption_kw) = snapshot
        .last()
        .map(|r| (r.production(), r.consumption()))
        .unwrap_or((0.0, 0.0));

    Json(SystemStatus {
        timestamp: state.clock.now(),
        paused: state.scheduler.is_paused(),
        degraded: state.scheduler.is_degraded(),
        window_records: snapshot.len(),
        production_kw,
        consumption_kw,
        tasks: state.scheduler.descriptions(),
    })
}

async fn tasks(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.scheduler.descriptions())
}

async fn unregister(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<&'static str>, ApiError> {
    if state.scheduler.unregister(&id) {
        Ok(Json("unregistered"))
    } else {
        Err(ApiError::NotFound(format!("task {id:?}")))
    }
}

async fn pause(State(state): State<ApiState>) -> Json<&'static str> {
    state.scheduler.pause();
    Json("paused")
}

async fn resume(State(state): State<ApiState>) -> Json<&'static str> {
    state.scheduler.resume();
    Json("resumed")
}

async fn stop_all(State(state): State<ApiState>) -> Json<&'static str> {
    state.scheduler.stop_all().await;
    Json("stopped")
}

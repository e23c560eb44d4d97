// Liveness and pool occupancy endpoints for the worker process

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct PoolHealth {
    pub max_concurrent: usize,
    pub slots: Arc<Semaphore>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PoolReport {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub busy: usize,
    pub uptime_secs: u64,
}

impl PoolHealth {
    pub fn report(&self) -> PoolReport {
        let available_slots = self.slots.available_permits().min(self.max_concurrent);
        PoolReport {
            max_concurrent: self.max_concurrent,
            available_slots,
            busy: self.max_concurrent - available_slots,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

pub fn routes(health: PoolHealth) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/pool", get(pool_status))
        .with_state(Arc::new(health))
}

/// GET /health
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /pool
async fn pool_status(State(health): State<Arc<PoolHealth>>) -> impl IntoResponse {
    Json(health.report())
}

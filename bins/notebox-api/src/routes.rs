// Route definitions for the Notebox API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/executions", post(handlers::submit_execution))
        .route("/executions/:id", get(handlers::get_status))
        .route("/executions/:id/outputs", get(handlers::get_outputs))
        .route("/executions/:id/stream", get(handlers::stream_outputs))
        .route("/executions/:id/cancel", post(handlers::cancel_execution))
        .route("/queue", get(handlers::queue_status))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
}

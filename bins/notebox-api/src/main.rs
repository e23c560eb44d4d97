mod handlers;
mod metrics;
mod routes;
mod stream;

use anyhow::Context;
use axum::Router;
use futures_util::StreamExt;
use notebox_common::types::CompletionEvent;
use notebox_common::{Config, Orchestrator, RedisStore, SubmissionLimits};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Notebox API booting...");
    let config = Config::from_env();

    metrics::init_metrics().context("Failed to register metrics")?;
    info!("Metrics registry initialized");

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?
        .with_result_ttl(config.result_ttl());
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let orchestrator = Orchestrator::new(Arc::new(store), SubmissionLimits::from_config(&config));
    let state = Arc::new(AppState {
        orchestrator,
        config: config.clone(),
    });

    // Start background metrics subscriber
    tokio::spawn(metrics_subscriber(config.redis_url.clone()));

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Background task: follow worker completion events and feed the metrics
async fn metrics_subscriber(redis_url: String) {
    loop {
        if let Err(e) = follow_completions(&redis_url).await {
            warn!(error = %format!("{:#}", e), "Completion subscriber disconnected, retrying");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn follow_completions(redis_url: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    let mut pubsub = client
        .get_async_connection()
        .await
        .context("Failed to open pubsub connection")?
        .into_pubsub();
    pubsub
        .subscribe(notebox_common::redis::COMPLETIONS_CHANNEL)
        .await
        .context("Failed to subscribe to completion channel")?;

    info!("Metrics subscriber started - listening for completions");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(_) => continue,
        };

        match serde_json::from_str::<CompletionEvent>(&payload) {
            Ok(event) => {
                metrics::record_completed(&event);
                debug!(
                    execution_id = %event.execution_id,
                    state = %event.state,
                    execution_time_ms = event.execution_time_ms,
                    "Recorded completion"
                );
            }
            Err(e) => error!(error = %e, "Malformed completion event"),
        }
    }

    anyhow::bail!("completion channel closed")
}

mod accel;
mod executor;
mod harness;
mod health;
mod pool;
mod runtime;

#[cfg(test)]
mod testing;

use anyhow::Context;
use executor::{ExecutionContext, ExecutorSettings};
use notebox_common::{Config, RedisStore};
use pool::WorkerPool;
use runtime::{DockerRuntime, SandboxRuntime};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Notebox worker booting...");
    let config = Config::from_env();

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?
        .with_result_ttl(config.result_ttl());
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let runtime = DockerRuntime::connect()?;
    runtime.ping().await?;
    info!("Connected to Docker daemon");

    let settings = ExecutorSettings::from_config(&config);
    // surface a missing image at boot instead of on the first execution
    if let Err(e) = runtime.build(&settings.image).await {
        warn!(image = %settings.image.image, error = %format!("{:#}", e), "Sandbox image not ready");
    }

    let ctx = Arc::new(ExecutionContext {
        store: Arc::new(store),
        runtime: Arc::new(runtime),
        selector: accel::EngineSelector::from_config(&config),
        settings,
    });

    let pool = WorkerPool::new(ctx, config.max_concurrent, config.worker_idle_poll());
    if config.worker_recover_on_boot {
        pool.recover().await.context("Boot recovery failed")?;
    } else {
        pool.advertise_capacity()
            .await
            .context("Failed to publish pool capacity")?;
        info!("Boot recovery disabled");
    }

    let health = health::PoolHealth {
        max_concurrent: pool.max_concurrent(),
        slots: pool.slots(),
        started_at: std::time::Instant::now(),
    };
    let addr = format!("0.0.0.0:{}", config.worker_health_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
    info!(addr = %addr, "Health endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::routes(health)).await {
            error!(error = %e, "Health endpoint stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, finishing in-flight executions");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                // dropping the sender would read as a shutdown request
                std::future::pending::<()>().await;
            }
        }
    });

    info!(
        max_concurrent = pool.max_concurrent(),
        image = %config.sandbox_image,
        "Listening for executions"
    );
    pool.run(shutdown_rx).await;

    info!("Worker shutdown complete");
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

/// Worker Pool
///
/// **Core Responsibility:**
/// Keep at most `max_concurrent` sandboxes alive on this host while draining
/// the shared pending FIFO.
///
/// **Backpressure:**
/// A worker task takes a permit from the pool semaphore BEFORE popping the
/// queue and holds it until the execution is terminal. With all permits
/// taken, work stays in the FIFO where callers can still cancel it cheaply.

use crate::executor::{self, ExecutionContext};
use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use notebox_common::types::{CompletionEvent, ExecutionOutput, ExecutionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Back-off after the store fails to answer
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What boot recovery found
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_reaped: usize,
    pub interrupted: usize,
}

pub struct WorkerPool {
    ctx: Arc<ExecutionContext>,
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    idle_poll: Duration,
}

impl WorkerPool {
    pub fn new(ctx: Arc<ExecutionContext>, max_concurrent: usize, idle_poll: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            ctx,
            max_concurrent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            idle_poll,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Shared view of the permits, for health reporting
    pub fn slots(&self) -> Arc<Semaphore> {
        self.slots.clone()
    }

    /// Publish the pool cap so queue status can report free slots
    pub async fn advertise_capacity(&self) -> Result<()> {
        self.ctx.store.set_capacity(self.max_concurrent as u64).await?;
        Ok(())
    }

    /// Clean up after a previous process on this host.
    ///
    /// Advertises the pool cap, force-removes sandboxes still labelled as
    /// ours, and fails executions that were left `running`: their sandbox
    /// is gone and nobody else will ever finish them.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.advertise_capacity().await?;
        let store = &self.ctx.store;

        let orphans_reaped = match self.ctx.runtime.reap_orphans().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Could not reap orphaned sandboxes");
                0
            }
        };

        let mut interrupted = 0;
        for id in store.running_ids().await? {
            let running = store
                .status(&id)
                .await?
                .is_some_and(|status| status.state == ExecutionState::Running);

            if running {
                store
                    .append_output(
                        &id,
                        &ExecutionOutput::error(
                            "WorkerRestart",
                            "worker restarted while the execution was running",
                        ),
                    )
                    .await?;
                let failed = store
                    .transition(
                        &id,
                        ExecutionState::Running,
                        ExecutionState::Error,
                        Utc::now(),
                        Some("worker restarted"),
                    )
                    .await?;
                if failed {
                    interrupted += 1;
                    let event = CompletionEvent {
                        execution_id: id,
                        state: ExecutionState::Error,
                        execution_time_ms: 0,
                    };
                    if let Err(e) = store.publish_completion(&event).await {
                        warn!(execution_id = %id, error = %e, "Failed to publish completion event");
                    }
                }
            }
            store.clear_running(&id).await?;
        }

        let report = RecoveryReport {
            orphans_reaped,
            interrupted,
        };
        info!(
            max_concurrent = self.max_concurrent,
            orphans_reaped = report.orphans_reaped,
            interrupted = report.interrupted,
            "Worker pool recovered"
        );
        Ok(report)
    }

    /// Run worker tasks until `shutdown` flips to true, then let in-flight
    /// executions finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(max_concurrent = self.max_concurrent, "Worker pool started");

        let workers = (0..self.max_concurrent).map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                self.ctx.clone(),
                self.slots.clone(),
                self.idle_poll,
                shutdown.clone(),
            ))
        });

        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!("Worker pool drained");
    }
}

async fn worker_loop(
    worker: usize,
    ctx: Arc<ExecutionContext>,
    slots: Arc<Semaphore>,
    idle_poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "Worker task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match ctx.store.dequeue().await {
            Ok(Some(id)) => {
                debug!(worker, execution_id = %id, "Picked up execution");
                match executor::execute(&ctx, id).await {
                    Ok(Some(state)) => debug!(worker, execution_id = %id, state = %state, "Execution done"),
                    Ok(None) => {}
                    Err(e) => error!(
                        worker,
                        execution_id = %id,
                        error = %format!("{:#}", e),
                        "Execution failed"
                    ),
                }
                drop(permit);
            }
            Ok(None) => {
                drop(permit);
                if pause(&mut shutdown, idle_poll).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker, error = %e, "Failed to read pending queue");
                if pause(&mut shutdown, STORE_RETRY_DELAY).await {
                    break;
                }
            }
        }
    }

    debug!(worker, "Worker task stopped");
}

/// Sleep for `period`; true when shutdown was requested meanwhile
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

//! Submission side of the job queue.
//!
//! The [`Orchestrator`] never touches a sandbox. It validates and persists
//! requests, answers status queries and turns cancel calls into either an
//! immediate removal from the pending FIFO or a flag for the owning worker.

use crate::config::Config;
use crate::error::{StoreResult, SubmitError};
use crate::store::StateStore;
use crate::types::{
    ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState, ExecutionStatus, QueueStatus,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Default code size cap
///
/// Code travels to the sandbox base64-encoded in environment variables, so
/// this must stay well inside the kernel's combined argv+envp limit.
pub const MAX_CODE_BYTES: usize = 512 * 1024;

/// Bounds enforced before a request is queued
#[derive(Debug, Clone, Copy)]
pub struct SubmissionLimits {
    pub max_timeout_ms: u64,
    pub max_memory_mb: u64,
    pub max_code_bytes: usize,
    /// Cap reported when no worker pool has advertised one yet
    pub default_max_concurrent: u64,
}

impl SubmissionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_timeout_ms: config.max_timeout_ms,
            max_memory_mb: config.max_memory_mb,
            max_code_bytes: MAX_CODE_BYTES,
            default_max_concurrent: config.max_concurrent as u64,
        }
    }

    pub fn validate(&self, request: &ExecutionRequest) -> Result<(), SubmitError> {
        if request.code.trim().is_empty() {
            return Err(SubmitError::invalid("code must not be empty"));
        }
        if request.code.len() > self.max_code_bytes {
            return Err(SubmitError::invalid(format!(
                "code is {} bytes, limit is {}",
                request.code.len(),
                self.max_code_bytes
            )));
        }
        if request.timeout_ms == 0 || request.timeout_ms > self.max_timeout_ms {
            return Err(SubmitError::invalid(format!(
                "timeout_ms must be between 1 and {}",
                self.max_timeout_ms
            )));
        }
        // below this the interpreter itself does not start
        if request.memory_limit_mb < 16 || request.memory_limit_mb > self.max_memory_mb {
            return Err(SubmitError::invalid(format!(
                "memory_limit_mb must be between 16 and {}",
                self.max_memory_mb
            )));
        }
        if request.physics_requirements.is_some() && !request.enable_physics {
            return Err(SubmitError::invalid(
                "physics_requirements given without enable_physics",
            ));
        }
        Ok(())
    }
}

/// Result of a cancel call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the pending queue; no sandbox was ever started
    Dequeued,
    /// Owning worker was told to stop and remove its sandbox
    Signalled,
    NotFound,
    AlreadyFinished,
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Dequeued => "dequeued",
            CancelOutcome::Signalled => "signalled",
            CancelOutcome::NotFound => "not_found",
            CancelOutcome::AlreadyFinished => "already_finished",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CancelOutcome::Dequeued | CancelOutcome::Signalled)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    limits: SubmissionLimits,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn StateStore>, limits: SubmissionLimits) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Validate, then persist as `queued` and append to the pending FIFO in
    /// one store write. Returns at once.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId, SubmitError> {
        self.limits.validate(&request)?;

        let id = ExecutionId::new();
        let status = ExecutionStatus::queued(id, &request, Utc::now());
        self.store.create(&request, &status).await?;

        info!(
            execution_id = %id,
            notebook_id = %request.notebook_id,
            cell_id = %request.cell_id,
            physics = request.enable_physics,
            "Execution queued"
        );
        Ok(id)
    }

    pub async fn status(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionStatus>> {
        self.store.status(id).await
    }

    pub async fn outputs(&self, id: &ExecutionId, from: usize) -> StoreResult<Vec<ExecutionOutput>> {
        self.store.outputs(id, from).await
    }

    pub async fn cancel(&self, id: &ExecutionId) -> StoreResult<CancelOutcome> {
        let Some(status) = self.store.status(id).await? else {
            return Ok(CancelOutcome::NotFound);
        };

        if status.state == ExecutionState::Queued {
            let removed = self.store.remove_pending(id).await?;
            let cancelled = self
                .store
                .transition(
                    id,
                    ExecutionState::Queued,
                    ExecutionState::Cancelled,
                    Utc::now(),
                    Some("cancelled before start"),
                )
                .await?;
            if cancelled {
                info!(execution_id = %id, removed_from_queue = removed, "Queued execution cancelled");
                return Ok(CancelOutcome::Dequeued);
            }
            debug!(execution_id = %id, "Worker claimed execution during cancel");
        }

        // Re-read: the worker may have claimed it or it may have finished meanwhile
        match self.store.status(id).await? {
            Some(status) if status.state == ExecutionState::Running => {
                self.store.request_cancel(id).await?;
                info!(execution_id = %id, "Cancel signalled to owning worker");
                Ok(CancelOutcome::Signalled)
            }
            Some(_) => Ok(CancelOutcome::AlreadyFinished),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    pub async fn queue_status(&self) -> StoreResult<QueueStatus> {
        let pending = self.store.pending_len().await?;
        let running = self.store.running_count().await?;
        let max_concurrent = self
            .store
            .capacity()
            .await?
            .unwrap_or(self.limits.default_max_concurrent);
        Ok(QueueStatus::new(pending, running, max_concurrent))
    }
}

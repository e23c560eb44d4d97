//! Execution state store.
//!
//! Holds everything that must be shared between the submitting side (API,
//! CLI) and the workers: the immutable request, the status record, the
//! ordered output log, the pending FIFO, the set of running executions and
//! cancellation flags. Both sides stay stateless and can be scaled or
//! restarted independently.
//!
//! Status writes go through [`StateStore::transition`], a compare-and-set on
//! the current state, so two parties racing on one execution (a worker
//! claiming it, a caller cancelling it) can never both win.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::{StoreError, StoreResult};
use crate::types::{
    CompletionEvent, ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new request with its `queued` status record and append it
    /// to the tail of the pending FIFO, as one atomic write.
    async fn create(&self, request: &ExecutionRequest, status: &ExecutionStatus)
        -> StoreResult<()>;

    async fn request(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionRequest>>;

    /// Current status, with `output_count` filled from the log length.
    async fn status(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionStatus>>;

    /// Move `id` from `from` to `to` only if it is currently in `from`.
    ///
    /// Returns `Ok(false)` when the record is missing or in another state.
    /// Transitions the state machine forbids are rejected with
    /// [`StoreError::InvalidTransition`] before touching the store.
    async fn transition(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        at: DateTime<Utc>,
        detail: Option<&str>,
    ) -> StoreResult<bool>;

    /// Append one event to the tail of the output log; returns the new length.
    async fn append_output(&self, id: &ExecutionId, output: &ExecutionOutput)
        -> StoreResult<u64>;

    /// Output log suffix starting at index `from`.
    async fn outputs(&self, id: &ExecutionId, from: usize) -> StoreResult<Vec<ExecutionOutput>>;

    /// Put an already-created execution back at the head of the pending FIFO.
    async fn requeue(&self, id: &ExecutionId) -> StoreResult<()>;

    /// Pop the head of the pending FIFO without blocking.
    async fn dequeue(&self) -> StoreResult<Option<ExecutionId>>;

    /// Remove a not-yet-claimed execution from the pending FIFO.
    async fn remove_pending(&self, id: &ExecutionId) -> StoreResult<bool>;

    async fn pending_len(&self) -> StoreResult<u64>;

    async fn mark_running(&self, id: &ExecutionId) -> StoreResult<()>;

    async fn clear_running(&self, id: &ExecutionId) -> StoreResult<()>;

    async fn running_ids(&self) -> StoreResult<Vec<ExecutionId>>;

    async fn running_count(&self) -> StoreResult<u64>;

    async fn request_cancel(&self, id: &ExecutionId) -> StoreResult<()>;

    async fn cancel_requested(&self, id: &ExecutionId) -> StoreResult<bool>;

    /// Concurrency cap advertised by the worker pool.
    async fn set_capacity(&self, max_concurrent: u64) -> StoreResult<()>;

    async fn capacity(&self) -> StoreResult<Option<u64>>;

    async fn publish_completion(&self, event: &CompletionEvent) -> StoreResult<()>;
}

pub(crate) fn check_transition(from: ExecutionState, to: ExecutionState) -> StoreResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

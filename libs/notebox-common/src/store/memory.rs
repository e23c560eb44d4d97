use super::{check_transition, StateStore};
use crate::error::StoreResult;
use crate::types::{
    CompletionEvent, ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    requests: HashMap<ExecutionId, ExecutionRequest>,
    statuses: HashMap<ExecutionId, ExecutionStatus>,
    outputs: HashMap<ExecutionId, Vec<ExecutionOutput>>,
    history: HashMap<ExecutionId, Vec<ExecutionState>>,
    pending: VecDeque<ExecutionId>,
    running: HashSet<ExecutionId>,
    cancels: HashSet<ExecutionId>,
    capacity: Option<u64>,
    completions: Vec<CompletionEvent>,
}

/// In-process store for tests and single-binary embedding
///
/// Same semantics as [`super::RedisStore`]; every operation takes one lock,
/// so compare-and-set and append are trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every state the execution has been in, oldest first
    pub fn history(&self, id: &ExecutionId) -> Vec<ExecutionState> {
        self.lock().history.get(id).cloned().unwrap_or_default()
    }

    pub fn completions(&self) -> Vec<CompletionEvent> {
        self.lock().completions.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create(
        &self,
        request: &ExecutionRequest,
        status: &ExecutionStatus,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let id = status.execution_id;
        inner.requests.insert(id, request.clone());
        inner.statuses.insert(id, status.clone());
        inner.history.insert(id, vec![status.state]);
        inner.pending.push_back(id);
        Ok(())
    }

    async fn request(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionRequest>> {
        Ok(self.lock().requests.get(id).cloned())
    }

    async fn status(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionStatus>> {
        let inner = self.lock();
        let output_count = inner.outputs.get(id).map_or(0, |log| log.len() as u64);
        Ok(inner.statuses.get(id).cloned().map(|mut status| {
            status.output_count = output_count;
            status
        }))
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        at: DateTime<Utc>,
        detail: Option<&str>,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;

        let mut inner = self.lock();
        let applied = match inner.statuses.get_mut(id) {
            Some(status) if status.state == from => {
                status.apply(to, at, detail);
                true
            }
            _ => false,
        };
        if applied {
            inner.history.entry(*id).or_default().push(to);
        }
        Ok(applied)
    }

    async fn append_output(
        &self,
        id: &ExecutionId,
        output: &ExecutionOutput,
    ) -> StoreResult<u64> {
        let mut inner = self.lock();
        let log = inner.outputs.entry(*id).or_default();
        log.push(output.clone());
        Ok(log.len() as u64)
    }

    async fn outputs(&self, id: &ExecutionId, from: usize) -> StoreResult<Vec<ExecutionOutput>> {
        let inner = self.lock();
        Ok(inner
            .outputs
            .get(id)
            .map(|log| log.iter().skip(from).cloned().collect())
            .unwrap_or_default())
    }

    async fn requeue(&self, id: &ExecutionId) -> StoreResult<()> {
        self.lock().pending.push_front(*id);
        Ok(())
    }

    async fn dequeue(&self) -> StoreResult<Option<ExecutionId>> {
        Ok(self.lock().pending.pop_front())
    }

    async fn remove_pending(&self, id: &ExecutionId) -> StoreResult<bool> {
        let mut inner = self.lock();
        let before = inner.pending.len();
        inner.pending.retain(|queued| queued != id);
        Ok(inner.pending.len() != before)
    }

    async fn pending_len(&self) -> StoreResult<u64> {
        Ok(self.lock().pending.len() as u64)
    }

    async fn mark_running(&self, id: &ExecutionId) -> StoreResult<()> {
        self.lock().running.insert(*id);
        Ok(())
    }

    async fn clear_running(&self, id: &ExecutionId) -> StoreResult<()> {
        self.lock().running.remove(id);
        Ok(())
    }

    async fn running_ids(&self) -> StoreResult<Vec<ExecutionId>> {
        Ok(self.lock().running.iter().copied().collect())
    }

    async fn running_count(&self) -> StoreResult<u64> {
        Ok(self.lock().running.len() as u64)
    }

    async fn request_cancel(&self, id: &ExecutionId) -> StoreResult<()> {
        self.lock().cancels.insert(*id);
        Ok(())
    }

    async fn cancel_requested(&self, id: &ExecutionId) -> StoreResult<bool> {
        Ok(self.lock().cancels.contains(id))
    }

    async fn set_capacity(&self, max_concurrent: u64) -> StoreResult<()> {
        self.lock().capacity = Some(max_concurrent);
        Ok(())
    }

    async fn capacity(&self) -> StoreResult<Option<u64>> {
        Ok(self.lock().capacity)
    }

    async fn publish_completion(&self, event: &CompletionEvent) -> StoreResult<()> {
        self.lock().completions.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    async fn seeded(store: &MemoryStore) -> ExecutionId {
        let request = ExecutionRequest {
            code: "x = 1".to_string(),
            cell_id: "c1".to_string(),
            notebook_id: "n1".to_string(),
            execution_count: 1,
            timeout_ms: 1000,
            memory_limit_mb: 128,
            enable_physics: false,
            physics_requirements: None,
            owner: None,
        };
        let id = ExecutionId::new();
        let status = ExecutionStatus::queued(id, &request, Utc::now());
        store.create(&request, &status).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_state() {
        let store = MemoryStore::new();
        let id = seeded(&store).await;

        let now = Utc::now();
        assert!(store
            .transition(&id, ExecutionState::Queued, ExecutionState::Running, now, None)
            .await
            .unwrap());
        // a late cancel of the queued record loses the race
        assert!(!store
            .transition(&id, ExecutionState::Queued, ExecutionState::Cancelled, now, None)
            .await
            .unwrap());
        assert_eq!(
            store.history(&id),
            vec![ExecutionState::Queued, ExecutionState::Running]
        );
    }

    #[tokio::test]
    async fn test_forbidden_transition_is_error() {
        let store = MemoryStore::new();
        let id = seeded(&store).await;
        let err = store
            .transition(
                &id,
                ExecutionState::Completed,
                ExecutionState::Running,
                Utc::now(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_on_unknown_id_is_not_applied() {
        let store = MemoryStore::new();
        let applied = store
            .transition(
                &ExecutionId::new(),
                ExecutionState::Queued,
                ExecutionState::Running,
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_output_log_is_prefix_stable() {
        let store = MemoryStore::new();
        let id = seeded(&store).await;

        store.append_output(&id, &ExecutionOutput::stdout("a")).await.unwrap();
        let first = store.outputs(&id, 0).await.unwrap();

        store.append_output(&id, &ExecutionOutput::stderr("b")).await.unwrap();
        let second = store.outputs(&id, 0).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(first[..], second[..first.len()]);

        let suffix = store.outputs(&id, 1).await.unwrap();
        assert_eq!(suffix, second[1..].to_vec());
        assert!(store.outputs(&id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_queue_is_fifo_and_removable() {
        let store = MemoryStore::new();
        let a = seeded(&store).await;
        let b = seeded(&store).await;
        let c = seeded(&store).await;

        assert!(store.remove_pending(&b).await.unwrap());
        assert!(!store.remove_pending(&b).await.unwrap());
        assert_eq!(store.pending_len().await.unwrap(), 2);
        assert_eq!(store.dequeue().await.unwrap(), Some(a));
        assert_eq!(store.dequeue().await.unwrap(), Some(c));
        assert_eq!(store.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_is_queued_and_pending_in_one_write() {
        let store = MemoryStore::new();
        let id = seeded(&store).await;

        let status = store.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, ExecutionState::Queued);
        assert_eq!(store.pending_len().await.unwrap(), 1);
        assert_eq!(store.dequeue().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head() {
        let store = MemoryStore::new();
        let first = seeded(&store).await;
        let second = seeded(&store).await;

        assert_eq!(store.dequeue().await.unwrap(), Some(first));
        store.requeue(&first).await.unwrap();
        assert_eq!(store.pending_len().await.unwrap(), 2);
        assert_eq!(store.dequeue().await.unwrap(), Some(first));
        assert_eq!(store.dequeue().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_status_reports_output_count() {
        let store = MemoryStore::new();
        let id = seeded(&store).await;
        store.append_output(&id, &ExecutionOutput::stdout("x")).await.unwrap();
        let status = store.status(&id).await.unwrap().unwrap();
        assert_eq!(status.output_count, 1);
    }
}

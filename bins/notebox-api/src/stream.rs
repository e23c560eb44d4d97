// Server-sent event stream of one execution's output log

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use notebox_common::types::{ExecutionId, ExecutionOutput, ExecutionState};
use notebox_common::Orchestrator;
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics::StreamGuard;

/// One step of the tail, before it is framed as SSE
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Output(ExecutionOutput),
    /// Execution is terminal and every output has been sent
    End(ExecutionState),
    /// Could not keep reading; sent as a synthetic error event, then closed
    Failure(String),
}

impl StreamItem {
    fn is_last(&self) -> bool {
        matches!(self, StreamItem::End(_) | StreamItem::Failure(_))
    }

    fn into_event(self) -> Event {
        let framed = match self {
            StreamItem::Output(output) => Event::default().event("output").json_data(&output),
            StreamItem::End(state) => Event::default()
                .event("end")
                .json_data(json!({ "state": state })),
            StreamItem::Failure(reason) => Event::default()
                .event("output")
                .json_data(ExecutionOutput::error("StreamError", reason)),
        };
        framed.unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
    }
}

struct Tail {
    orchestrator: Orchestrator,
    id: ExecutionId,
    cursor: usize,
    poll: Duration,
    ready: VecDeque<StreamItem>,
    _guard: StreamGuard,
}

impl Tail {
    /// Read status, then the log suffix past the cursor.
    ///
    /// The terminal state is written only after the last output was appended,
    /// so a terminal status read BEFORE the log read means the log is complete.
    async fn refill(&mut self) {
        let status = match self.orchestrator.status(&self.id).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                self.ready
                    .push_back(StreamItem::Failure("execution record disappeared".to_string()));
                return;
            }
            Err(e) => {
                warn!(execution_id = %self.id, error = %e, "Stream status read failed");
                self.ready.push_back(StreamItem::Failure(e.to_string()));
                return;
            }
        };

        let outputs = match self.orchestrator.outputs(&self.id, self.cursor).await {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(execution_id = %self.id, error = %e, "Stream log read failed");
                self.ready.push_back(StreamItem::Failure(e.to_string()));
                return;
            }
        };

        let fresh = !outputs.is_empty();
        self.cursor += outputs.len();
        self.ready.extend(outputs.into_iter().map(StreamItem::Output));

        if status.state.is_terminal() {
            self.ready.push_back(StreamItem::End(status.state));
        } else if !fresh {
            tokio::time::sleep(self.poll).await;
        }
    }
}

/// Tail the log of `id` from index 0 until the execution is terminal
pub fn tail(
    orchestrator: Orchestrator,
    id: ExecutionId,
    poll: Duration,
) -> impl Stream<Item = StreamItem> {
    let tail = Tail {
        orchestrator,
        id,
        cursor: 0,
        poll,
        ready: VecDeque::new(),
        _guard: StreamGuard::open(),
    };

    stream::unfold(Some(tail), |tail| async move {
        let mut tail = tail?;
        loop {
            if let Some(item) = tail.ready.pop_front() {
                if item.is_last() {
                    debug!(execution_id = %tail.id, sent = tail.cursor, "Stream closed");
                    return Some((item, None));
                }
                return Some((item, Some(tail)));
            }
            tail.refill().await;
        }
    })
}

pub fn sse(
    orchestrator: Orchestrator,
    id: ExecutionId,
    poll: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = tail(orchestrator, id, poll).map(|item| Ok(item.into_event()));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notebox_common::types::ExecutionRequest;
    use notebox_common::{MemoryStore, StateStore, SubmissionLimits};
    use std::sync::Arc;

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        Orchestrator::new(
            store,
            SubmissionLimits {
                max_timeout_ms: 60_000,
                max_memory_mb: 1024,
                max_code_bytes: 4096,
                default_max_concurrent: 1,
            },
        )
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            code: "print('hi')".to_string(),
            cell_id: "c".to_string(),
            notebook_id: "n".to_string(),
            execution_count: 1,
            timeout_ms: 1000,
            memory_limit_mb: 128,
            enable_physics: false,
            physics_requirements: None,
            owner: None,
        }
    }

    async fn finish(store: &MemoryStore, id: &ExecutionId, state: ExecutionState) {
        let now = std::time::SystemTime::now().into();
        store
            .transition(id, ExecutionState::Queued, ExecutionState::Running, now, None)
            .await
            .unwrap();
        store
            .transition(id, ExecutionState::Running, state, now, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finished_execution_replays_log_then_ends() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = orchestrator.submit(request()).await.unwrap();
        store.append_output(&id, &ExecutionOutput::stdout("a\n")).await.unwrap();
        store.append_output(&id, &ExecutionOutput::stdout("b\n")).await.unwrap();
        finish(&store, &id, ExecutionState::Completed).await;

        let items: Vec<StreamItem> = tail(orchestrator, id, Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], StreamItem::Output(ExecutionOutput::Stdout { .. })));
        assert!(matches!(items[1], StreamItem::Output(ExecutionOutput::Stdout { .. })));
        assert_eq!(items[2], StreamItem::End(ExecutionState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_follows_outputs_appended_later() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = orchestrator.submit(request()).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.append_output(&id, &ExecutionOutput::stdout("late\n")).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                finish(&store, &id, ExecutionState::Timeout).await;
            })
        };

        let items: Vec<StreamItem> = tail(orchestrator, id, Duration::from_millis(10))
            .collect()
            .await;
        writer.await.unwrap();

        assert_eq!(items.len(), 2);
        match &items[0] {
            StreamItem::Output(ExecutionOutput::Stdout { text, .. }) => assert_eq!(text, "late\n"),
            other => panic!("unexpected item: {:?}", other),
        }
        assert_eq!(items[1], StreamItem::End(ExecutionState::Timeout));
    }

    #[tokio::test]
    async fn test_missing_record_fails_once_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let items: Vec<StreamItem> = tail(orchestrator(store), ExecutionId::new(), Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], StreamItem::Failure(_)));
    }
}

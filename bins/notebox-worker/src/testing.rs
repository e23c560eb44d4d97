//! Scripted sandbox runtime and fixtures for worker tests.

use crate::accel::EngineSelector;
use crate::executor::{ExecutionContext, ExecutorSettings};
use crate::harness::HarnessInvocation;
use crate::runtime::{
    ImageRef, ImageSpec, LogChunk, ResourceLimits, SandboxHandle, SandboxRuntime,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use notebox_common::error::StoreResult;
use notebox_common::types::{
    CompletionEvent, ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
use notebox_common::{MemoryStore, Orchestrator, StateStore, StoreError, SubmissionLimits};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What a fake sandbox does, chosen by the submitted code
#[derive(Debug, Clone)]
pub enum Script {
    /// Print `lines` on stdout, `delay` apart, then exit with `exit_code`
    Lines {
        lines: Vec<String>,
        delay: Duration,
        exit_code: i64,
    },
    /// Follow stream breaks after `fail_after` lines; the snapshot has them all
    Broken { lines: Vec<String>, fail_after: usize },
    /// Never print, never exit
    Hang,
    /// `run` fails
    FailRun,
}

impl Script {
    pub fn lines(lines: Vec<String>) -> Self {
        Script::Lines {
            lines,
            delay: Duration::ZERO,
            exit_code: 0,
        }
    }

    pub fn slow(lines: Vec<String>, delay: Duration) -> Self {
        Script::Lines {
            lines,
            delay,
            exit_code: 0,
        }
    }
}

/// Serialize events the way the harness prints them
pub fn events(outputs: &[ExecutionOutput]) -> Vec<String> {
    outputs
        .iter()
        .map(|output| serde_json::to_string(output).unwrap())
        .collect()
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub execution_id: ExecutionId,
    pub invocation: HarnessInvocation,
    pub limits: ResourceLimits,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    scripts_by_container: HashMap<String, Script>,
    alive: HashSet<String>,
    max_alive: usize,
    runs: Vec<RunRecord>,
    stopped: Vec<String>,
    removed: Vec<String>,
    orphans: usize,
}

/// In-process stand-in for the container engine
#[derive(Default)]
pub struct FakeRuntime {
    scripts: HashMap<String, Script>,
    fail_build: bool,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, code: &str, script: Script) -> Self {
        self.scripts.insert(code.to_string(), script);
        self
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn with_orphans(self, orphans: usize) -> Self {
        self.lock().orphans = orphans;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn alive(&self) -> usize {
        self.lock().alive.len()
    }

    pub fn max_alive(&self) -> usize {
        self.lock().max_alive
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.lock().runs.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    fn script_for(&self, container_id: &str) -> Script {
        self.lock()
            .scripts_by_container
            .get(container_id)
            .cloned()
            .unwrap_or_else(|| Script::lines(Vec::new()))
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn build(&self, spec: &ImageSpec) -> Result<ImageRef> {
        if self.fail_build {
            bail!("sandbox image {} not found locally", spec.image);
        }
        Ok(ImageRef(spec.image.clone()))
    }

    async fn run(
        &self,
        _image: &ImageRef,
        invocation: &HarnessInvocation,
        limits: &ResourceLimits,
        execution_id: &ExecutionId,
    ) -> Result<SandboxHandle> {
        let script = self
            .scripts
            .get(&invocation.code)
            .cloned()
            .unwrap_or_else(|| Script::lines(Vec::new()));
        if matches!(script, Script::FailRun) {
            return Err(anyhow!("Failed to start container"));
        }

        let mut state = self.lock();
        state.next_id += 1;
        let container_id = format!("fake-{}", state.next_id);
        state.scripts_by_container.insert(container_id.clone(), script);
        state.alive.insert(container_id.clone());
        state.max_alive = state.max_alive.max(state.alive.len());
        state.runs.push(RunRecord {
            execution_id: *execution_id,
            invocation: invocation.clone(),
            limits: limits.clone(),
        });

        Ok(SandboxHandle {
            name: format!("notebox-{}", execution_id),
            container_id,
            execution_id: *execution_id,
        })
    }

    fn logs<'a>(&'a self, handle: &'a SandboxHandle) -> BoxStream<'a, Result<LogChunk>> {
        match self.script_for(&handle.container_id) {
            Script::Lines { lines, delay, .. } => stream::iter(lines)
                .then(move |line| async move {
                    tokio::time::sleep(delay).await;
                    Ok(LogChunk::stdout(format!("{}\n", line).into_bytes()))
                })
                .boxed(),
            Script::Broken { lines, fail_after } => {
                let delivered: Vec<Result<LogChunk>> = lines
                    .into_iter()
                    .take(fail_after)
                    .map(|line| Ok(LogChunk::stdout(format!("{}\n", line).into_bytes())))
                    .chain(std::iter::once(Err(anyhow!("connection reset by peer"))))
                    .collect();
                stream::iter(delivered).boxed()
            }
            Script::Hang | Script::FailRun => stream::pending::<Result<LogChunk>>().boxed(),
        }
    }

    async fn collect_logs(&self, handle: &SandboxHandle) -> Result<Vec<LogChunk>> {
        match self.script_for(&handle.container_id) {
            Script::Lines { lines, .. } | Script::Broken { lines, .. } => Ok(lines
                .into_iter()
                .map(|line| LogChunk::stdout(format!("{}\n", line).into_bytes()))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<i64> {
        match self.script_for(&handle.container_id) {
            Script::Lines { exit_code, .. } => Ok(exit_code),
            _ => bail!("sandbox {} never exits", handle.name),
        }
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        self.lock().stopped.push(handle.container_id.clone());
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = self.lock();
        if state.alive.remove(&handle.container_id) {
            state.removed.push(handle.container_id.clone());
        }
        Ok(())
    }

    async fn reap_orphans(&self) -> Result<usize> {
        Ok(std::mem::take(&mut self.lock().orphans))
    }
}

pub fn settings() -> ExecutorSettings {
    ExecutorSettings {
        image: ImageSpec {
            image: "notebox-sandbox:test".to_string(),
            pull: false,
        },
        cpu_limit: 1.0,
        pids_limit: 64,
        network: false,
        cancel_poll: Duration::from_millis(50),
    }
}

pub fn test_context(store: Arc<MemoryStore>, runtime: Arc<FakeRuntime>) -> ExecutionContext {
    context_with(store, runtime)
}

pub fn context_with(store: Arc<dyn StateStore>, runtime: Arc<FakeRuntime>) -> ExecutionContext {
    ExecutionContext {
        store,
        runtime,
        selector: EngineSelector::new(false, false, Vec::new()),
        settings: settings(),
    }
}

pub fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
    Orchestrator::new(
        store,
        SubmissionLimits {
            max_timeout_ms: 60_000,
            max_memory_mb: 2048,
            max_code_bytes: 64 * 1024,
            default_max_concurrent: 2,
        },
    )
}

pub fn request(code: &str) -> ExecutionRequest {
    ExecutionRequest {
        code: code.to_string(),
        cell_id: "cell-1".to_string(),
        notebook_id: "notebook-1".to_string(),
        execution_count: 1,
        timeout_ms: 5_000,
        memory_limit_mb: 256,
        enable_physics: false,
        physics_requirements: None,
        owner: None,
    }
}

pub async fn submit(store: &Arc<MemoryStore>, request: ExecutionRequest) -> ExecutionId {
    orchestrator(store.clone()).submit(request).await.unwrap()
}

fn outage() -> StoreError {
    StoreError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

/// Memory store that fails chosen calls the way an unreachable Redis would
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_requests: AtomicU32,
    failing_terminal_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_requests: AtomicU32::new(0),
            failing_terminal_writes: AtomicBool::new(false),
        }
    }

    /// Fail the next `count` request lookups
    pub fn fail_requests(&self, count: u32) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    /// Fail every transition out of `running` until switched off
    pub fn fail_terminal_writes(&self, failing: bool) {
        self.failing_terminal_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn create(&self, request: &ExecutionRequest, status: &ExecutionStatus) -> StoreResult<()> {
        self.inner.create(request, status).await
    }

    async fn request(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionRequest>> {
        let failing = self
            .failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(outage());
        }
        self.inner.request(id).await
    }

    async fn status(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionStatus>> {
        self.inner.status(id).await
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        at: DateTime<Utc>,
        detail: Option<&str>,
    ) -> StoreResult<bool> {
        if from == ExecutionState::Running && self.failing_terminal_writes.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.transition(id, from, to, at, detail).await
    }

    async fn append_output(&self, id: &ExecutionId, output: &ExecutionOutput) -> StoreResult<u64> {
        self.inner.append_output(id, output).await
    }

    async fn outputs(&self, id: &ExecutionId, from: usize) -> StoreResult<Vec<ExecutionOutput>> {
        self.inner.outputs(id, from).await
    }

    async fn requeue(&self, id: &ExecutionId) -> StoreResult<()> {
        self.inner.requeue(id).await
    }

    async fn dequeue(&self) -> StoreResult<Option<ExecutionId>> {
        self.inner.dequeue().await
    }

    async fn remove_pending(&self, id: &ExecutionId) -> StoreResult<bool> {
        self.inner.remove_pending(id).await
    }

    async fn pending_len(&self) -> StoreResult<u64> {
        self.inner.pending_len().await
    }

    async fn mark_running(&self, id: &ExecutionId) -> StoreResult<()> {
        self.inner.mark_running(id).await
    }

    async fn clear_running(&self, id: &ExecutionId) -> StoreResult<()> {
        self.inner.clear_running(id).await
    }

    async fn running_ids(&self) -> StoreResult<Vec<ExecutionId>> {
        self.inner.running_ids().await
    }

    async fn running_count(&self) -> StoreResult<u64> {
        self.inner.running_count().await
    }

    async fn request_cancel(&self, id: &ExecutionId) -> StoreResult<()> {
        self.inner.request_cancel(id).await
    }

    async fn cancel_requested(&self, id: &ExecutionId) -> StoreResult<bool> {
        self.inner.cancel_requested(id).await
    }

    async fn set_capacity(&self, max_concurrent: u64) -> StoreResult<()> {
        self.inner.set_capacity(max_concurrent).await
    }

    async fn capacity(&self) -> StoreResult<Option<u64>> {
        self.inner.capacity().await
    }

    async fn publish_completion(&self, event: &CompletionEvent) -> StoreResult<()> {
        self.inner.publish_completion(event).await
    }
}

/// Execution Lifecycle
///
/// **Core Responsibility:**
/// Drive one claimed execution from `queued` to a terminal state: claim it,
/// launch the sandbox, stream its events into the output log while racing
/// the timeout timer and the cancel flag, then release the sandbox and
/// record the outcome.
///
/// **Ordering guarantees:**
/// - The claim is a compare-and-set; a worker that loses it does nothing
/// - Every output event is appended before the terminal state is written
/// - The sandbox is stopped and removed before the terminal state is written
/// - A store failure before the claim puts the id back at the head of the queue
/// - The running registration is cleared only once a terminal state is
///   recorded; otherwise boot recovery finds it and fails the execution

use crate::accel::EngineSelector;
use crate::harness::{HarnessInvocation, LogDecoder};
use crate::runtime::{ImageSpec, ResourceLimits, SandboxHandle, SandboxRuntime};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use notebox_common::types::{
    CompletionEvent, ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState,
};
use notebox_common::{Config, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Exit code of a process killed by SIGKILL, which is what the kernel OOM killer sends
const EXIT_SIGKILL: i64 = 137;

/// Attempts at the store writes that must not be lost (requeue, terminal state)
const STORE_WRITE_ATTEMPTS: u32 = 3;
const STORE_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Sandbox settings shared by every execution of one worker process
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub image: ImageSpec,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub network: bool,
    pub cancel_poll: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: ImageSpec {
                image: config.sandbox_image.clone(),
                pull: config.sandbox_pull,
            },
            cpu_limit: config.sandbox_cpu_limit,
            pids_limit: config.sandbox_pids_limit,
            network: config.sandbox_network,
            cancel_poll: config.cancel_poll_interval(),
        }
    }

    fn limits_for(&self, request: &ExecutionRequest, invocation: &HarnessInvocation) -> ResourceLimits {
        ResourceLimits::new(request.memory_limit_mb, self.cpu_limit, self.pids_limit)
            .with_network(self.network)
            .with_gpu(invocation.needs_gpu())
    }
}

/// Everything an execution needs, passed explicitly to every worker task
pub struct ExecutionContext {
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub selector: EngineSelector,
    pub settings: ExecutorSettings,
}

/// How supervision of a live sandbox ended
#[derive(Debug)]
enum Supervision {
    /// Output stream closed on its own
    Exited,
    TimedOut,
    Cancelled,
    /// Lost the output stream before the sandbox exited
    StreamFailed(String),
}

/// Run execution `id` to completion.
///
/// Returns the terminal state this worker recorded, or `None` when there was
/// nothing to do (record gone, or the claim was lost to a cancel).
pub async fn execute(ctx: &ExecutionContext, id: ExecutionId) -> Result<Option<ExecutionState>> {
    let request = match ctx.store.request(&id).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            warn!(execution_id = %id, "Dequeued execution has no request record, skipping");
            return Ok(None);
        }
        Err(e) => {
            requeue(ctx, &id).await;
            return Err(e).context("Failed to load execution request");
        }
    };

    let claimed = match ctx
        .store
        .transition(&id, ExecutionState::Queued, ExecutionState::Running, Utc::now(), None)
        .await
    {
        Ok(claimed) => claimed,
        Err(e) => {
            requeue(ctx, &id).await;
            return Err(e).context("Failed to claim execution");
        }
    };
    if !claimed {
        debug!(execution_id = %id, "Execution no longer queued, skipping");
        return Ok(None);
    }

    let started = Instant::now();
    let outcome = match ctx.store.mark_running(&id).await {
        Ok(()) => run_claimed(ctx, &id, &request).await,
        Err(e) => Err(anyhow::Error::new(e).context("Failed to register running execution")),
    };

    match outcome {
        Ok(state) => {
            release_registration(ctx, &id).await;
            Ok(Some(state))
        }
        Err(e) => {
            error!(execution_id = %id, error = %format!("{:#}", e), "Execution aborted");
            let detail = format!("internal error: {:#}", e);
            if fail_claimed(ctx, &id, &detail, started).await {
                release_registration(ctx, &id).await;
            } else {
                // still registered: boot recovery fails it
                error!(
                    execution_id = %id,
                    "Could not record terminal state, leaving execution for recovery"
                );
            }
            Err(e)
        }
    }
}

/// Put a dequeued but unclaimed id back so another pass can pick it up
async fn requeue(ctx: &ExecutionContext, id: &ExecutionId) {
    for attempt in 1..=STORE_WRITE_ATTEMPTS {
        match ctx.store.requeue(id).await {
            Ok(()) => {
                warn!(execution_id = %id, "Store error before claim, execution requeued");
                return;
            }
            Err(e) => {
                warn!(execution_id = %id, attempt, error = %e, "Failed to requeue execution");
                tokio::time::sleep(STORE_WRITE_BACKOFF).await;
            }
        }
    }
    error!(execution_id = %id, "Execution dropped from the pending queue, still queued");
}

/// Move a claimed execution to `error` after an internal failure.
///
/// Returns whether the record is now terminal, either by this write or by
/// someone else's.
async fn fail_claimed(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    detail: &str,
    started: Instant,
) -> bool {
    for attempt in 1..=STORE_WRITE_ATTEMPTS {
        match ctx
            .store
            .transition(id, ExecutionState::Running, ExecutionState::Error, Utc::now(), Some(detail))
            .await
        {
            Ok(true) => {
                let event = CompletionEvent {
                    execution_id: *id,
                    state: ExecutionState::Error,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                };
                if let Err(e) = ctx.store.publish_completion(&event).await {
                    warn!(execution_id = %id, error = %e, "Failed to publish completion event");
                }
                return true;
            }
            Ok(false) => return true,
            Err(e) => {
                warn!(execution_id = %id, attempt, error = %e, "Failed to record error state");
                tokio::time::sleep(STORE_WRITE_BACKOFF).await;
            }
        }
    }
    false
}

async fn release_registration(ctx: &ExecutionContext, id: &ExecutionId) {
    if let Err(e) = ctx.store.clear_running(id).await {
        warn!(execution_id = %id, error = %e, "Failed to clear running registration");
    }
}

async fn run_claimed(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    request: &ExecutionRequest,
) -> Result<ExecutionState> {
    let started = Instant::now();

    if ctx.store.cancel_requested(id).await? {
        info!(execution_id = %id, "Cancelled before launch");
        return finalize(ctx, id, ExecutionState::Cancelled, Some("cancelled before launch"), started)
            .await;
    }

    let physics = request.enable_physics.then(|| {
        ctx.selector
            .select(request.physics_requirements.as_ref())
            .injection()
    });
    let invocation = HarnessInvocation::new(request.code.clone(), physics);
    let limits = ctx.settings.limits_for(request, &invocation);

    let handle = match launch(ctx, id, &invocation, &limits).await {
        Ok(handle) => handle,
        Err(e) => {
            let diagnostic = format!("{:#}", e);
            error!(execution_id = %id, error = %diagnostic, "Sandbox launch failed");
            ctx.store
                .append_output(id, &ExecutionOutput::error("LaunchError", diagnostic.as_str()))
                .await?;
            return finalize(ctx, id, ExecutionState::Error, Some(&diagnostic), started).await;
        }
    };

    info!(
        execution_id = %id,
        container = %handle.name,
        timeout_ms = request.timeout_ms,
        memory_mb = limits.memory_mb,
        gpu = limits.gpu,
        "Sandbox running"
    );

    let mut decoder = LogDecoder::new();
    let timeout = Duration::from_millis(request.timeout_ms);
    let supervision = supervise(ctx, id, &handle, &mut decoder, timeout).await;

    let exit_code = match &supervision {
        Ok(Supervision::Exited) => match ctx.runtime.wait(&handle).await {
            Ok(code) => Some(code),
            Err(e) => {
                warn!(execution_id = %id, error = %format!("{:#}", e), "Could not read exit code");
                None
            }
        },
        _ => None,
    };

    let salvaged = match &supervision {
        Ok(Supervision::StreamFailed(reason)) => {
            warn!(execution_id = %id, error = %reason, "Output stream lost, salvaging from log snapshot");
            salvage_output(ctx, id, &handle, &mut decoder).await
        }
        _ => Ok(()),
    };

    release(ctx, &handle).await;
    let supervision = supervision?;
    salvaged?;

    for output in decoder.finish() {
        ctx.store.append_output(id, &output).await?;
    }

    let (state, detail) = match supervision {
        Supervision::TimedOut => {
            let message = format!("execution exceeded {} ms", request.timeout_ms);
            ctx.store
                .append_output(id, &ExecutionOutput::error("TimeoutError", message.as_str()))
                .await?;
            (ExecutionState::Timeout, Some(message))
        }
        Supervision::Cancelled => (
            ExecutionState::Cancelled,
            Some("cancelled while running".to_string()),
        ),
        Supervision::StreamFailed(reason) => {
            ctx.store
                .append_output(id, &ExecutionOutput::error("SandboxError", reason.as_str()))
                .await?;
            (ExecutionState::Error, Some(reason))
        }
        Supervision::Exited if decoder.saw_error() => (ExecutionState::Error, None),
        Supervision::Exited => match exit_code {
            Some(0) => (ExecutionState::Completed, None),
            code => {
                let message = exit_message(code);
                ctx.store
                    .append_output(id, &ExecutionOutput::error("SandboxExit", message.as_str()))
                    .await?;
                (ExecutionState::Error, Some(message))
            }
        },
    };

    finalize(ctx, id, state, detail.as_deref(), started).await
}

async fn launch(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    invocation: &HarnessInvocation,
    limits: &ResourceLimits,
) -> Result<SandboxHandle> {
    let image = ctx
        .runtime
        .build(&ctx.settings.image)
        .await
        .context("Sandbox image unavailable")?;
    ctx.runtime.run(&image, invocation, limits, id).await
}

/// Race the output pump against the timeout and the cancel flag
async fn supervise(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    handle: &SandboxHandle,
    decoder: &mut LogDecoder,
    timeout: Duration,
) -> Result<Supervision> {
    tokio::select! {
        pumped = tokio::time::timeout(timeout, pump_logs(ctx, id, handle, decoder)) => {
            match pumped {
                Ok(result) => result,
                Err(_) => {
                    info!(execution_id = %id, timeout_ms = timeout.as_millis() as u64, "Execution timed out");
                    Ok(Supervision::TimedOut)
                }
            }
        }
        _ = watch_cancel(ctx, id) => {
            info!(execution_id = %id, "Cancel observed, stopping sandbox");
            Ok(Supervision::Cancelled)
        }
    }
}

async fn pump_logs(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    handle: &SandboxHandle,
    decoder: &mut LogDecoder,
) -> Result<Supervision> {
    let mut logs = ctx.runtime.logs(handle);
    while let Some(chunk) = logs.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Ok(Supervision::StreamFailed(format!("{:#}", e))),
        };
        for output in decoder.push(&chunk) {
            ctx.store.append_output(id, &output).await?;
        }
    }
    Ok(Supervision::Exited)
}

/// Resolves once a cancel has been requested for `id`
async fn watch_cancel(ctx: &ExecutionContext, id: &ExecutionId) {
    let mut ticker = tokio::time::interval(ctx.settings.cancel_poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match ctx.store.cancel_requested(id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => warn!(execution_id = %id, error = %e, "Cancel poll failed"),
        }
    }
}

/// Replay the full log of a stopped sandbox, appending only what the broken
/// follow stream never delivered
async fn salvage_output(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    handle: &SandboxHandle,
    decoder: &mut LogDecoder,
) -> Result<()> {
    if let Err(e) = ctx.runtime.stop(handle).await {
        warn!(container = %handle.name, error = %format!("{:#}", e), "Failed to stop sandbox");
    }
    let chunks = match ctx.runtime.collect_logs(handle).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(execution_id = %id, error = %format!("{:#}", e), "Log snapshot unavailable");
            return Ok(());
        }
    };

    let mut replay = LogDecoder::new();
    let mut already_stored = decoder.emitted();
    for chunk in &chunks {
        for output in replay.push(chunk) {
            if already_stored > 0 {
                already_stored -= 1;
                continue;
            }
            ctx.store.append_output(id, &output).await?;
        }
    }
    *decoder = replay;
    Ok(())
}

async fn release(ctx: &ExecutionContext, handle: &SandboxHandle) {
    if let Err(e) = ctx.runtime.stop(handle).await {
        warn!(container = %handle.name, error = %format!("{:#}", e), "Failed to stop sandbox");
    }
    if let Err(e) = ctx.runtime.remove(handle).await {
        warn!(container = %handle.name, error = %format!("{:#}", e), "Failed to remove sandbox");
    }
}

fn exit_message(code: Option<i64>) -> String {
    match code {
        Some(EXIT_SIGKILL) => format!(
            "sandbox exited with code {} (killed, most likely out of memory)",
            EXIT_SIGKILL
        ),
        Some(code) => format!("sandbox exited with code {}", code),
        None => "sandbox exit status unavailable".to_string(),
    }
}

async fn finalize(
    ctx: &ExecutionContext,
    id: &ExecutionId,
    state: ExecutionState,
    detail: Option<&str>,
    started: Instant,
) -> Result<ExecutionState> {
    let execution_time_ms = started.elapsed().as_millis() as u64;
    let applied = ctx
        .store
        .transition(id, ExecutionState::Running, state, Utc::now(), detail)
        .await?;

    if !applied {
        let current = ctx.store.status(id).await?.map(|status| status.state);
        warn!(
            execution_id = %id,
            wanted = %state,
            current = ?current,
            "Status changed underneath the worker, keeping it"
        );
        return Ok(current.unwrap_or(state));
    }

    info!(
        execution_id = %id,
        state = %state,
        execution_time_ms,
        "Execution finished"
    );

    let event = CompletionEvent {
        execution_id: *id,
        state,
        execution_time_ms,
    };
    if let Err(e) = ctx.store.publish_completion(&event).await {
        warn!(execution_id = %id, error = %e, "Failed to publish completion event");
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::BackendKind;
    use crate::pool::WorkerPool;
    use crate::testing::{
        context_with, events, request, submit, test_context, FakeRuntime, FlakyStore, Script,
    };
    use notebox_common::types::{Complexity, OutputKind, PhysicsRequirements};
    use notebox_common::{CancelOutcome, MemoryStore};

    #[tokio::test]
    async fn test_hello_completes_with_single_stdout() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(
            FakeRuntime::new()
                .script("print('hello')", Script::lines(events(&[ExecutionOutput::stdout("hello\n")]))),
        );
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("print('hello')")).await;

        let state = execute(&ctx, id).await.unwrap();
        assert_eq!(state, Some(ExecutionState::Completed));

        let outputs = store.outputs(&id, 0).await.unwrap();
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            ExecutionOutput::Stdout { text, .. } => assert_eq!(text, "hello\n"),
            other => panic!("unexpected output: {:?}", other),
        }

        assert_eq!(
            store.history(&id),
            vec![ExecutionState::Queued, ExecutionState::Running, ExecutionState::Completed]
        );
        assert_eq!(store.running_count().await.unwrap(), 0);
        assert_eq!(runtime.alive(), 0);
        assert_eq!(store.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_exception_is_error_with_error_event() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().script(
            "1/0",
            Script::lines(events(&[ExecutionOutput::error(
                "ZeroDivisionError",
                "division by zero",
            )])),
        ));
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("1/0")).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Error));

        let outputs = store.outputs(&id, 0).await.unwrap();
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            ExecutionOutput::Error { ename, .. } => assert_eq!(ename, "ZeroDivisionError"),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_loop_times_out_and_releases_sandbox() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().script("while True: pass", Script::Hang));
        let ctx = test_context(store.clone(), runtime.clone());
        let mut slow = request("while True: pass");
        slow.timeout_ms = 2000;
        let id = submit(&store, slow).await;

        let started = Instant::now();
        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(2000));

        let status = store.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, ExecutionState::Timeout);
        assert!(status.completed_at.is_some());

        let outputs = store.outputs(&id, 0).await.unwrap();
        match outputs.last() {
            Some(ExecutionOutput::Error { ename, .. }) => assert_eq!(ename, "TimeoutError"),
            other => panic!("unexpected output: {:?}", other),
        }
        assert_eq!(runtime.alive(), 0);
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_running_stops_sandbox() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().script("while True: pass", Script::Hang));
        let ctx = Arc::new(test_context(store.clone(), runtime.clone()));
        let orchestrator = crate::testing::orchestrator(store.clone());
        let id = submit(&store, request("while True: pass")).await;

        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { execute(&ctx, id).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runtime.alive(), 1);

        assert_eq!(orchestrator.cancel(&id).await.unwrap(), CancelOutcome::Signalled);
        let state = task.await.unwrap().unwrap();
        assert_eq!(state, Some(ExecutionState::Cancelled));
        assert_eq!(runtime.alive(), 0);
        assert_eq!(runtime.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_launch_never_starts_sandbox() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("print(1)")).await;
        store.request_cancel(&id).await.unwrap();

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Cancelled));
        assert!(runtime.runs().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_while_queued_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = test_context(store.clone(), runtime.clone());
        let orchestrator = crate::testing::orchestrator(store.clone());
        let id = submit(&store, request("print(1)")).await;

        assert_eq!(orchestrator.cancel(&id).await.unwrap(), CancelOutcome::Dequeued);
        assert_eq!(execute(&ctx, id).await.unwrap(), None);
        assert!(runtime.runs().is_empty());
        assert_eq!(
            store.status(&id).await.unwrap().unwrap().state,
            ExecutionState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_build_failure_is_error_with_diagnostic() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().failing_build());
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("print(1)")).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Error));

        let status = store.status(&id).await.unwrap().unwrap();
        let detail = status.detail.unwrap_or_default();
        assert!(detail.contains("Sandbox image unavailable"), "detail: {}", detail);

        let outputs = store.outputs(&id, 0).await.unwrap();
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            ExecutionOutput::Error { ename, .. } => assert_eq!(ename, "LaunchError"),
            other => panic!("unexpected output: {:?}", other),
        }
        assert_eq!(runtime.alive(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_is_error_and_frees_running_slot() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().script("boom", Script::FailRun));
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("boom")).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Error));

        let status = store.status(&id).await.unwrap().unwrap();
        assert!(status.detail.unwrap_or_default().contains("Failed to start container"));
        assert_eq!(store.running_count().await.unwrap(), 0);
        assert_eq!(store.completions().len(), 1);
    }

    fn hello_runtime() -> Arc<FakeRuntime> {
        Arc::new(
            FakeRuntime::new()
                .script("print('hello')", Script::lines(events(&[ExecutionOutput::stdout("hello\n")]))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_before_claim_requeues() {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let runtime = hello_runtime();
        let ctx = context_with(flaky.clone(), runtime.clone());
        let id = submit(&memory, request("print('hello')")).await;

        assert_eq!(memory.dequeue().await.unwrap(), Some(id));
        flaky.fail_requests(1);
        assert!(execute(&ctx, id).await.is_err());

        let status = memory.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, ExecutionState::Queued);
        assert_eq!(memory.pending_len().await.unwrap(), 1);
        assert!(memory.running_ids().await.unwrap().is_empty());
        assert!(runtime.runs().is_empty());

        let retried = memory.dequeue().await.unwrap().unwrap();
        assert_eq!(retried, id);
        assert_eq!(
            execute(&ctx, retried).await.unwrap(),
            Some(ExecutionState::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_terminal_state_stays_registered_for_recovery() {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let runtime = hello_runtime();
        let ctx = context_with(flaky.clone(), runtime.clone());
        let id = submit(&memory, request("print('hello')")).await;
        memory.dequeue().await.unwrap();

        flaky.fail_terminal_writes(true);
        assert!(execute(&ctx, id).await.is_err());

        let status = memory.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, ExecutionState::Running);
        assert_eq!(memory.running_ids().await.unwrap(), vec![id]);
        assert_eq!(runtime.alive(), 0);

        flaky.fail_terminal_writes(false);
        let pool = WorkerPool::new(Arc::new(ctx), 1, Duration::from_millis(10));
        let report = pool.recover().await.unwrap();
        assert_eq!(report.interrupted, 1);

        let status = memory.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, ExecutionState::Error);
        assert!(memory.running_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oom_kill_reports_sandbox_exit() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new().script(
            "x = bytearray(10**12)",
            Script::Lines {
                lines: Vec::new(),
                delay: Duration::ZERO,
                exit_code: 137,
            },
        ));
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("x = bytearray(10**12)")).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Error));

        let status = store.status(&id).await.unwrap().unwrap();
        assert!(status.detail.unwrap_or_default().contains("out of memory"));
        let outputs = store.outputs(&id, 0).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind(), OutputKind::Error);
    }

    #[tokio::test]
    async fn test_physics_falls_back_to_cpu() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        let mut ctx = test_context(store.clone(), runtime.clone());
        ctx.selector = EngineSelector::new(false, true, Vec::new());

        let mut physics = request("sim = physics.create_simulation()");
        physics.enable_physics = true;
        physics.physics_requirements = Some(PhysicsRequirements {
            needs_gpu: true,
            memory_hint_mb: None,
            complexity: Complexity::Low,
        });
        let id = submit(&store, physics).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Completed));

        let runs = runtime.runs();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].limits.gpu);
        let injection = runs[0].invocation.physics.as_ref().unwrap();
        assert_eq!(injection.backend, BackendKind::Cpu);
        assert!(injection.context_ready);
    }

    #[tokio::test]
    async fn test_lost_stream_salvages_missing_output() {
        let store = Arc::new(MemoryStore::new());
        let lines = events(&[
            ExecutionOutput::stdout("a\n"),
            ExecutionOutput::stdout("b\n"),
            ExecutionOutput::stdout("c\n"),
        ]);
        let runtime = Arc::new(
            FakeRuntime::new().script("flaky()", Script::Broken { lines, fail_after: 1 }),
        );
        let ctx = test_context(store.clone(), runtime.clone());
        let id = submit(&store, request("flaky()")).await;

        assert_eq!(execute(&ctx, id).await.unwrap(), Some(ExecutionState::Error));

        let texts: Vec<String> = store
            .outputs(&id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|output| match output {
                ExecutionOutput::Stdout { text, .. } => text,
                ExecutionOutput::Error { ename, .. } => ename,
                other => panic!("unexpected output: {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec!["a\n", "b\n", "c\n", "SandboxError"]);
        assert_eq!(runtime.alive(), 0);
    }

    #[test]
    fn test_exit_message_hints_oom() {
        assert!(exit_message(Some(137)).contains("out of memory"));
        assert_eq!(exit_message(Some(2)), "sandbox exited with code 2");
        assert!(exit_message(None).contains("unavailable"));
    }
}

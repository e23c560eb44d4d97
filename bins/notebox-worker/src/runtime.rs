/// Sandbox Runtime Adapter
///
/// **Core Responsibility:**
/// Thin boundary to the container engine: make sure the sandbox image exists,
/// launch one container per execution under mandatory resource limits, expose
/// its output, and tear it down.
///
/// **Contract:**
/// - `run` returns once the container is started, never waits for exit
/// - `stop` / `remove` are idempotent: timeout, cancellation and natural exit
///   can race, so "already stopped" and "no such container" are success
/// - Limits are not optional; every launch carries a full [`ResourceLimits`]

use crate::harness::HarnessInvocation;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use notebox_common::types::ExecutionId;
use std::collections::HashMap;
use tracing::{debug, info};

pub const LABEL_MANAGED: &str = "notebox.managed";
pub const LABEL_EXECUTION: &str = "notebox.execution_id";

/// Image the sandbox is started from
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub image: String,
    /// Pull from a registry when missing locally
    pub pull: bool,
}

/// Resolved, locally available image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

/// Per-sandbox resource ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// Fraction of CPUs, 1.0 = one core
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub network: bool,
    pub gpu: bool,
}

impl ResourceLimits {
    pub fn new(memory_mb: u64, cpu_limit: f64, pids_limit: i64) -> Self {
        Self {
            memory_mb,
            cpu_limit,
            pids_limit,
            network: false,
            gpu: false,
        }
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    fn host_config(&self) -> HostConfig {
        let memory = self.memory_bytes();
        HostConfig {
            memory: Some(memory),
            // swap pinned to memory: no swap beyond the ceiling
            memory_swap: Some(memory),
            nano_cpus: Some(self.nano_cpus()),
            pids_limit: Some(self.pids_limit),
            network_mode: if self.network {
                None
            } else {
                Some("none".to_string())
            },
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,nosuid,size=64m".to_string(),
            )])),
            device_requests: self.gpu.then(|| {
                vec![DeviceRequest {
                    driver: Some("nvidia".to_string()),
                    count: Some(-1),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }
}

/// Running sandbox, owned by exactly one worker for one execution
#[derive(Debug)]
pub struct SandboxHandle {
    pub container_id: String,
    pub name: String,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One chunk of container output, not necessarily line aligned
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

impl LogChunk {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stdout,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stderr,
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Ensure the image is available locally
    async fn build(&self, spec: &ImageSpec) -> Result<ImageRef>;

    /// Create and start a sandbox running the harness
    async fn run(
        &self,
        image: &ImageRef,
        invocation: &HarnessInvocation,
        limits: &ResourceLimits,
        execution_id: &ExecutionId,
    ) -> Result<SandboxHandle>;

    /// Follow output until the sandbox exits
    fn logs<'a>(&'a self, handle: &'a SandboxHandle) -> BoxStream<'a, Result<LogChunk>>;

    /// Snapshot of everything written so far, in order
    async fn collect_logs(&self, handle: &SandboxHandle) -> Result<Vec<LogChunk>>;

    /// Exit code once the sandbox has stopped
    async fn wait(&self, handle: &SandboxHandle) -> Result<i64>;

    async fn stop(&self, handle: &SandboxHandle) -> Result<()>;

    async fn remove(&self, handle: &SandboxHandle) -> Result<()>;

    /// Remove sandboxes left behind by a previous worker process
    async fn reap_orphans(&self) -> Result<usize>;
}

/// Docker-based runtime
///
/// **Docker Execution Rules:**
/// 1. Image must exist locally unless pulling is enabled
/// 2. Container runs the fixed harness; user code travels as data in env
/// 3. No network, capped memory (no swap), CPU share and pid count
/// 4. All capabilities dropped, read-only rootfs, small `/tmp` tmpfs
/// 5. Labelled so leftovers can be found and reaped after a crash
pub struct DockerRuntime {
    docker: Docker,
    stop_grace_secs: i64,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            stop_grace_secs: 1,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(())
    }
}

/// Status codes meaning "nothing left to do" for stop/remove
fn already_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. }
            if matches!(*status_code, 304 | 404 | 409)
    )
}

fn to_chunk(output: LogOutput) -> Option<LogChunk> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(LogChunk::stdout(message.to_vec()))
        }
        LogOutput::StdErr { message } => Some(LogChunk::stderr(message.to_vec())),
        LogOutput::StdIn { .. } => None,
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn build(&self, spec: &ImageSpec) -> Result<ImageRef> {
        if self.docker.inspect_image(&spec.image).await.is_ok() {
            return Ok(ImageRef(spec.image.clone()));
        }

        if !spec.pull {
            bail!(
                "sandbox image {} not found locally; build it with `notebox-cli build-image`",
                spec.image
            );
        }

        info!(image = %spec.image, "Pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: spec.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image {}", spec.image))?;
        }

        Ok(ImageRef(spec.image.clone()))
    }

    async fn run(
        &self,
        image: &ImageRef,
        invocation: &HarnessInvocation,
        limits: &ResourceLimits,
        execution_id: &ExecutionId,
    ) -> Result<SandboxHandle> {
        let name = format!("notebox-{}", execution_id);

        let config = Config {
            image: Some(image.0.clone()),
            cmd: Some(invocation.command()),
            env: Some(invocation.env()?),
            labels: Some(HashMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_EXECUTION.to_string(), execution_id.to_string()),
            ])),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(!limits.network),
            host_config: Some(limits.host_config()),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create container")?;

        let handle = SandboxHandle {
            container_id: container.id,
            name,
            execution_id: *execution_id,
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // never leave a created-but-unstarted container behind
            let _ = self.remove(&handle).await;
            return Err(anyhow::Error::new(e).context("Failed to start container"));
        }

        debug!(
            execution_id = %execution_id,
            container = %handle.name,
            memory_mb = limits.memory_mb,
            gpu = limits.gpu,
            "Sandbox started"
        );
        Ok(handle)
    }

    fn logs<'a>(&'a self, handle: &'a SandboxHandle) -> BoxStream<'a, Result<LogChunk>> {
        let options = Some(LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        });

        self.docker
            .logs(&handle.container_id, options)
            .filter_map(|item| async move {
                match item {
                    Ok(output) => to_chunk(output).map(Ok),
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Log stream failed"))),
                }
            })
            .boxed()
    }

    async fn collect_logs(&self, handle: &SandboxHandle) -> Result<Vec<LogChunk>> {
        let options = Some(LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        });

        let mut collected = Vec::new();
        let mut stream = self.docker.logs(&handle.container_id, options);
        while let Some(item) = stream.next().await {
            if let Some(chunk) = to_chunk(item.context("Failed to read container logs")?) {
                collected.push(chunk);
            }
        }
        Ok(collected)
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self
            .docker
            .wait_container(&handle.container_id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(anyhow::Error::new(e).context("Failed to wait for container")),
            None => bail!("wait stream for {} ended without a result", handle.name),
        }
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_grace_secs,
        };
        match self
            .docker
            .stop_container(&handle.container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_gone(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to stop container")),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&handle.container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_gone(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to remove container")),
        }
    }

    async fn reap_orphans(&self) -> Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}=true", LABEL_MANAGED)],
            )]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list sandbox containers")?;

        let mut reaped = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let remove = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(remove)).await {
                Ok(()) => reaped += 1,
                Err(e) if already_gone(&e) => {}
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to reap container")),
            }
        }
        Ok(reaped)
    }
}

use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use notebox_common::types::{Complexity, PhysicsRequirements};
use notebox_common::{
    Config, ExecutionId, ExecutionOutput, ExecutionRequest, Orchestrator, RedisStore,
    SubmissionLimits,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

const HARNESS_SOURCE: &str = include_str!("../../../sandbox/harness.py");
const DOCKERFILE_TEMPLATE: &str = include_str!("../templates/Dockerfile.hbs");

/// Packages every sandbox image carries; user code gets `np` and matplotlib figures
const BASE_PACKAGES: [&str; 2] = ["numpy", "matplotlib"];

#[derive(Serialize)]
struct DockerfileData<'a> {
    python_version: &'a str,
    packages: Vec<String>,
}

/// Render the sandbox Dockerfile for a Python version and extra pip packages
pub fn render_dockerfile(python_version: &str, extra_packages: &[String]) -> Result<String> {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();
    for package in extra_packages {
        if !packages.contains(package) {
            packages.push(package.clone());
        }
    }

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    let data = DockerfileData {
        python_version,
        packages,
    };
    handlebars
        .render_template(DOCKERFILE_TEMPLATE, &data)
        .context("Failed to render Dockerfile template")
}

/// Initialize the sandbox directory of a Notebox deployment
pub fn init_project(path: &str, python_version: &str, extra_packages: &[String]) -> Result<()> {
    println!("🚀 Initializing Notebox sandbox at: {}", path);

    let sandbox_dir = Path::new(path).join("sandbox");
    fs::create_dir_all(&sandbox_dir)
        .with_context(|| format!("Failed to create directory: {}", sandbox_dir.display()))?;
    println!("  ✅ Created: {}", sandbox_dir.display());

    let harness_path = sandbox_dir.join("harness.py");
    if harness_path.exists() {
        println!("  ⏭️  Kept existing: {}", harness_path.display());
    } else {
        fs::write(&harness_path, HARNESS_SOURCE)
            .with_context(|| format!("Failed to write {}", harness_path.display()))?;
        println!("  ✅ Created: {}", harness_path.display());
    }

    let dockerfile_path = sandbox_dir.join("Dockerfile");
    if dockerfile_path.exists() {
        println!("  ⏭️  Kept existing: {}", dockerfile_path.display());
    } else {
        let dockerfile = render_dockerfile(python_version, extra_packages)?;
        fs::write(&dockerfile_path, dockerfile)
            .with_context(|| format!("Failed to write {}", dockerfile_path.display()))?;
        println!("  ✅ Created: {}", dockerfile_path.display());
    }

    println!("✅ Sandbox initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Build the image: notebox-cli build-image --dir {}", sandbox_dir.display());
    println!("  2. Start Redis, notebox-worker and notebox-api");
    println!("  3. Submit code: notebox-cli submit --file cell.py --follow");

    Ok(())
}

/// Versioned and latest tags for the configured sandbox image
pub fn image_tags(image: &str, version: &str) -> (String, String) {
    // Strip a trailing tag but keep registry ports (host:5000/name)
    let repository = match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    };
    (
        format!("{}:{}", repository, version),
        format!("{}:latest", repository),
    )
}

/// Build the sandbox Docker image
pub fn build_sandbox_image(dir: &Path, version: &str, no_cache: bool) -> Result<()> {
    let config = Config::from_env();
    println!("🐳 Building sandbox image: {}", config.sandbox_image);

    let dockerfile_path = dir.join("Dockerfile");
    if !dockerfile_path.exists() {
        bail!(
            "Dockerfile not found at {}. Generate it first with the init command.",
            dockerfile_path.display()
        );
    }
    if !dir.join("harness.py").exists() {
        bail!("harness.py not found in {}", dir.display());
    }

    let (image_versioned, image_latest) = image_tags(&config.sandbox_image, version);

    println!("📦 Building tags:");
    println!("  - {}", image_versioned);
    println!("  - {}", image_latest);
    println!("📂 Context: {}", dir.display());
    println!("📄 Dockerfile: {}", dockerfile_path.display());

    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        image_versioned.clone(),
        "-t".to_string(),
        image_latest.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];

    if no_cache {
        docker_args.push("--no-cache".to_string());
    }

    docker_args.push(dir.to_string_lossy().to_string());

    println!("\n🔨 Running: docker {}", docker_args.join(" "));
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !status.success() {
        bail!("Docker build failed with exit code: {:?}", status.code());
    }

    println!("✅ Docker image built successfully!");
    if image_latest != config.sandbox_image && image_versioned != config.sandbox_image {
        println!(
            "⚠️  Workers run SANDBOX_IMAGE={}, which is neither of the tags above",
            config.sandbox_image
        );
    }

    Ok(())
}

/// Everything `submit` needs to turn a source file into a request
pub struct SubmitOptions {
    pub file: PathBuf,
    pub cell_id: String,
    pub notebook_id: String,
    pub timeout_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub physics: bool,
    pub needs_gpu: bool,
    pub complexity: Complexity,
}

pub fn build_request(options: &SubmitOptions, config: &Config) -> Result<ExecutionRequest> {
    let code = fs::read_to_string(&options.file)
        .with_context(|| format!("Failed to read {}", options.file.display()))?;

    let physics_requirements = options.physics.then(|| PhysicsRequirements {
        needs_gpu: options.needs_gpu,
        memory_hint_mb: None,
        complexity: options.complexity,
    });

    Ok(ExecutionRequest {
        code,
        cell_id: options.cell_id.clone(),
        notebook_id: options.notebook_id.clone(),
        execution_count: 1,
        timeout_ms: options.timeout_ms.unwrap_or(config.default_timeout_ms),
        memory_limit_mb: options.memory_limit_mb.unwrap_or(config.default_memory_mb),
        enable_physics: options.physics,
        physics_requirements,
        owner: std::env::var("USER").ok(),
    })
}

async fn connect() -> Result<(Orchestrator, Config)> {
    let config = Config::from_env();
    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    let orchestrator = Orchestrator::new(Arc::new(store), SubmissionLimits::from_config(&config));
    Ok((orchestrator, config))
}

fn parse_id(id: &str) -> Result<ExecutionId> {
    id.parse()
        .with_context(|| format!("'{}' is not a valid execution id", id))
}

pub async fn submit(options: SubmitOptions, follow: bool) -> Result<()> {
    let (orchestrator, config) = connect().await?;
    let request = build_request(&options, &config)?;

    println!("📤 Submitting {} ({} bytes)", options.file.display(), request.code.len());
    let id = orchestrator
        .submit(request)
        .await
        .context("Submission rejected")?;
    println!("✅ Queued execution: {}", id);

    if follow {
        follow_outputs(&orchestrator, &config, id).await?;
    }
    Ok(())
}

pub async fn show_status(id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let (orchestrator, _) = connect().await?;

    let Some(status) = orchestrator.status(&id).await? else {
        bail!("Execution {} not found", id);
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn cancel(id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let (orchestrator, _) = connect().await?;

    let outcome = orchestrator.cancel(&id).await?;
    if outcome.is_success() {
        println!("🛑 Cancel accepted for {}: {}", id, outcome.as_str());
    } else {
        println!("⚠️  Nothing to cancel for {}: {}", id, outcome.as_str());
    }
    Ok(())
}

pub async fn queue() -> Result<()> {
    let (orchestrator, _) = connect().await?;
    let status = orchestrator.queue_status().await?;

    println!("📋 Queue:");
    println!("  Pending:         {}", status.pending);
    println!("  Running:         {}", status.running);
    println!("  Max concurrent:  {}", status.max_concurrent);
    println!("  Available slots: {}", status.available_slots);
    Ok(())
}

pub async fn tail(id: &str, follow: bool) -> Result<()> {
    let id = parse_id(id)?;
    let (orchestrator, config) = connect().await?;

    if follow {
        return follow_outputs(&orchestrator, &config, id).await;
    }

    let Some(status) = orchestrator.status(&id).await? else {
        bail!("Execution {} not found", id);
    };
    for output in orchestrator.outputs(&id, 0).await? {
        print_output(&output);
    }
    println!("\n📊 State: {}", status.state);
    Ok(())
}

/// Print outputs as they are appended until the execution is terminal
async fn follow_outputs(orchestrator: &Orchestrator, config: &Config, id: ExecutionId) -> Result<()> {
    let poll = config.stream_poll_interval();
    let mut cursor = 0;

    loop {
        // Status first: a terminal state read here means the log below is complete
        let Some(status) = orchestrator.status(&id).await? else {
            bail!("Execution {} not found", id);
        };
        let outputs = orchestrator.outputs(&id, cursor).await?;
        cursor += outputs.len();
        for output in &outputs {
            print_output(output);
        }

        if status.state.is_terminal() {
            println!("\n📊 State: {}", status.state);
            if let Some(detail) = status.detail {
                println!("   {}", detail);
            }
            return Ok(());
        }
        if outputs.is_empty() {
            tokio::time::sleep(poll).await;
        }
    }
}

fn print_output(output: &ExecutionOutput) {
    match output {
        ExecutionOutput::Stderr { .. } => eprint!("{}", render_output(output)),
        _ => print!("{}", render_output(output)),
    }
}

/// Terminal rendering of one output event
pub fn render_output(output: &ExecutionOutput) -> String {
    match output {
        ExecutionOutput::Stdout { text, .. } | ExecutionOutput::Stderr { text, .. } => {
            text.clone()
        }
        ExecutionOutput::DisplayData { data, .. } => data
            .iter()
            .map(|(mime, payload)| format!("🖼️  [{}: {} bytes base64]\n", mime, payload.len()))
            .collect(),
        ExecutionOutput::Error {
            ename,
            evalue,
            traceback,
            ..
        } => {
            let mut rendered = String::new();
            for line in traceback {
                rendered.push_str(line);
                rendered.push('\n');
            }
            rendered.push_str(&format!("❌ {}: {}\n", ename, evalue));
            rendered
        }
    }
}

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use notebox_common::types::Complexity;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "notebox-cli")]
#[command(about = "Notebox CLI - Manage the sandbox image and drive executions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the sandbox harness and Dockerfile into a project directory
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Python version of the sandbox base image
        #[arg(long, default_value = "3.11")]
        python: String,

        /// Extra pip packages baked into the image
        #[arg(long = "package", value_name = "PACKAGE")]
        packages: Vec<String>,
    },

    /// Build the sandbox Docker image
    BuildImage {
        /// Directory holding the sandbox Dockerfile
        #[arg(short, long, default_value = "sandbox")]
        dir: PathBuf,

        /// Image version tag (also tagged as latest)
        #[arg(short, long, default_value = "v1")]
        tag: String,

        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Queue a code file for execution
    Submit {
        /// Source file to run
        #[arg(short, long)]
        file: PathBuf,

        /// Cell identifier
        #[arg(short, long, default_value = "cli")]
        cell: String,

        /// Notebook identifier
        #[arg(short, long, default_value = "cli")]
        notebook: String,

        /// Wall-clock limit in milliseconds (defaults to DEFAULT_TIMEOUT_MS)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Memory limit in MB (defaults to DEFAULT_MEMORY_MB)
        #[arg(short, long)]
        memory: Option<u64>,

        /// Inject the physics capability
        #[arg(long)]
        physics: bool,

        /// Ask for a GPU backend
        #[arg(long, requires = "physics")]
        gpu: bool,

        /// Simulation size hint
        #[arg(long, value_enum, default_value = "medium", requires = "physics")]
        complexity: ComplexityArg,

        /// Follow the output stream until the execution finishes
        #[arg(long)]
        follow: bool,
    },

    /// Show the status record of an execution
    Status {
        /// Execution id
        id: String,
    },

    /// Cancel a queued or running execution
    Cancel {
        /// Execution id
        id: String,
    },

    /// Show queue depth and pool capacity
    Queue,

    /// Print the outputs of an execution
    Tail {
        /// Execution id
        id: String,

        /// Keep polling until the execution is terminal
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ComplexityArg {
    Low,
    Medium,
    High,
}

impl From<ComplexityArg> for Complexity {
    fn from(arg: ComplexityArg) -> Self {
        match arg {
            ComplexityArg::Low => Complexity::Low,
            ComplexityArg::Medium => Complexity::Medium,
            ComplexityArg::High => Complexity::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            path,
            python,
            packages,
        } => {
            commands::init_project(&path, &python, &packages)?;
        }
        Commands::BuildImage { dir, tag, no_cache } => {
            commands::build_sandbox_image(&dir, &tag, no_cache)?;
        }
        Commands::Submit {
            file,
            cell,
            notebook,
            timeout,
            memory,
            physics,
            gpu,
            complexity,
            follow,
        } => {
            let options = commands::SubmitOptions {
                file,
                cell_id: cell,
                notebook_id: notebook,
                timeout_ms: timeout,
                memory_limit_mb: memory,
                physics,
                needs_gpu: gpu,
                complexity: complexity.into(),
            };
            commands::submit(options, follow).await?;
        }
        Commands::Status { id } => {
            commands::show_status(&id).await?;
        }
        Commands::Cancel { id } => {
            commands::cancel(&id).await?;
        }
        Commands::Queue => {
            commands::queue().await?;
        }
        Commands::Tail { id, follow } => {
            commands::tail(&id, follow).await?;
        }
    }

    Ok(())
}

//! CLI command definitions for stagecrew.
//!
//! Two subcommands: `run` loads the task/role/workflow definitions, builds
//! the engine and drives one or more pipeline runs through the admission
//! limiter; `validate` loads and validates the same definitions without
//! running anything.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::RunWorkspace;
use crate::catalog::{load_roles, load_task, load_workflow, RoleSet, TaskBrief, WorkflowSpec};
use crate::engine::{EngineConfig, PipelineMachine, RunRegistry, TerminalStatus};
use crate::limiter::{AdmissionLimiter, DEFAULT_ADMISSION_LIMIT};
use crate::llm::HttpChatClient;

/// Default directory that per-run workspaces are created under.
const DEFAULT_RUNS_DIR: &str = "./runs";

/// Hard cap on operator-supplied admission limits.
const MAX_ADMISSION_LIMIT: usize = 16;

/// Multi-agent pipeline orchestrator.
#[derive(Parser)]
#[command(name = "stagecrew")]
#[command(about = "Run multi-stage agent pipelines with review gating and bounded rework")]
#[command(version)]
#[command(
    long_about = "stagecrew drives a task brief through an ordered list of stages, each \
executed by a worker identity backed by a chat-completions endpoint. Stages are gated by \
automated reviewers that can retry a stage in place or send the pipeline back to an \
earlier stage, bounded by hard ceilings.\n\nExample usage:\n  stagecrew run --task \
task.yaml --roles roles.yaml --workflow workflow.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute pipeline runs against one or more tasks.
    Run(RunArgs),

    /// Load and validate definition files without running anything.
    Validate(ValidateArgs),
}

/// Arguments for `stagecrew run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task definition file (repeat for multiple concurrent runs).
    #[arg(long, required = true)]
    pub task: Vec<PathBuf>,

    /// Worker identity definition file.
    #[arg(long)]
    pub roles: PathBuf,

    /// Workflow definition file.
    #[arg(long)]
    pub workflow: PathBuf,

    /// Directory to create per-run workspaces under.
    #[arg(long, default_value = DEFAULT_RUNS_DIR)]
    pub runs_dir: PathBuf,

    /// Fallback chat-completions endpoint for identities without their own.
    #[arg(long, env = "STAGECREW_API_BASE")]
    pub endpoint: Option<String>,

    /// Fallback API credential for identities without their own.
    #[arg(long, env = "STAGECREW_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Fallback model for identities without their own.
    #[arg(long, env = "STAGECREW_MODEL")]
    pub model: Option<String>,

    /// Maximum concurrently admitted runs (clamped to 1..=16).
    #[arg(long, default_value_t = DEFAULT_ADMISSION_LIMIT)]
    pub max_concurrent: usize,

    /// Stage-local quality gate retries per stage.
    #[arg(long, default_value_t = 2)]
    pub max_stage_retries: u32,

    /// Pipeline-level rework rounds per run.
    #[arg(long, default_value_t = 3)]
    pub max_rework_rounds: u32,

    /// Tool rounds per stage invocation.
    #[arg(long, default_value_t = 6)]
    pub max_tool_rounds: u32,

    /// Adversarial collision rounds before each stage-local gate.
    #[arg(long, default_value_t = 1)]
    pub collision_rounds: u32,

    /// Deadline in seconds for each executed command.
    #[arg(long, default_value_t = 300)]
    pub command_timeout: u64,
}

/// Arguments for `stagecrew validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Task definition file (repeatable).
    #[arg(long, required = true)]
    pub task: Vec<PathBuf>,

    /// Worker identity definition file.
    #[arg(long)]
    pub roles: PathBuf,

    /// Workflow definition file.
    #[arg(long)]
    pub workflow: PathBuf,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Execute the parsed CLI, returning the process exit code.
///
/// 0 success, 1 bounded run failure, 2 configuration error, 143 cancelled.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_pipelines(args).await,
        Commands::Validate(args) => validate_definitions(args),
    }
}

fn load_definitions(
    roles_path: &PathBuf,
    workflow_path: &PathBuf,
    task_paths: &[PathBuf],
) -> anyhow::Result<(RoleSet, WorkflowSpec, Vec<TaskBrief>)> {
    let roles = load_roles(roles_path)
        .with_context(|| format!("loading roles from {}", roles_path.display()))?;
    let workflow = load_workflow(workflow_path, &roles)
        .with_context(|| format!("loading workflow from {}", workflow_path.display()))?;
    let tasks = task_paths
        .iter()
        .map(|path| {
            load_task(path).with_context(|| format!("loading task from {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((roles, workflow, tasks))
}

fn validate_definitions(args: ValidateArgs) -> anyhow::Result<i32> {
    let (roles, workflow, tasks) = load_definitions(&args.roles, &args.workflow, &args.task)?;
    println!(
        "OK: {} role(s), workflow '{}' with {} stage(s), {} task(s)",
        roles.roles.len(),
        workflow.id,
        workflow.stages.len(),
        tasks.len()
    );
    for def in workflow.stage_defs() {
        println!(
            "  stage '{}' [{}] -> {}",
            def.name,
            def.kind,
            def.default_worker.as_deref().unwrap_or("(task default)")
        );
    }
    Ok(0)
}

async fn run_pipelines(args: RunArgs) -> anyhow::Result<i32> {
    let (roles, workflow, tasks) = load_definitions(&args.roles, &args.workflow, &args.task)?;

    let backend: Arc<HttpChatClient> = Arc::new(
        HttpChatClient::from_env()
            .maybe_endpoint(args.endpoint.clone())
            .maybe_api_key(args.api_key.clone())
            .maybe_model(args.model.clone()),
    );
    let config = EngineConfig::new()
        .with_max_stage_retries(args.max_stage_retries)
        .with_max_rework_rounds(args.max_rework_rounds)
        .with_max_tool_rounds(args.max_tool_rounds)
        .with_collision_rounds(args.collision_rounds)
        .with_command_deadline(Duration::from_secs(args.command_timeout));

    let limiter = AdmissionLimiter::new(args.max_concurrent.min(MAX_ADMISSION_LIMIT));
    let registry = Arc::new(RunRegistry::new());

    // Ctrl-C cancels every registered run; the runs then terminate through
    // their normal cancellation path and still write their artifacts.
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("stop signal received; cancelling in-flight runs");
                registry.cancel_all();
            }
        });
    }

    std::fs::create_dir_all(&args.runs_dir)
        .with_context(|| format!("creating runs dir {}", args.runs_dir.display()))?;
    info!(
        tasks = tasks.len(),
        limit = limiter.limit(),
        runs_dir = %args.runs_dir.display(),
        "starting pipeline runs"
    );

    let mut handles = Vec::new();
    for task in tasks {
        let backend = Arc::clone(&backend);
        let limiter = Arc::clone(&limiter);
        let registry = Arc::clone(&registry);
        let roles = roles.clone();
        let workflow = workflow.clone();
        let config = config.clone();
        let runs_dir = args.runs_dir.clone();

        handles.push(tokio::spawn(async move {
            let _permit = limiter.acquire().await;
            let run_id = short_run_id();
            let workspace = match RunWorkspace::create(&runs_dir, &run_id) {
                Ok(ws) => ws,
                Err(e) => return (run_id, task.id, Err(e.to_string()), 2),
            };
            let cancel = registry.register(&run_id);
            let machine = PipelineMachine::new(backend, task.clone(), roles, workflow, workspace)
                .with_config(config)
                .with_cancel_handle(cancel);
            let result = machine.run().await;
            registry.deregister(&run_id);
            match result {
                Ok(report) => {
                    let code = report.return_code;
                    (run_id, task.id, Ok(report), code)
                }
                Err(e) => (run_id, task.id, Err(e.to_string()), 2),
            }
        }));
    }

    let mut exit_code = 0;
    for handle in handles {
        let (run_id, task_id, result, code) = handle.await.context("run task panicked")?;
        match result {
            Ok(report) => {
                println!("run {} (task {}): {}", run_id, task_id, report.status);
                if let (Some(stage), Some(reason)) = (&report.failing_stage, &report.reason) {
                    println!("  stage '{}': {}", stage, reason);
                }
                if report.status == TerminalStatus::Succeeded {
                    println!("  deliverable: {}", report.deliverable.display());
                }
                println!("  audit: {}", report.audit.display());
            }
            Err(reason) => {
                eprintln!("run {} (task {}): error: {}", run_id, task_id, reason);
            }
        }
        exit_code = worst_exit_code(exit_code, code);
    }
    Ok(exit_code)
}

/// Short uuid-derived run token; long enough to never collide in practice,
/// short enough to read in log lines and directory names.
fn short_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Pick the more severe of two exit codes: configuration (2) outranks
/// cancellation (143) outranks bounded failure (1) outranks success (0).
fn worst_exit_code(a: i32, b: i32) -> i32 {
    fn severity(code: i32) -> u8 {
        match code {
            0 => 0,
            1 => 1,
            143 => 2,
            _ => 3,
        }
    }
    if severity(b) > severity(a) {
        b
    } else {
        a
    }
}

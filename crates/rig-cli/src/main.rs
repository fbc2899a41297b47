mod adapters;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rig_core::approval::ApprovalHandoff;
use rig_core::config::EngineConfig;
use rig_core::model::Issue;
use rig_core::orchestrator::{Engine, EngineError};
use rig_core::store::StateStore;

use adapters::{TracingNotifier, UnimplementedAi, UnimplementedDeploy, UnimplementedGit, UnimplementedTestRunner};

/// Exit code reserved for "a task paused in `awaiting_approval`" (§6): a
/// distinct sentinel from a terminal failure so callers can tell the two
/// apart without parsing stderr.
const EXIT_AWAITING_APPROVAL: i32 = 2;
/// Exit code for "this issue already has a task in flight" (§4.5, §9).
const EXIT_DUPLICATE: i32 = 3;

#[derive(Parser)]
#[command(name = "rig", about = "Task orchestration engine for an AI-assisted software delivery loop")]
struct Cli {
    /// Path to rig.toml (overrides the default `./rig.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default rig.toml (no running engine required)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the webhook HTTP server and drive dispatched tasks to completion
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8080
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Create and run a task directly for one issue, without a webhook delivery
    Execute {
        #[arg(long, default_value = "github")]
        platform: String,
        /// owner/repo
        #[arg(long)]
        repo: String,
        /// Platform-native issue id
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        url: String,
        /// May be repeated
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long, default_value = "")]
        body: String,
        /// Create the task and stop in `queued` without running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Show every tracked task, or the detail of one
    Status {
        /// Task id to show detail for (omit to list all tasks)
        task_id: Option<u64>,
    },
    /// List tasks currently paused in `awaiting_approval`
    Pending,
    /// Approve the pending proposal on a task and resume it at `deploying`
    Approve { task_id: u64 },
    /// Reject the pending proposal on a task; it is failed
    Reject { task_id: u64 },
    /// Print a shell completion script
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = config::resolve(cli.config);

    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "rig", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init { force } => {
            config::scaffold(&config_path, *force)?;
            println!("Config written to {}", config_path.display());
            println!(
                "Set RIG_WEBHOOK_SECRET in the environment before running `rig serve` in production."
            );
            return Ok(());
        }
        _ => {}
    }

    let engine_config = EngineConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let store = StateStore::new(engine_config.state_path.clone());

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!("handled above"),
        Commands::Serve { addr } => run_serve(engine_config, store, &addr).await,
        Commands::Execute {
            platform,
            repo,
            id,
            title,
            url,
            labels,
            body,
            dry_run,
        } => {
            let issue = Issue {
                platform,
                repo,
                id,
                title,
                url,
                labels,
                body,
            };
            let engine = build_engine(engine_config, store).with_dry_run(dry_run);
            report_outcome(engine.execute(issue).await)
        }
        Commands::Status { task_id } => run_status(store, task_id).await,
        Commands::Pending => run_pending(engine_config, store).await,
        Commands::Approve { task_id } => {
            let engine = build_engine(engine_config, store);
            let handoff = ApprovalHandoff::new(&engine);
            report_outcome(handoff.approve(task_id).await)
        }
        Commands::Reject { task_id } => {
            let engine = build_engine(engine_config, store);
            let handoff = ApprovalHandoff::new(&engine);
            report_outcome(handoff.reject(task_id).await)
        }
    }
}

/// Build an [`Engine`] wired to the contract-only adapters in
/// [`adapters`] (§1: AI/Git/Deploy/test backends are out of scope). An
/// operator embedding this crate with real backends builds their own
/// `Engine::new` call instead of going through this binary.
fn build_engine(config: EngineConfig, store: StateStore) -> Engine {
    Engine::new(
        config,
        store,
        Arc::new(UnimplementedAi),
        Arc::new(UnimplementedGit),
        Arc::new(UnimplementedDeploy),
        vec![Arc::new(UnimplementedTestRunner)],
        vec![Arc::new(TracingNotifier)],
    )
}

async fn run_serve(config: EngineConfig, store: StateStore, addr: &str) -> Result<()> {
    let webhook_secret = config.webhook_secret.clone();
    let triggers = config.triggers.clone();
    let engine = Arc::new(build_engine(config, store.clone()));

    let dispatcher_engine = Arc::clone(&engine);
    let dispatcher = move |issue: Issue| {
        let engine = Arc::clone(&dispatcher_engine);
        async move {
            // Dispatched on its own worker, detached from the HTTP request
            // (§5: "multiple tasks for different issues may run in
            // parallel, one worker each").
            tokio::spawn(async move {
                if let Err(err) = engine.execute(issue).await {
                    tracing::warn!(error = %err, "dispatched task did not complete");
                }
            });
            Ok(())
        }
    };

    let router = rig_core::webhook::router(webhook_secret, triggers, store, Arc::new(dispatcher));

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    tracing::info!(%addr, "rig serve listening");
    rig_core::webhook::serve(router, addr, shutdown).await?;
    tracing::info!("rig serve shut down");
    Ok(())
}

async fn run_status(store: StateStore, task_id: Option<u64>) -> Result<()> {
    let state = store.load().await?;
    match task_id {
        Some(id) => {
            let task = state
                .find_task(id)
                .with_context(|| format!("task {id} not found"))?;
            println!("task {}: issue={} phase={}", task.id, task.issue.id, task.phase);
            println!("  branch: {}", task.branch);
            println!("  attempts: {}", task.attempts.len());
            if let Some(pr) = &task.pr {
                println!("  pr: {} ({})", pr.number, pr.url);
            }
            if let Some(sha) = &task.commit_sha {
                println!("  commit: {sha}");
            }
        }
        None => {
            if state.tasks.is_empty() {
                println!("no tasks tracked");
            }
            for task in &state.tasks {
                println!("{}\t{}\t{}", task.id, task.issue.id, task.phase);
            }
        }
    }
    Ok(())
}

async fn run_pending(config: EngineConfig, store: StateStore) -> Result<()> {
    let engine = build_engine(config, store);
    let handoff = ApprovalHandoff::new(&engine);
    let pending = handoff.list_pending().await?;
    if pending.is_empty() {
        println!("no tasks awaiting approval");
    }
    for p in pending {
        println!(
            "task {}\tissue={}\tproposal #{} ({})",
            p.task_id, p.issue_id, p.proposal.id, p.proposal.summary
        );
    }
    Ok(())
}

/// Print an `Execute`/`Resume` outcome and translate it to this binary's
/// exit code, matching the lifecycle exit-code contract (§6): success is
/// 0, `awaiting_approval` is a distinct sentinel, every other failure is
/// non-zero.
fn report_outcome(result: Result<u64, EngineError>) -> Result<()> {
    match result {
        Ok(task_id) => {
            println!("task {task_id}: completed");
            Ok(())
        }
        Err(EngineError::AwaitingApproval { task_id }) => {
            println!("task {task_id}: awaiting approval");
            std::process::exit(EXIT_AWAITING_APPROVAL);
        }
        Err(EngineError::DuplicateInFlight { issue_id }) => {
            eprintln!("issue {issue_id} already has a task in flight");
            std::process::exit(EXIT_DUPLICATE);
        }
        Err(EngineError::Failed { task_id, reason, cause }) => {
            eprintln!("task {task_id}: failed ({reason}): {cause}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

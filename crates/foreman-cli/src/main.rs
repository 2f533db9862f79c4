mod plan_cmds;
mod status_cmd;
mod task_cmds;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman_core::adapter::LiveWorkerAdapter;
use foreman_core::orchestrator::Orchestrator;
use foreman_store::runstate::CoordinatorError;
use foreman_store::StateStore;

use plan_cmds::PlanCommands;
use task_cmds::TaskCommands;

#[derive(Parser)]
#[command(
    name = "foreman",
    about = "Coordinator that drives AI coding workers through task pipelines"
)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap the .foreman state directory for a project
    Init,
    /// Run the coordinator loop until interrupted
    Start {
        /// Exit once the queue is empty and all tasks settled
        #[arg(long)]
        drain: bool,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Run one task to completion and report its final state
    Run {
        /// Task ID to run
        task_id: String,
    },
    /// Clear a task's pending approval gate
    Approve {
        /// Task ID to approve
        task_id: String,
    },
    /// Show coordinator status and queue depth
    Status,
    /// Tail the event log
    Events {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Plan revision management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Pause, resume, or drain the scheduler
    Control {
        /// One of: pause, resume, drain
        action: String,
    },
    /// Run an ad-hoc prompt outside the task pipeline
    Quick {
        /// The prompt text
        prompt: String,
    },
}

fn open_store(project: Option<PathBuf>) -> Result<StateStore> {
    let project_dir = match project {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };
    StateStore::open(&project_dir)
        .with_context(|| format!("failed to open state store in {}", project_dir.display()))
}

fn build_orchestrator(store: &StateStore) -> Arc<Orchestrator> {
    let adapter = Arc::new(LiveWorkerAdapter::new(store.clone()));
    Orchestrator::new(store.clone(), adapter)
}

async fn start(store: StateStore, drain: bool) -> Result<()> {
    let config = store.config.load()?;
    let grace = ChronoDuration::seconds(config.workers.heartbeat_grace_seconds as i64);
    let shift = ChronoDuration::seconds((config.orchestrator.shift_minutes * 60) as i64);

    // Single-coordinator guard; held for the life of the loop.
    let run_state = store.run_state.clone();
    let _guard = match run_state.acquire(grace, shift) {
        Ok(guard) => guard,
        Err(e @ CoordinatorError::AlreadyRunning { .. })
        | Err(e @ CoordinatorError::LockContended) => {
            anyhow::bail!("cannot start coordinator: {e}");
        }
        Err(CoordinatorError::Store(e)) => return Err(e.into()),
    };

    let orchestrator = build_orchestrator(&store);
    if drain {
        orchestrator.control("drain")?;
    } else {
        orchestrator.control("resume")?;
    }

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    tracing::info!(project = %store.project_dir().display(), "coordinator started");
    orchestrator.run_loop().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let store = open_store(cli.project)?;
            println!("initialized {}", store.state_root().display());
        }
        Commands::Start { drain } => {
            let store = open_store(cli.project)?;
            start(store, drain).await?;
        }
        Commands::Task { command } => {
            let store = open_store(cli.project)?;
            task_cmds::run(&store, command).await?;
        }
        Commands::Run { task_id } => {
            let store = open_store(cli.project)?;
            let orchestrator = build_orchestrator(&store);
            let task = orchestrator.run_task(&task_id).await?;
            println!(
                "{} {} [{}]{}",
                task.id,
                task.status,
                task.task_type,
                task.error
                    .as_deref()
                    .map(|e| format!(" error: {e}"))
                    .unwrap_or_default()
            );
        }
        Commands::Approve { task_id } => {
            let store = open_store(cli.project)?;
            let orchestrator = build_orchestrator(&store);
            let task = orchestrator.approve_gate(&task_id)?;
            println!("{} {}", task.id, task.status);
        }
        Commands::Status => {
            let store = open_store(cli.project)?;
            status_cmd::run(&store)?;
        }
        Commands::Events { limit } => {
            let store = open_store(cli.project)?;
            for event in store.events.tail(limit)? {
                println!(
                    "{} [{}] {} {} {}",
                    event.ts.format("%Y-%m-%d %H:%M:%S"),
                    event.channel,
                    event.event_type,
                    event.entity_id,
                    event.payload
                );
            }
        }
        Commands::Plan { command } => {
            let store = open_store(cli.project)?;
            plan_cmds::run(&store, command).await?;
        }
        Commands::Control { action } => {
            let store = open_store(cli.project)?;
            let orchestrator = build_orchestrator(&store);
            let report = orchestrator.control(&action)?;
            println!(
                "status={:?} queue={} in_progress={}",
                report.status, report.queue_depth, report.in_progress
            );
        }
        Commands::Quick { prompt } => {
            let store = open_store(cli.project)?;
            let orchestrator = build_orchestrator(&store);
            let action = orchestrator.run_quick_action(&prompt).await?;
            println!(
                "{} {:?}: {}",
                action.id,
                action.status,
                action.result_summary.as_deref().unwrap_or("(no output)")
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn init_bootstraps_a_state_root() {
        let (_dir, store) = foreman_test_utils::create_temp_store();
        assert!(store.state_root().join("tasks.yaml").exists());
        assert!(store.state_root().join("events.jsonl").exists());
    }
}

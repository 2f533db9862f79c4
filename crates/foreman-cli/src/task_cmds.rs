//! `foreman task ...` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;

use foreman_core::orchestrator::Orchestrator;
use foreman_store::models::{ApprovalMode, HitlMode, Priority, TaskStatus};
use foreman_store::StateStore;

use crate::build_orchestrator;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task
    Add {
        /// Task title
        title: String,
        /// Longer description used in worker prompts
        #[arg(long, default_value = "")]
        description: String,
        /// Task type (feature, bug, refactor, chore, ...)
        #[arg(long, default_value = "feature")]
        task_type: String,
        /// Priority: P0..P3
        #[arg(long, default_value = "P2")]
        priority: Priority,
        /// Auto-approve the commit instead of waiting for human review
        #[arg(long)]
        auto_approve: bool,
        /// HITL mode: autopilot, supervised, collaborative, review_only
        #[arg(long)]
        hitl: Option<String>,
        /// Block on these task ids
        #[arg(long, value_delimiter = ',')]
        blocked_by: Vec<String>,
    },
    /// List tasks, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Show one task in full
    Show { task_id: String },
    /// Cancel a task (soft signal; running workers finish normally)
    Cancel { task_id: String },
    /// Delete a task permanently
    Delete { task_id: String },
}

fn parse_hitl(raw: &str) -> Result<HitlMode> {
    match raw {
        "autopilot" => Ok(HitlMode::Autopilot),
        "supervised" => Ok(HitlMode::Supervised),
        "collaborative" => Ok(HitlMode::Collaborative),
        "review_only" => Ok(HitlMode::ReviewOnly),
        other => anyhow::bail!("invalid hitl mode: {other}"),
    }
}

pub async fn run(store: &StateStore, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Add {
            title,
            description,
            task_type,
            priority,
            auto_approve,
            hitl,
            blocked_by,
        } => {
            let orchestrator: std::sync::Arc<Orchestrator> = build_orchestrator(store);
            let task = orchestrator.create_task(&title, &description, &task_type, priority)?;
            let mut task = task;
            if auto_approve {
                task.approval_mode = ApprovalMode::AutoApprove;
            }
            if let Some(raw) = hitl {
                task.hitl_mode = parse_hitl(&raw)?;
            }
            if !blocked_by.is_empty() {
                for dep_id in &blocked_by {
                    store
                        .tasks
                        .get(dep_id)?
                        .with_context(|| format!("blocker not found: {dep_id}"))?;
                }
                task.blocked_by = blocked_by.clone();
                for dep_id in &blocked_by {
                    if let Some(mut dep) = store.tasks.get(dep_id)? {
                        if !dep.blocks.contains(&task.id) {
                            dep.blocks.push(task.id.clone());
                            store.tasks.upsert(dep)?;
                        }
                    }
                }
            }
            let task = store.tasks.upsert(task)?;
            println!("{} created ({} / {})", task.id, task.task_type, task.priority);
        }
        TaskCommands::List { status } => {
            let mut tasks = store.tasks.list()?;
            if let Some(filter) = status {
                tasks.retain(|t| t.status == filter);
            }
            tasks.sort_by_key(|t| (t.priority.rank(), t.created_at));
            for task in tasks {
                let gate = task
                    .pending_gate
                    .as_deref()
                    .map(|g| format!(" gate={g}"))
                    .unwrap_or_default();
                println!(
                    "{}  {:<12} {:<3} {:<10} {}{}",
                    task.id, task.status, task.priority, task.task_type, task.title, gate
                );
            }
        }
        TaskCommands::Show { task_id } => {
            let task = store
                .tasks
                .get(&task_id)?
                .with_context(|| format!("task not found: {task_id}"))?;
            println!("{}", serde_yaml::to_string(&task)?);
            if let Some(kind) = task.error_type {
                println!("suggested resolution:");
                for step in foreman_core::error::resolution_steps(kind) {
                    println!("  - {step}");
                }
            }
        }
        TaskCommands::Cancel { task_id } => {
            let orchestrator = build_orchestrator(store);
            let task = orchestrator.cancel_task(&task_id)?;
            println!("{} {}", task.id, task.status);
        }
        TaskCommands::Delete { task_id } => {
            if store.tasks.delete(&task_id)? {
                println!("{task_id} deleted");
            } else {
                anyhow::bail!("task not found: {task_id}");
            }
        }
    }
    Ok(())
}

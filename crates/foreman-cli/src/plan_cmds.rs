//! `foreman plan ...` subcommands.

use anyhow::Result;
use clap::Subcommand;

use foreman_core::adapter::LiveWorkerAdapter;
use foreman_core::plan::PlanService;
use foreman_store::models::{PlanSource, RefinePriority};
use foreman_store::StateStore;

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Show a task's plan lineage
    Show { task_id: String },
    /// Add a human-edited plan revision
    Edit {
        task_id: String,
        /// Path to a file with the plan content, or '-' for stdin
        file: String,
    },
    /// Mark a revision as the committed plan
    Commit {
        task_id: String,
        revision_id: String,
    },
    /// Queue and run a refine job against the latest revision
    Refine {
        task_id: String,
        /// Feedback the refined plan must address
        #[arg(long)]
        feedback: String,
        /// Additional instructions for the worker
        #[arg(long)]
        instructions: Option<String>,
        /// Refine with high priority
        #[arg(long)]
        high: bool,
    },
}

pub async fn run(store: &StateStore, command: PlanCommands) -> Result<()> {
    let plans = PlanService::new(store.clone());
    match command {
        PlanCommands::Show { task_id } => {
            let doc = plans.get_plan_document(&task_id)?;
            println!("task: {}", doc.task_id);
            println!(
                "latest: {}   committed: {}",
                doc.latest_revision_id.as_deref().unwrap_or("-"),
                doc.committed_revision_id.as_deref().unwrap_or("-"),
            );
            if let Some(job) = &doc.active_refine_job {
                println!("active refine job: {} ({:?})", job.id, job.status);
            }
            for revision in &doc.revisions {
                println!(
                    "  {}  {:?}  {:?}  parent={}  {}",
                    revision.id,
                    revision.source,
                    revision.status,
                    revision.parent_revision_id.as_deref().unwrap_or("-"),
                    revision.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            if let Some(latest_id) = &doc.latest_revision_id {
                if let Some(latest) = doc.revisions.iter().find(|r| &r.id == latest_id) {
                    println!("\n{}", latest.content);
                }
            }
        }
        PlanCommands::Edit { task_id, file } => {
            let content = if file == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file)?
            };
            let revision = plans.create_revision(
                &task_id,
                &content,
                PlanSource::HumanEdit,
                None,
                None,
                None,
                None,
                None,
            )?;
            println!("{} created", revision.id);
        }
        PlanCommands::Commit {
            task_id,
            revision_id,
        } => {
            plans.commit_revision(&task_id, &revision_id)?;
            println!("{revision_id} committed");
        }
        PlanCommands::Refine {
            task_id,
            feedback,
            instructions,
            high,
        } => {
            let priority = if high {
                RefinePriority::High
            } else {
                RefinePriority::Normal
            };
            let job = plans.queue_refine_job(&task_id, &feedback, instructions, None, priority)?;
            println!("{} queued", job.id);
            let adapter = LiveWorkerAdapter::new(store.clone());
            let job = plans.process_refine_job(&adapter, &job.id).await?;
            match job.result_revision_id {
                Some(revision_id) => println!("{} -> {revision_id}", job.id),
                None => println!(
                    "{} {:?}: {}",
                    job.id,
                    job.status,
                    job.error.as_deref().unwrap_or("")
                ),
            }
        }
    }
    Ok(())
}

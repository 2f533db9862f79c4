//! `foreman status`.

use anyhow::Result;

use foreman_store::models::TaskStatus;
use foreman_store::StateStore;

pub fn run(store: &StateStore) -> Result<()> {
    let config = store.config.load()?;
    let tasks = store.tasks.list()?;

    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

    println!("project:       {}", store.project_dir().display());
    println!("scheduler:     {:?}", config.orchestrator.status);
    println!("concurrency:   {}", config.orchestrator.concurrency);
    println!("auto_deps:     {}", config.orchestrator.auto_deps);
    println!();
    println!("backlog:       {}", count(TaskStatus::Backlog));
    println!("ready:         {}", count(TaskStatus::Ready));
    println!("in_progress:   {}", count(TaskStatus::InProgress));
    println!("in_review:     {}", count(TaskStatus::InReview));
    println!("blocked:       {}", count(TaskStatus::Blocked));
    println!("done:          {}", count(TaskStatus::Done));
    println!("cancelled:     {}", count(TaskStatus::Cancelled));

    let blocked: Vec<_> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    if !blocked.is_empty() {
        println!();
        println!("blocked tasks:");
        for task in blocked {
            println!(
                "  {}  [{}] {}",
                task.id,
                task.error_type
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                task.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

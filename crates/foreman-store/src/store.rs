//! The [`StateStore`]: one handle bundling every repository for a project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bootstrap::{ensure_state_root, EVENTS_FILE, RUNS_DIR, WORKTREES_DIR};
use crate::config::ConfigRepository;
use crate::events::EventLog;
use crate::repo::{
    AgentRepository, PlanRefineJobRepository, PlanRevisionRepository, QuickActionRepository,
    ReviewRepository, RunRepository, StoreResult, TaskRepository,
};
use crate::runstate::RunStateFile;

/// All durable state for one project directory.
///
/// Cheap to clone; repositories are shared behind `Arc` so every component
/// sees the same in-process mutexes.
#[derive(Debug, Clone)]
pub struct StateStore {
    project_dir: PathBuf,
    state_root: PathBuf,
    project_id: String,
    pub tasks: Arc<TaskRepository>,
    pub runs: Arc<RunRepository>,
    pub reviews: Arc<ReviewRepository>,
    pub agents: Arc<AgentRepository>,
    pub quick_actions: Arc<QuickActionRepository>,
    pub plan_revisions: Arc<PlanRevisionRepository>,
    pub plan_refine_jobs: Arc<PlanRefineJobRepository>,
    pub config: Arc<ConfigRepository>,
    pub events: Arc<EventLog>,
    pub run_state: Arc<RunStateFile>,
}

impl StateStore {
    /// Bootstrap (or validate) the state root and open every repository.
    pub fn open(project_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let project_dir = project_dir.into();
        let state_root = ensure_state_root(&project_dir)?;
        let project_id = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        Ok(Self {
            tasks: Arc::new(TaskRepository::new(state_root.join("tasks.yaml"))),
            runs: Arc::new(RunRepository::new(state_root.join("runs.yaml"))),
            reviews: Arc::new(ReviewRepository::new(state_root.join("review_cycles.yaml"))),
            agents: Arc::new(AgentRepository::new(state_root.join("agents.yaml"))),
            quick_actions: Arc::new(QuickActionRepository::new(
                state_root.join("quick_actions.yaml"),
            )),
            plan_revisions: Arc::new(PlanRevisionRepository::new(
                state_root.join("plan_revisions.yaml"),
            )),
            plan_refine_jobs: Arc::new(PlanRefineJobRepository::new(
                state_root.join("plan_refine_jobs.yaml"),
            )),
            config: Arc::new(ConfigRepository::new(state_root.join("config.yaml"))),
            events: Arc::new(EventLog::new(
                state_root.join(EVENTS_FILE),
                project_id.clone(),
            )),
            run_state: Arc::new(RunStateFile::new(&state_root)),
            project_dir,
            state_root,
            project_id,
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Directory holding per-run artifacts (`prompt.txt`, logs, progress).
    pub fn runs_dir(&self) -> PathBuf {
        self.state_root.join(RUNS_DIR)
    }

    /// Directory holding transient per-task worktrees.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_root.join(WORKTREES_DIR)
    }
}

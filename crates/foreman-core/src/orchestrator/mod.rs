//! The orchestrator service: the top-level control loop.
//!
//! Recovers interrupted runs at startup, claims runnable tasks under the
//! concurrency cap, assigns worktrees, walks each task's pipeline with
//! HITL gates and the review loop, merges worktree branches back into the
//! run branch, and tears worktrees down on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foreman_store::config::{Config, OrchestratorStatus};
use foreman_store::models::{
    new_id, now, AgentStatus, ErrorKind, FindingStatus, Priority, QuickActionRun,
    QuickActionStatus, ReviewCycle, ReviewDecision, ReviewFinding, RunRecord, RunStatus,
    SeverityCounts, StepLogEntry, Task, TaskStatus,
};
use foreman_store::StateStore;

use crate::adapter::{GeneratedTaskDraft, StepResult, WorkerAdapter};
use crate::deps::analyze_dependencies;
use crate::fsm::{reduce, AttemptCaps, Disposition, ExecEvent, ExecState};
use crate::hitl::{gate_for_step, should_gate, HUMAN_INTERVENTION_GATE};
use crate::pipeline::condition::{should_skip, CondValue, Namespace};
use crate::pipeline::{PipelineRegistry, PipelineTemplate};
use crate::plan::PlanService;
use crate::prompt::StepCategory;
use crate::verify;
use crate::worktree::{MergeOutcome, WorktreeManager};

/// Default ceiling on one HITL gate wait.
const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(3600);

/// How often a gate wait re-reads the task.
const GATE_POLL: Duration = Duration::from_secs(1);

/// Snapshot returned by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: OrchestratorStatus,
    pub queue_depth: usize,
    pub in_progress: usize,
    pub active_workers: usize,
    pub draining: bool,
    pub run_branch: Option<String>,
}

/// Why a task execution ended; drives final cleanup.
enum ExecEnd {
    Completed,
    Blocked,
    Requeued,
}

/// The coordinator service.
pub struct Orchestrator {
    store: StateStore,
    adapter: Arc<dyn WorkerAdapter>,
    worktrees: Arc<WorktreeManager>,
    registry: PipelineRegistry,
    plans: PlanService,
    caps: AttemptCaps,
    gate_timeout: Duration,
    cancel: CancellationToken,
    draining: AtomicBool,
    recovered: AtomicBool,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    /// One merge (including conflict resolution) at a time across the pool.
    merge_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(store: StateStore, adapter: Arc<dyn WorkerAdapter>) -> Arc<Self> {
        let worktrees = Arc::new(WorktreeManager::new(
            store.project_dir(),
            store.worktrees_dir(),
        ));
        let mut registry = PipelineRegistry::new();
        registry.load_from_yaml(&store.state_root().join("pipelines"));
        Arc::new(Self {
            plans: PlanService::new(store.clone()),
            worktrees,
            registry,
            adapter,
            caps: AttemptCaps::default(),
            gate_timeout: DEFAULT_GATE_TIMEOUT,
            cancel: CancellationToken::new(),
            draining: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            running: Mutex::new(HashMap::new()),
            merge_lock: tokio::sync::Mutex::new(()),
            store,
        })
    }

    /// Shorten the gate wait; used by tests and short-lived runs.
    pub fn with_gate_timeout(self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        // Only safe before the loop starts; Arc::get_mut enforces that.
        let mut this = self;
        if let Some(inner) = Arc::get_mut(&mut this) {
            inner.gate_timeout = timeout;
        }
        this
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn plans(&self) -> &PlanService {
        &self.plans
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------
    // Startup recovery
    // -----------------------------------------------------------------

    /// Reset tasks interrupted by a previous coordinator crash and sweep
    /// orphaned worktrees. Runs once per process.
    pub fn recover(&self) -> Result<()> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks = self.store.tasks.list()?;
        let interrupted: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();

        for task in &interrupted {
            for mut run in self.store.runs.for_task(&task.id)? {
                if run.status == RunStatus::InProgress && run.finished_at.is_none() {
                    run.status = RunStatus::Interrupted;
                    run.finished_at = Some(now());
                    if run.summary.is_none() {
                        run.summary = Some("Interrupted by coordinator restart".to_string());
                    }
                    self.store.runs.upsert(run)?;
                }
            }

            let mut task = task.clone();
            task.status = TaskStatus::Ready;
            task.current_step = None;
            task.current_agent_id = None;
            task.pending_gate = None;
            task.error = Some("Recovered from interrupted run".to_string());
            task.metadata.worktree_dir = None;
            self.store.tasks.upsert(task.clone())?;
            self.store.events.append(
                "tasks",
                "task.recovered",
                &task.id,
                json!({"reason": "coordinator_restart"}),
            )?;
        }

        self.worktrees.sweep_orphans();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------

    pub fn status(&self) -> Result<StatusReport> {
        let config = self.store.config.load()?;
        let tasks = self.store.tasks.list()?;
        let queue_depth = tasks.iter().filter(|t| t.status == TaskStatus::Ready).count();
        let in_progress = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        let active_workers = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        Ok(StatusReport {
            status: config.orchestrator.status,
            queue_depth,
            in_progress,
            active_workers,
            draining: self.draining.load(Ordering::SeqCst),
            run_branch: self.worktrees.run_branch(),
        })
    }

    /// pause / resume / drain / stop.
    pub fn control(&self, action: &str) -> Result<StatusReport> {
        let mut config = self.store.config.load()?;
        match action {
            "pause" => config.orchestrator.status = OrchestratorStatus::Paused,
            "resume" => {
                self.draining.store(false, Ordering::SeqCst);
                config.orchestrator.status = OrchestratorStatus::Running;
            }
            "drain" => {
                self.draining.store(true, Ordering::SeqCst);
                config.orchestrator.status = OrchestratorStatus::Running;
            }
            "stop" => {
                self.cancel.cancel();
                config.orchestrator.status = OrchestratorStatus::Stopped;
            }
            other => bail!("unsupported control action: {other}"),
        }
        self.store.config.save(&config)?;
        self.store.events.append(
            "system",
            "orchestrator.control",
            self.store.project_id(),
            json!({"action": action}),
        )?;
        self.status()
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Drive ticks until cancelled, or until a drain empties the queue.
    pub async fn run_loop(self: Arc<Self>) -> Result<()> {
        self.recover()?;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let handled = match Arc::clone(&self).tick_once().await {
                Ok(handled) => handled,
                Err(e) => {
                    tracing::error!(error = %e, "orchestrator tick failed");
                    false
                }
            };
            let has_inflight = !self
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if self.draining.load(Ordering::SeqCst) && !handled && !has_inflight {
                self.control("pause")?;
                self.draining.store(false, Ordering::SeqCst);
                break;
            }
            let pause = if handled {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(2)
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        self.await_inflight(Duration::from_secs(10)).await;
        Ok(())
    }

    async fn await_inflight(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("task execution did not finish within shutdown timeout");
            }
        }
    }

    /// One scheduling tick. Returns true when a task was claimed.
    pub async fn tick_once(self: Arc<Self>) -> Result<bool> {
        self.recover()?;
        self.sweep_finished();

        let config = self.store.config.load()?;
        if config.orchestrator.status != OrchestratorStatus::Running {
            return Ok(false);
        }
        let _ = self.store.run_state.touch();

        if config.orchestrator.auto_deps {
            if let Err(e) = analyze_dependencies(&self.store, self.adapter.as_ref()).await {
                tracing::warn!(error = %e, "dependency analysis pass failed");
            }
        }

        let Some(claimed) = self
            .store
            .tasks
            .claim_next_runnable(config.orchestrator.concurrency)?
        else {
            return Ok(false);
        };

        self.store.events.append(
            "queue",
            "task.claimed",
            &claimed.id,
            json!({"status": claimed.status.to_string()}),
        )?;

        let this = Arc::clone(&self);
        let task_id = claimed.id.clone();
        let handle = tokio::spawn(async move {
            this.execute_task(claimed).await;
        });
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, handle);
        Ok(true)
    }

    fn sweep_finished(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|task_id, handle| {
            if handle.is_finished() {
                tracing::debug!(task_id = %task_id, "task execution finished");
                false
            } else {
                true
            }
        });
    }

    // -----------------------------------------------------------------
    // Task API
    // -----------------------------------------------------------------

    /// Create a task with config defaults and its resolved pipeline.
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        task_type: &str,
        priority: Priority,
    ) -> Result<Task> {
        let config = self.store.config.load()?;
        let mut task = Task::new(title, task_type);
        task.description = description.to_string();
        task.priority = priority;
        task.status = TaskStatus::Ready;
        task.approval_mode = config.defaults.approval_mode;
        task.quality_gate = config.defaults.quality_gate;
        task.pipeline_template = self
            .registry
            .resolve_for_task_type(task_type)
            .step_names();
        let task = self.store.tasks.upsert(task)?;
        self.store.events.append(
            "tasks",
            "task.created",
            &task.id,
            json!({"task_type": task.task_type, "priority": task.priority.to_string()}),
        )?;
        Ok(task)
    }

    /// Cancel a task: a soft signal observed at gate polls and step
    /// boundaries; running workers finish and their result is discarded.
    pub fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let mut task = self
            .store
            .tasks
            .get(task_id)?
            .with_context(|| format!("task not found: {task_id}"))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        task.status = TaskStatus::Cancelled;
        task.pending_gate = None;
        let task = self.store.tasks.upsert(task)?;
        self.store
            .events
            .append("tasks", "task.cancelled", task_id, json!({}))?;
        Ok(task)
    }

    /// Clear a pending gate. A blocked task returns to `ready`.
    pub fn approve_gate(&self, task_id: &str) -> Result<Task> {
        let mut task = self
            .store
            .tasks
            .get(task_id)?
            .with_context(|| format!("task not found: {task_id}"))?;
        let gate = task.pending_gate.take();
        if task.status == TaskStatus::Blocked {
            task.status = TaskStatus::Ready;
            task.error = None;
            task.error_type = None;
        }
        let task = self.store.tasks.upsert(task)?;
        self.store.events.append(
            "tasks",
            "task.gate_approved",
            task_id,
            json!({"gate": gate}),
        )?;
        Ok(task)
    }

    /// Explicit synchronous run of one task.
    ///
    /// Idempotent against the background loop: an in-flight task is
    /// awaited, a finished task is returned unchanged.
    pub async fn run_task(&self, task_id: &str) -> Result<Task> {
        self.recover()?;
        let task = self
            .store
            .tasks
            .get(task_id)?
            .with_context(|| format!("task not found: {task_id}"))?;

        match task.status {
            TaskStatus::InReview | TaskStatus::Done => return Ok(task),
            TaskStatus::Cancelled => {
                bail!("task {task_id} cannot be run from status=cancelled")
            }
            TaskStatus::InProgress => {
                // Await the in-flight execution.
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let fresh = self
                        .store
                        .tasks
                        .get(task_id)?
                        .with_context(|| format!("task disappeared during execution: {task_id}"))?;
                    if fresh.status != TaskStatus::InProgress {
                        return Ok(fresh);
                    }
                }
            }
            _ => {}
        }

        if task.pending_gate.is_some() {
            bail!(
                "task {task_id} is waiting for gate approval: {}",
                task.pending_gate.as_deref().unwrap_or("")
            );
        }
        for dep_id in &task.blocked_by {
            let dep = self.store.tasks.get(dep_id)?;
            if !dep.map(|d| d.status.is_terminal()).unwrap_or(false) {
                bail!("task {task_id} has unresolved blocker {dep_id}");
            }
        }

        let mut task = task;
        task.status = TaskStatus::InProgress;
        let task = self.store.tasks.upsert(task)?;
        self.execute_task(task).await;

        self.store
            .tasks
            .get(task_id)?
            .with_context(|| format!("task disappeared during execution: {task_id}"))
    }

    // -----------------------------------------------------------------
    // Quick actions
    // -----------------------------------------------------------------

    /// Run an ad-hoc prompt outside the task pipeline.
    pub async fn run_quick_action(&self, prompt: &str) -> Result<QuickActionRun> {
        let mut action = QuickActionRun::new(prompt);
        action.status = QuickActionStatus::Running;
        action.started_at = Some(now());
        let action = self.store.quick_actions.upsert(action)?;
        self.store.events.append(
            "quick_actions",
            "quick_action.started",
            &action.id,
            json!({}),
        )?;

        let mut synthetic = Task::new("Quick action", "chore");
        synthetic.description = prompt.to_string();
        synthetic.source = "system".to_string();
        let result = self.adapter.run_step(&synthetic, "quick_action", 1).await;

        let mut action = action;
        action.finished_at = Some(now());
        action.result_summary = result.summary.clone().or_else(|| result.response_text.clone());
        if result.is_ok() {
            action.status = QuickActionStatus::Completed;
            action.exit_code = Some(0);
        } else {
            action.status = QuickActionStatus::Failed;
            action.exit_code = Some(1);
        }
        let outcome = if result.is_ok() { "completed" } else { "failed" };
        let action = self.store.quick_actions.upsert(action)?;
        self.store.events.append(
            "quick_actions",
            "quick_action.finished",
            &action.id,
            json!({"status": outcome}),
        )?;
        Ok(action)
    }

    /// Promote a finished quick action into a real task.
    pub fn promote_quick_action(&self, action_id: &str, task_type: &str) -> Result<Task> {
        let mut action = self
            .store
            .quick_actions
            .get(action_id)?
            .with_context(|| format!("quick action not found: {action_id}"))?;
        let title: String = action.prompt.chars().take(80).collect();
        let task = self.create_task(&title, &action.prompt, task_type, Priority::default())?;
        action.promoted_task_id = Some(task.id.clone());
        self.store.quick_actions.upsert(action)?;
        Ok(task)
    }

    // -----------------------------------------------------------------
    // Per-task execution
    // -----------------------------------------------------------------

    async fn execute_task(&self, task: Task) {
        let task_id = task.id.clone();
        let end = match self.execute_task_inner(task).await {
            Ok(end) => end,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "unexpected error executing task");
                if let Ok(Some(mut task)) = self.store.tasks.get(&task_id) {
                    task.status = TaskStatus::Blocked;
                    task.error = Some("Internal error during execution".to_string());
                    task.error_type = Some(ErrorKind::Internal);
                    let _ = self.store.tasks.upsert(task);
                    let _ = self.store.events.append(
                        "tasks",
                        "task.blocked",
                        &task_id,
                        json!({"error": "Internal error during execution"}),
                    );
                }
                ExecEnd::Blocked
            }
        };
        let _ = end;
        self.cleanup_worktree(&task_id);
    }

    /// Remove the worktree and task branch on any exit path. The branch
    /// survives only an unresolved merge conflict.
    fn cleanup_worktree(&self, task_id: &str) {
        let Ok(Some(mut task)) = self.store.tasks.get(task_id) else {
            return;
        };
        let preserve_branch = task.metadata.merge_conflict == Some(true);
        if let Some(worktree_dir) = task.metadata.worktree_dir.take() {
            if let Err(e) = self.worktrees.remove_worktree(&worktree_dir) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to remove worktree");
            }
            if !preserve_branch {
                let branch = WorktreeManager::task_branch(task_id);
                if let Err(e) = self.worktrees.delete_branch(&branch) {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to delete task branch");
                }
            }
            let _ = self.store.tasks.upsert(task);
        }
    }

    async fn execute_task_inner(&self, mut task: Task) -> Result<ExecEnd> {
        let config = self.store.config.load()?;

        // 1. Worktree isolation when the project is a git repository.
        let worktree_dir = if self.worktrees.is_git_repo() {
            match self.worktrees.create_worktree(&task.id) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    self.block_task(
                        &mut task,
                        None,
                        ErrorKind::GitCheckoutFailed,
                        format!("failed to create worktree: {e}"),
                        None,
                    )?;
                    return Ok(ExecEnd::Blocked);
                }
            }
        } else {
            None
        };
        if let Some(dir) = &worktree_dir {
            task.metadata.worktree_dir = Some(dir.clone());
            task = self.store.tasks.upsert(task)?;
        }

        // 2. Run record.
        let branch = if worktree_dir.is_some() {
            Some(WorktreeManager::task_branch(&task.id))
        } else {
            self.worktrees.ensure_run_branch().unwrap_or(None)
        };
        let mut run = RunRecord::new(task.id.clone());
        run.status = RunStatus::InProgress;
        run.started_at = Some(now());
        run.branch = branch;
        self.store.runs.upsert(run.clone())?;

        // 3. Resolve the pipeline.
        let template = self.registry.resolve_for_task_type(&task.task_type).clone();
        let steps: Vec<String> = if task.pipeline_template.is_empty() {
            template.step_names()
        } else {
            task.pipeline_template.clone()
        };
        let has_review = steps.iter().any(|s| s == "review");
        let has_commit = steps.iter().any(|s| s == "commit");

        task.pipeline_template = steps.clone();
        task.run_ids.push(run.id.clone());
        task.current_step = steps.first().cloned();
        task.status = TaskStatus::InProgress;
        task.current_agent_id = self.choose_agent_for_task(&mut task, &config)?;
        task = self.store.tasks.upsert(task)?;
        self.store.events.append(
            "tasks",
            "task.started",
            &task.id,
            json!({"run_id": run.id, "agent_id": task.current_agent_id}),
        )?;

        let mut ns = base_namespace(&task);

        // 4. Phase 1: everything before review/commit.
        for step in steps.iter().filter(|s| *s != "review" && *s != "commit") {
            if self.is_cancelled(&task.id)? {
                self.finish_run(&mut run, RunStatus::Interrupted, "Task cancelled")?;
                return Ok(ExecEnd::Completed);
            }

            if let Some(def) = template.step(step) {
                let mut step_ns = ns.clone();
                for (key, value) in &def.config {
                    if let Some(cond) = yaml_scalar(value) {
                        step_ns.insert(key.clone(), cond);
                    }
                }
                if let Some(condition) = def.condition.as_deref() {
                    if should_skip(condition, &step_ns) {
                        self.record_step(&mut run, step, "skipped", None, None)?;
                        continue;
                    }
                }
            }

            if let Some(gate) = gate_for_step(step) {
                if should_gate(task.hitl_mode, gate) {
                    if !self.wait_for_gate(&mut task, gate).await? {
                        self.abort_for_gate(&mut task, &mut run, gate)?;
                        return Ok(ExecEnd::Blocked);
                    }
                }
            }

            // Verification is an internal side-effect, not a worker step.
            let end = if step == "verify" {
                self.run_verify_step(&mut task, &mut run, &template, &config)
                    .await?
            } else {
                self.run_pipeline_step(&mut task, &mut run, &template, step, &mut ns)
                    .await?
            };
            match end {
                StepEnd::Continue => {}
                StepEnd::Blocked => return Ok(ExecEnd::Blocked),
                StepEnd::Requeued => return Ok(ExecEnd::Requeued),
            }
        }

        // 5. Phase 2: the review loop.
        if has_review {
            if should_gate(task.hitl_mode, "after_implement") {
                if !self.wait_for_gate(&mut task, "after_implement").await? {
                    self.abort_for_gate(&mut task, &mut run, "after_implement")?;
                    return Ok(ExecEnd::Blocked);
                }
            }
            match self
                .review_loop(&mut task, &mut run, &template, &config, &mut ns)
                .await?
            {
                StepEnd::Continue => {}
                StepEnd::Blocked => return Ok(ExecEnd::Blocked),
                StepEnd::Requeued => return Ok(ExecEnd::Requeued),
            }
        }

        // 6. Phase 3: commit + merge.
        if has_commit {
            if should_gate(task.hitl_mode, "before_commit") {
                if !self.wait_for_gate(&mut task, "before_commit").await? {
                    self.abort_for_gate(&mut task, &mut run, "before_commit")?;
                    return Ok(ExecEnd::Blocked);
                }
            }

            let commit_sha = self.commit_for_task(&task, worktree_dir.as_deref());
            run.steps.push(StepLogEntry {
                step: "commit".to_string(),
                status: "ok".to_string(),
                ts: now(),
                summary: None,
                open_counts: None,
                commit: commit_sha.clone(),
                human_blocking_issues: None,
            });
            self.store.runs.upsert(run.clone())?;
            self.store.events.append(
                "tasks",
                "task.step",
                &task.id,
                json!({"step": "commit", "status": "ok", "commit": commit_sha}),
            )?;

            if worktree_dir.is_some() {
                task = self.merge_and_cleanup(task).await?;
            }

            if task.metadata.merge_conflict == Some(true) {
                task.metadata.unmerged_branch = Some(WorktreeManager::task_branch(&task.id));
                self.block_task(
                    &mut task,
                    Some(&mut run),
                    ErrorKind::MergeConflict,
                    "Merge conflict could not be resolved automatically".to_string(),
                    None,
                )?;
                return Ok(ExecEnd::Blocked);
            }

            if task.approval_mode == foreman_store::models::ApprovalMode::AutoApprove {
                task.status = TaskStatus::Done;
                task.current_step = None;
                run.status = RunStatus::Done;
                run.summary = Some("Completed with auto-approve".to_string());
                self.store.events.append(
                    "tasks",
                    "task.done",
                    &task.id,
                    json!({"commit": commit_sha}),
                )?;
            } else {
                task.status = TaskStatus::InReview;
                task.current_step = None;
                run.status = RunStatus::InReview;
                run.summary = Some("Awaiting human review".to_string());
                self.store.events.append(
                    "review",
                    "task.awaiting_human",
                    &task.id,
                    json!({"commit": commit_sha}),
                )?;
            }
        } else {
            // Templates without commit finish directly.
            task.status = TaskStatus::Done;
            task.current_step = None;
            run.status = RunStatus::Done;
            run.summary = Some("Pipeline completed".to_string());
            self.store
                .events
                .append("tasks", "task.done", &task.id, json!({}))?;
        }

        task.error = None;
        task.error_type = None;
        self.store.tasks.upsert(task)?;
        run.finished_at = Some(now());
        self.store.runs.upsert(run)?;
        Ok(ExecEnd::Completed)
    }

    // -----------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------

    async fn run_pipeline_step(
        &self,
        task: &mut Task,
        run: &mut RunRecord,
        template: &PipelineTemplate,
        step: &str,
        ns: &mut Namespace,
    ) -> Result<StepEnd> {
        let retry_limit = template.step(step).map(|d| d.retry_limit).unwrap_or(3);

        task.current_step = Some(step.to_string());
        *task = self.store.tasks.upsert(task.clone())?;

        let mut attempt: u32 = 0;
        let result = loop {
            attempt += 1;
            let result = self.adapter.run_step(task, step, attempt).await;
            let transient = result
                .error_type
                .map(ErrorKind::is_auto_resumable)
                .unwrap_or(false);
            if result.is_ok() || result.is_human_blocked() || transient {
                break result;
            }
            if attempt > retry_limit {
                break result;
            }
            tracing::info!(
                task_id = %task.id,
                step,
                attempt,
                "step failed, retrying within budget"
            );
        };

        // Plan steps with no plan document surface a distinct error.
        let mut result = result;
        if result.is_ok()
            && matches!(step, "plan" | "plan_impl")
            && result.summary.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            result = StepResult::error("Plan step produced no plan document", Some(ErrorKind::PlanMissing));
        }

        self.record_step_result(run, step, &result)?;

        if result.is_human_blocked() {
            self.block_for_human_issues(task, run, step, &result)?;
            return Ok(StepEnd::Blocked);
        }

        if !result.is_ok() {
            let kind = result.error_type.unwrap_or(ErrorKind::CodexExit);
            let message = result.summary.clone().unwrap_or_else(|| format!("{step} failed"));
            let exec = ExecState {
                counters: task.metadata.attempts,
                blocked_step: None,
            };
            let event = ExecEvent::WorkerFailed {
                step: step.to_string(),
                kind,
                message: message.clone(),
            };
            let (next, disposition) = reduce(&exec, &event, &self.caps);
            task.metadata.attempts = next.counters;

            return match disposition {
                Disposition::Requeue => {
                    task.status = TaskStatus::Ready;
                    task.retry_count += 1;
                    task.error = Some(message.clone());
                    task.error_type = Some(kind);
                    *task = self.store.tasks.upsert(task.clone())?;
                    self.finish_run(run, RunStatus::Interrupted, &format!("Requeued after {step} failure"))?;
                    self.store.events.append(
                        "tasks",
                        "task.requeued",
                        &task.id,
                        json!({"step": step, "error_type": kind.to_string()}),
                    )?;
                    Ok(StepEnd::Requeued)
                }
                Disposition::Block { kind, reason, gate } => {
                    task.pending_gate = gate.map(str::to_string);
                    self.block_task(task, Some(run), kind, reason, Some(step))?;
                    Ok(StepEnd::Blocked)
                }
                Disposition::Advance => Ok(StepEnd::Continue),
            };
        }

        // Success bookkeeping.
        let exec = ExecState {
            counters: task.metadata.attempts,
            blocked_step: None,
        };
        let (next, _) = reduce(
            &exec,
            &ExecEvent::WorkerSucceeded {
                step: step.to_string(),
            },
            &self.caps,
        );
        task.metadata.attempts = next.counters;
        task.metadata.human_blocking_issues = None;

        // Worker plans become first-class immutable revisions.
        if matches!(step, "plan" | "plan_impl" | "analyze") {
            if let Some(summary) = result.summary.as_deref().map(str::trim).filter(|s| !s.is_empty())
            {
                let (provider, model) = self.plans.worker_lineage(step);
                if let Err(e) = self.plans.create_revision(
                    &task.id,
                    summary,
                    foreman_store::models::PlanSource::WorkerPlan,
                    None,
                    Some(step.to_string()),
                    None,
                    provider,
                    model,
                ) {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to store plan revision");
                }
                // Reload so revision bookkeeping on metadata survives.
                if let Some(fresh) = self.store.tasks.get(&task.id)? {
                    task.metadata = fresh.metadata;
                }
            }
        }

        // Child tasks from generate_tasks output.
        if StepCategory::of(step) == StepCategory::TaskGeneration
            && !result.generated_tasks.is_empty()
        {
            self.create_child_tasks(task, &result.generated_tasks, true)?;
        }

        merge_artifacts(ns, &result);
        *task = self.store.tasks.upsert(task.clone())?;
        Ok(StepEnd::Continue)
    }

    /// Run the `verify` step as an internal side-effect: spawn the
    /// project's configured test commands against the task's working copy
    /// and classify the real exit code. No worker is consulted.
    async fn run_verify_step(
        &self,
        task: &mut Task,
        run: &mut RunRecord,
        template: &PipelineTemplate,
        config: &Config,
    ) -> Result<StepEnd> {
        task.current_step = Some("verify".to_string());
        *task = self.store.tasks.upsert(task.clone())?;

        let project_dir = task
            .metadata
            .worktree_dir
            .clone()
            .unwrap_or_else(|| self.store.project_dir().to_path_buf());
        let commands = verify::test_commands(config, &project_dir);

        let timeout_seconds = task
            .metadata
            .step_timeouts
            .as_ref()
            .and_then(|overrides| overrides.get("verify").copied())
            .filter(|&seconds| seconds > 0)
            .or_else(|| template.step("verify").map(|d| d.timeout_seconds))
            .unwrap_or(600);
        let log_path = self.store.runs_dir().join(&run.id).join("verify.log");

        let outcome = verify::run_test_commands(
            &commands,
            &project_dir,
            &log_path,
            Duration::from_secs(timeout_seconds),
        )
        .await?;

        let status = if outcome.passed { "ok" } else { "error" };
        self.record_step(run, "verify", status, Some(outcome.summary.clone()), None)?;

        let exec = ExecState {
            counters: task.metadata.attempts,
            blocked_step: None,
        };
        let (next, disposition) = reduce(
            &exec,
            &ExecEvent::VerificationResult {
                step: "verify".to_string(),
                passed: outcome.passed,
            },
            &self.caps,
        );
        task.metadata.attempts = next.counters;

        match disposition {
            Disposition::Advance => {
                *task = self.store.tasks.upsert(task.clone())?;
                Ok(StepEnd::Continue)
            }
            Disposition::Requeue => {
                task.status = TaskStatus::Ready;
                task.retry_count += 1;
                task.error = Some(outcome.summary.clone());
                task.error_type = outcome.error_type;
                *task = self.store.tasks.upsert(task.clone())?;
                self.finish_run(run, RunStatus::Interrupted, "Requeued after verify failure")?;
                self.store.events.append(
                    "tasks",
                    "task.requeued",
                    &task.id,
                    json!({
                        "step": "verify",
                        "error_type": outcome.error_type.map(|k| k.to_string()),
                    }),
                )?;
                Ok(StepEnd::Requeued)
            }
            Disposition::Block { kind, reason, gate } => {
                task.pending_gate = gate.map(str::to_string);
                let kind = outcome.error_type.unwrap_or(kind);
                self.block_task(task, Some(run), kind, reason, Some("verify"))?;
                Ok(StepEnd::Blocked)
            }
        }
    }

    async fn review_loop(
        &self,
        task: &mut Task,
        run: &mut RunRecord,
        template: &PipelineTemplate,
        config: &Config,
        ns: &mut Namespace,
    ) -> Result<StepEnd> {
        // The reducer owns the review budget; the configured cap feeds it.
        let caps = AttemptCaps {
            review_fix: config.orchestrator.max_review_attempts.max(1),
            ..self.caps
        };
        // The budget covers one run; a fresh execution starts fresh.
        task.metadata.attempts.review_gen = 0;
        task.metadata.attempts.review_fix = 0;

        let mut review_attempt: u32 = 0;
        loop {
            review_attempt += 1;
            task.current_step = Some("review".to_string());
            *task = self.store.tasks.upsert(task.clone())?;

            let result = self.adapter.run_step(task, "review", review_attempt).await;
            if result.is_human_blocked() {
                self.record_step_result(run, "review", &result)?;
                self.block_for_human_issues(task, run, "review", &result)?;
                return Ok(StepEnd::Blocked);
            }
            if !result.is_ok() {
                let reason = result
                    .summary
                    .clone()
                    .unwrap_or_else(|| "Review step failed".to_string());
                self.record_step_result(run, "review", &result)?;
                self.block_task(task, Some(run), result.error_type.unwrap_or(ErrorKind::CodexExit), reason, Some("review"))?;
                return Ok(StepEnd::Blocked);
            }

            // Findings -> persisted review cycle with a gate decision.
            let findings: Vec<ReviewFinding> = result
                .findings
                .iter()
                .enumerate()
                .map(|(idx, draft)| ReviewFinding {
                    id: format!("{}-a{}-{}", task.id, review_attempt, idx),
                    task_id: task.id.clone(),
                    severity: draft.severity,
                    category: draft
                        .category
                        .clone()
                        .unwrap_or_else(|| "quality".to_string()),
                    summary: if draft.summary.is_empty() {
                        "Issue".to_string()
                    } else {
                        draft.summary.clone()
                    },
                    file: draft.file.clone(),
                    line: draft.line,
                    suggested_fix: draft.suggested_fix.clone(),
                    status: FindingStatus::Open,
                })
                .collect();

            let mut open_counts = SeverityCounts::default();
            for finding in &findings {
                if finding.status == FindingStatus::Open {
                    open_counts.increment(finding.severity);
                }
            }
            let decision = if open_counts.exceeds(&task.quality_gate) {
                ReviewDecision::ChangesRequested
            } else {
                ReviewDecision::Approved
            };

            let cycle = ReviewCycle {
                id: new_id("rc"),
                task_id: task.id.clone(),
                attempt: review_attempt,
                findings: findings.clone(),
                open_counts,
                decision,
                created_at: now(),
            };
            self.store.reviews.append(cycle)?;

            run.steps.push(StepLogEntry {
                step: "review".to_string(),
                status: decision.to_string(),
                ts: now(),
                summary: None,
                open_counts: Some(open_counts),
                commit: None,
                human_blocking_issues: None,
            });
            self.store.runs.upsert(run.clone())?;
            self.store.events.append(
                "review",
                "task.reviewed",
                &task.id,
                json!({
                    "attempt": review_attempt,
                    "decision": decision.to_string(),
                    "open_counts": open_counts,
                }),
            )?;
            self.store.events.append(
                "tasks",
                "task.step",
                &task.id,
                json!({"step": "review", "status": decision.to_string()}),
            )?;

            let exec = ExecState {
                counters: task.metadata.attempts,
                blocked_step: None,
            };
            let (next, disposition) = reduce(
                &exec,
                &ExecEvent::ReviewResult {
                    approved: decision == ReviewDecision::Approved,
                },
                &caps,
            );
            task.metadata.attempts = next.counters;

            match disposition {
                Disposition::Advance => {
                    *task = self.store.tasks.upsert(task.clone())?;
                    return Ok(StepEnd::Continue);
                }
                Disposition::Block { kind, reason, gate } => {
                    task.pending_gate = gate.map(str::to_string);
                    if let Some(blocked_step) = next.blocked_step {
                        task.current_step = Some(blocked_step);
                    }
                    self.block_task(task, Some(run), kind, reason, None)?;
                    return Ok(StepEnd::Blocked);
                }
                // Another fix round fits in the budget.
                Disposition::Requeue => {}
            }

            // Stash open findings so fix steps see them in the prompt.
            let open: Vec<ReviewFinding> = findings
                .into_iter()
                .filter(|f| f.status == FindingStatus::Open)
                .collect();
            task.metadata.review_findings = Some(open);
            *task = self.store.tasks.upsert(task.clone())?;

            for fix_step in ["implement_fix", "verify"] {
                task.retry_count += 1;
                *task = self.store.tasks.upsert(task.clone())?;
                let end = if fix_step == "verify" {
                    self.run_verify_step(task, run, template, config).await?
                } else {
                    self.run_pipeline_step(task, run, template, fix_step, ns)
                        .await?
                };
                match end {
                    StepEnd::Continue => {}
                    other => return Ok(other),
                }
            }
            task.metadata.review_findings = None;
            *task = self.store.tasks.upsert(task.clone())?;
        }
    }

    // -----------------------------------------------------------------
    // Merge coordination
    // -----------------------------------------------------------------

    async fn merge_and_cleanup(&self, mut task: Task) -> Result<Task> {
        // The guard spans merge, conflict resolution, and the resolution
        // commit: a second task must not touch the run branch while the
        // index holds conflict state.
        let _merge_guard = self.merge_lock.lock().await;
        match self.worktrees.merge_task_branch(&task.id) {
            Ok(MergeOutcome::Merged) => {
                task.metadata.merge_conflict = None;
            }
            Ok(MergeOutcome::Conflict { files }) => {
                let resolved = self.resolve_merge_conflict(&mut task, &files).await?;
                if !resolved {
                    self.worktrees.abort_merge();
                    task.metadata.merge_conflict = Some(true);
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "merge failed");
                self.worktrees.abort_merge();
                task.metadata.merge_conflict = Some(true);
            }
        }

        // Worktree removal happens here (before branch policy) so a later
        // cleanup pass only has the branch to deal with.
        if let Some(worktree_dir) = task.metadata.worktree_dir.clone() {
            if let Err(e) = self.worktrees.remove_worktree(&worktree_dir) {
                tracing::warn!(task_id = %task.id, error = %e, "failed to remove worktree after merge");
            }
        }
        if task.metadata.merge_conflict != Some(true) {
            let branch = WorktreeManager::task_branch(&task.id);
            if let Err(e) = self.worktrees.delete_branch(&branch) {
                tracing::warn!(task_id = %task.id, error = %e, "failed to delete merged branch");
            }
        }
        task.metadata.worktree_dir = None;
        Ok(self.store.tasks.upsert(task)?)
    }

    /// Dispatch a `resolve_merge` step against the project directory.
    async fn resolve_merge_conflict(&self, task: &mut Task, files: &[String]) -> Result<bool> {
        // Capture conflicted contents with their markers.
        let mut contents = std::collections::BTreeMap::new();
        for file in files {
            let full = self.store.project_dir().join(file);
            if let Ok(text) = std::fs::read_to_string(&full) {
                contents.insert(file.clone(), text);
            }
        }
        if contents.is_empty() {
            return Ok(false);
        }

        let others: Vec<String> = self
            .store
            .tasks
            .list()?
            .iter()
            .filter(|t| t.id != task.id && t.status == TaskStatus::Done)
            .map(|t| format!("- {}: {}", t.title, t.description))
            .collect();

        // The resolver must run in the project dir where the conflict
        // lives, not the task worktree.
        let saved_worktree_dir = task.metadata.worktree_dir.take();
        task.metadata.merge_conflict_files = Some(contents);
        task.metadata.merge_other_tasks = Some(others);
        *task = self.store.tasks.upsert(task.clone())?;

        let result = self.adapter.run_step(task, "resolve_merge", 1).await;

        let resolved = if result.is_ok() {
            match self.worktrees.commit_merge_resolution() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to commit merge resolution");
                    false
                }
            }
        } else {
            false
        };

        // Restore state whatever happened.
        task.metadata.merge_conflict_files = None;
        task.metadata.merge_other_tasks = None;
        task.metadata.worktree_dir = saved_worktree_dir;
        *task = self.store.tasks.upsert(task.clone())?;
        Ok(resolved)
    }

    fn commit_for_task(&self, task: &Task, worktree_dir: Option<&std::path::Path>) -> Option<String> {
        let outcome = match worktree_dir {
            Some(dir) => self.worktrees.commit_in_worktree(task, dir),
            None if self.worktrees.is_git_repo() => self.worktrees.commit_in_project(task),
            None => return None,
        };
        match outcome {
            Ok(sha) => Some(sha),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "commit failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // Gates & blocking
    // -----------------------------------------------------------------

    fn is_cancelled(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .store
            .tasks
            .get(task_id)?
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(true))
    }

    /// Park the task on a gate and poll until it clears.
    ///
    /// Returns false on timeout, coordinator shutdown, or cancellation.
    async fn wait_for_gate(&self, task: &mut Task, gate_name: &str) -> Result<bool> {
        task.pending_gate = Some(gate_name.to_string());
        *task = self.store.tasks.upsert(task.clone())?;
        self.store.events.append(
            "tasks",
            "task.gate_waiting",
            &task.id,
            json!({"gate": gate_name}),
        )?;

        let deadline = tokio::time::Instant::now() + self.gate_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let Some(fresh) = self.store.tasks.get(&task.id)? else {
                return Ok(false);
            };
            if fresh.status == TaskStatus::Cancelled {
                return Ok(false);
            }
            if fresh.pending_gate.is_none() {
                *task = fresh;
                return Ok(true);
            }
            tokio::time::sleep(GATE_POLL).await;
        }
        Ok(false)
    }

    fn abort_for_gate(&self, task: &mut Task, run: &mut RunRecord, gate_name: &str) -> Result<()> {
        task.pending_gate = None;
        self.block_task(
            task,
            Some(run),
            ErrorKind::Internal,
            format!("Gate '{gate_name}' was not approved in time"),
            None,
        )?;
        run.summary = Some(format!("Blocked at gate: {gate_name}"));
        self.store.runs.upsert(run.clone())?;
        Ok(())
    }

    fn block_for_human_issues(
        &self,
        task: &mut Task,
        run: &mut RunRecord,
        step: &str,
        result: &StepResult,
    ) -> Result<()> {
        let exec = ExecState {
            counters: task.metadata.attempts,
            blocked_step: None,
        };
        let event = ExecEvent::ProgressHumanBlockers {
            step: step.to_string(),
            issues: result.human_blocking_issues.clone(),
        };
        let (next, disposition) = reduce(&exec, &event, &self.caps);
        task.metadata.attempts = next.counters;

        // The reducer always blocks on escalations.
        let (kind, reason, gate) = match disposition {
            Disposition::Block { kind, reason, gate } => (kind, reason, gate),
            _ => (
                ErrorKind::BlockingIssues,
                "Human intervention required to continue".to_string(),
                Some(HUMAN_INTERVENTION_GATE),
            ),
        };

        task.current_step = next.blocked_step.or_else(|| Some(step.to_string()));
        task.pending_gate = gate.map(str::to_string);
        task.metadata.human_blocking_issues = Some(result.human_blocking_issues.clone());
        task.status = TaskStatus::Blocked;
        task.error = Some(reason);
        task.error_type = Some(kind);
        *task = self.store.tasks.upsert(task.clone())?;

        self.finish_run(
            run,
            RunStatus::Blocked,
            &format!("Blocked during {step}: human intervention required"),
        )?;

        self.store.events.append(
            "tasks",
            "task.gate_waiting",
            &task.id,
            json!({
                "gate": task.pending_gate,
                "step": step,
                "issues": result.human_blocking_issues,
            }),
        )?;
        self.store.events.append(
            "tasks",
            "task.blocked",
            &task.id,
            json!({
                "error": task.error,
                "error_type": kind.to_string(),
                "gate": task.pending_gate,
                "step": step,
            }),
        )?;
        Ok(())
    }

    fn block_task(
        &self,
        task: &mut Task,
        run: Option<&mut RunRecord>,
        kind: ErrorKind,
        reason: String,
        step: Option<&str>,
    ) -> Result<()> {
        task.status = TaskStatus::Blocked;
        task.error = Some(reason.clone());
        task.error_type = Some(kind);
        if let Some(step) = step {
            task.current_step = Some(step.to_string());
        }
        *task = self.store.tasks.upsert(task.clone())?;

        if let Some(run) = run {
            self.finish_run(run, RunStatus::Blocked, &reason)?;
        }

        self.store.events.append(
            "tasks",
            "task.blocked",
            &task.id,
            json!({"error": reason, "error_type": kind.to_string()}),
        )?;
        Ok(())
    }

    fn finish_run(&self, run: &mut RunRecord, status: RunStatus, summary: &str) -> Result<()> {
        run.status = status;
        run.finished_at = Some(now());
        run.summary = Some(summary.to_string());
        self.store.runs.upsert(run.clone())?;
        Ok(())
    }

    fn record_step(
        &self,
        run: &mut RunRecord,
        step: &str,
        status: &str,
        summary: Option<String>,
        issues: Option<Vec<foreman_store::models::HumanBlockingIssue>>,
    ) -> Result<()> {
        run.steps.push(StepLogEntry {
            step: step.to_string(),
            status: status.to_string(),
            ts: now(),
            summary,
            open_counts: None,
            commit: None,
            human_blocking_issues: issues,
        });
        self.store.runs.upsert(run.clone())?;
        self.store.events.append(
            "tasks",
            "task.step",
            &run.task_id,
            json!({"step": step, "status": status}),
        )?;
        Ok(())
    }

    fn record_step_result(&self, run: &mut RunRecord, step: &str, result: &StepResult) -> Result<()> {
        let status = match result.status {
            crate::adapter::StepStatus::Ok => "ok",
            crate::adapter::StepStatus::Error => "error",
            crate::adapter::StepStatus::HumanBlocked => "human_blocked",
        };
        let issues = if result.human_blocking_issues.is_empty() {
            None
        } else {
            Some(result.human_blocking_issues.clone())
        };
        self.record_step(run, step, status, result.summary.clone(), issues)
    }

    // -----------------------------------------------------------------
    // Agents & children
    // -----------------------------------------------------------------

    /// Least-recently-used running agent for the task's role, if any.
    fn choose_agent_for_task(&self, task: &mut Task, config: &Config) -> Result<Option<String>> {
        let routing = &config.agent_routing;
        let desired_role = routing
            .task_type_roles
            .get(&task.task_type)
            .cloned()
            .unwrap_or_else(|| routing.default_role.clone());

        let mut running: Vec<_> = self
            .store
            .agents
            .list()?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Running)
            .collect();
        let mut pool: Vec<_> = running
            .iter()
            .filter(|a| a.role == desired_role)
            .cloned()
            .collect();
        if pool.is_empty() {
            pool = std::mem::take(&mut running);
        }
        if pool.is_empty() {
            return Ok(None);
        }
        pool.sort_by_key(|a| a.last_seen_at);
        let chosen = pool.remove(0);

        if let Some(provider) = routing.role_provider_overrides.get(&chosen.role) {
            task.metadata.provider_override = Some(provider.clone());
        }
        Ok(Some(chosen.id))
    }

    /// Create child tasks from a `generate_tasks` payload, wiring
    /// index-based dependencies between them.
    pub fn create_child_tasks(
        &self,
        parent: &mut Task,
        drafts: &[GeneratedTaskDraft],
        apply_deps: bool,
    ) -> Result<Vec<String>> {
        let config = self.store.config.load()?;
        let mut created_ids = Vec::new();

        for draft in drafts {
            let title = if draft.title.is_empty() {
                "Generated task".to_string()
            } else {
                draft.title.clone()
            };
            let task_type = draft
                .task_type
                .clone()
                .unwrap_or_else(|| "feature".to_string());
            let mut child = Task::new(title, task_type.as_str());
            child.description = draft.description.clone();
            child.priority = draft
                .priority
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or(parent.priority);
            child.labels = draft.labels.clone();
            child.parent_id = Some(parent.id.clone());
            child.source = "generated".to_string();
            child.status = TaskStatus::Ready;
            child.approval_mode = config.defaults.approval_mode;
            child.quality_gate = config.defaults.quality_gate;
            child.pipeline_template = self
                .registry
                .resolve_for_task_type(&task_type)
                .step_names();
            let child = self.store.tasks.upsert(child)?;
            self.store.events.append(
                "tasks",
                "task.created",
                &child.id,
                json!({"parent_id": parent.id, "source": "generate_tasks"}),
            )?;
            created_ids.push(child.id);
        }

        if apply_deps {
            for (idx, draft) in drafts.iter().enumerate() {
                if idx >= created_ids.len() {
                    break;
                }
                let child_id = &created_ids[idx];
                for &dep_idx in &draft.depends_on {
                    if dep_idx == idx || dep_idx >= created_ids.len() {
                        continue;
                    }
                    let dep_id = &created_ids[dep_idx];
                    if let (Some(mut child), Some(mut dep)) = (
                        self.store.tasks.get(child_id)?,
                        self.store.tasks.get(dep_id)?,
                    ) {
                        if !child.blocked_by.contains(dep_id) {
                            child.blocked_by.push(dep_id.clone());
                        }
                        if !dep.blocks.contains(child_id) {
                            dep.blocks.push(child_id.clone());
                        }
                        self.store.tasks.upsert(child)?;
                        self.store.tasks.upsert(dep)?;
                    }
                }
            }
        }

        if !created_ids.is_empty() {
            parent.children_ids.extend(created_ids.iter().cloned());
            *parent = self.store.tasks.upsert(parent.clone())?;
        }
        Ok(created_ids)
    }
}

/// Outcome of one in-pipeline step for control flow.
enum StepEnd {
    Continue,
    Blocked,
    Requeued,
}

fn base_namespace(task: &Task) -> Namespace {
    let mut ns = Namespace::new();
    ns.insert("task_type".to_string(), CondValue::from(task.task_type.as_str()));
    ns.insert("task_id".to_string(), CondValue::from(task.id.as_str()));
    ns.insert("task_title".to_string(), CondValue::from(task.title.as_str()));
    ns
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<CondValue> {
    match value {
        serde_yaml::Value::String(s) => Some(CondValue::from(s.as_str())),
        serde_yaml::Value::Number(n) => n.as_f64().map(CondValue::from),
        serde_yaml::Value::Bool(b) => Some(CondValue::from(*b)),
        _ => None,
    }
}

/// Flatten scalar artifacts from a step's structured output into the
/// condition namespace for downstream steps.
fn merge_artifacts(ns: &mut Namespace, result: &StepResult) {
    let Some(text) = result.response_text.as_deref() else {
        return;
    };
    let Some(parsed) = crate::adapter::extract_json(text) else {
        return;
    };
    let Some(map) = parsed.as_object() else { return };
    for (key, value) in map {
        let cond = match value {
            serde_json::Value::String(s) => Some(CondValue::from(s.as_str())),
            serde_json::Value::Number(n) => n.as_f64().map(CondValue::from),
            serde_json::Value::Bool(b) => Some(CondValue::from(*b)),
            _ => None,
        };
        if let Some(cond) = cond {
            ns.insert(key.clone(), cond);
        }
    }
}

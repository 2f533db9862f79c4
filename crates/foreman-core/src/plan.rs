//! Plan revision lineage and refine jobs.
//!
//! Plans are immutable revisions forming a DAG through parent pointers; at
//! most one revision per task is committed. Refinement runs as an async
//! worker job (one active job per task) that produces a child revision
//! from (base revision, feedback).

use anyhow::{bail, Context, Result};
use serde_json::json;

use foreman_store::models::{
    now, PlanRefineJob, PlanRevision, PlanSource, RefineJobStatus, RefinePriority, Task,
};
use foreman_store::StateStore;

use crate::adapter::WorkerAdapter;

/// Where the plan text for task generation comes from.
#[derive(Debug, Clone)]
pub enum PlanTextSource {
    Committed,
    Revision(String),
    Override(String),
    Latest,
}

/// Snapshot of a task's plan state for the CLI and UI edge.
#[derive(Debug, Clone)]
pub struct PlanDocument {
    pub task_id: String,
    pub latest_revision_id: Option<String>,
    pub committed_revision_id: Option<String>,
    pub revisions: Vec<PlanRevision>,
    pub active_refine_job: Option<PlanRefineJob>,
}

/// Plan lineage operations over the state store.
pub struct PlanService {
    store: StateStore,
}

impl PlanService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn require_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .tasks
            .get(task_id)?
            .with_context(|| format!("task not found: {task_id}"))
    }

    fn active_refine_job(&self, task_id: &str) -> Result<Option<PlanRefineJob>> {
        Ok(self
            .store
            .plan_refine_jobs
            .for_task(task_id)?
            .into_iter()
            .find(|job| job.status.is_active()))
    }

    /// The plan document: lineage plus the active refine job, if any.
    pub fn get_plan_document(&self, task_id: &str) -> Result<PlanDocument> {
        let task = self.require_task(task_id)?;
        let revisions = self.store.plan_revisions.for_task(task_id)?;
        let latest_revision_id = revisions.last().map(|r| r.id.clone());
        let committed_revision_id = task
            .metadata
            .committed_plan_revision_id
            .clone()
            .filter(|id| revisions.iter().any(|r| &r.id == id));
        Ok(PlanDocument {
            task_id: task_id.to_string(),
            latest_revision_id,
            committed_revision_id,
            revisions,
            active_refine_job: self.active_refine_job(task_id)?,
        })
    }

    /// Append a new immutable revision. The parent defaults to the
    /// task's latest revision.
    #[allow(clippy::too_many_arguments)]
    pub fn create_revision(
        &self,
        task_id: &str,
        content: &str,
        source: PlanSource,
        parent_revision_id: Option<String>,
        step: Option<String>,
        feedback_note: Option<String>,
        provider: Option<String>,
        model: Option<String>,
    ) -> Result<PlanRevision> {
        let mut task = self.require_task(task_id)?;
        let body = content.trim();
        if body.is_empty() {
            bail!("plan revision content cannot be empty");
        }

        let revisions = self.store.plan_revisions.for_task(task_id)?;
        let parent = match parent_revision_id {
            Some(parent_id) => {
                let parent = self.store.plan_revisions.get(&parent_id)?;
                match parent {
                    Some(p) if p.task_id == task_id => Some(p.id),
                    _ => bail!("parent_revision_id does not belong to task"),
                }
            }
            None => revisions.last().map(|r| r.id.clone()),
        };

        let mut revision = PlanRevision::new(task_id, body, source);
        revision.parent_revision_id = parent;
        revision.step = step;
        revision.feedback_note = feedback_note;
        revision.provider = provider;
        revision.model = model;
        self.store.plan_revisions.upsert(revision.clone())?;

        task.metadata.latest_plan_revision_id = Some(revision.id.clone());
        self.store.tasks.upsert(task)?;

        self.store.events.append(
            "tasks",
            "plan.revision.created",
            task_id,
            json!({"revision_id": revision.id, "source": source_tag(source)}),
        )?;
        Ok(revision)
    }

    /// Mark one revision committed; every sibling reverts to draft.
    pub fn commit_revision(&self, task_id: &str, revision_id: &str) -> Result<()> {
        let mut task = self.require_task(task_id)?;
        let target = self.store.plan_revisions.get(revision_id)?;
        match target {
            Some(revision) if revision.task_id == task_id => {}
            _ => bail!("revision not found for task"),
        }
        if !self.store.plan_revisions.commit_exclusive(task_id, revision_id)? {
            bail!("revision not found for task");
        }
        task.metadata.latest_plan_revision_id = Some(revision_id.to_string());
        task.metadata.committed_plan_revision_id = Some(revision_id.to_string());
        self.store.tasks.upsert(task)?;
        self.store.events.append(
            "tasks",
            "plan.revision.committed",
            task_id,
            json!({"revision_id": revision_id}),
        )?;
        Ok(())
    }

    /// Queue a refine job. At most one queued-or-running job per task.
    pub fn queue_refine_job(
        &self,
        task_id: &str,
        feedback: &str,
        instructions: Option<String>,
        base_revision_id: Option<String>,
        priority: RefinePriority,
    ) -> Result<PlanRefineJob> {
        self.require_task(task_id)?;
        let feedback = feedback.trim();
        if feedback.is_empty() {
            bail!("feedback is required");
        }
        let revisions = self.store.plan_revisions.for_task(task_id)?;
        let base = match base_revision_id {
            Some(base_id) => {
                let base = self.store.plan_revisions.get(&base_id)?;
                match base {
                    Some(revision) if revision.task_id == task_id => revision,
                    _ => bail!("base_revision_id not found for task"),
                }
            }
            None => match revisions.last() {
                Some(latest) => latest.clone(),
                None => bail!("no plan revision exists for this task"),
            },
        };

        let mut job = PlanRefineJob::new(task_id, base.id.clone(), feedback);
        job.instructions = instructions;
        job.priority = priority;

        let Some(job) = self.store.plan_refine_jobs.enqueue_exclusive(job)? else {
            bail!("a plan refine job is already active for this task");
        };
        self.store.events.append(
            "tasks",
            "plan.refine.queued",
            task_id,
            json!({"job_id": job.id, "base_revision_id": job.base_revision_id}),
        )?;
        Ok(job)
    }

    /// Execute one refine job end to end. The refine scratch metadata on
    /// the task is cleaned up on every exit path.
    pub async fn process_refine_job(
        &self,
        adapter: &dyn WorkerAdapter,
        job_id: &str,
    ) -> Result<PlanRefineJob> {
        let Some(mut job) = self.store.plan_refine_jobs.get(job_id)? else {
            bail!("plan refine job not found: {job_id}");
        };
        if !job.status.is_active() {
            return Ok(job);
        }
        job.status = RefineJobStatus::Running;
        job.started_at = Some(now());
        self.store.plan_refine_jobs.upsert(job.clone())?;
        self.store.events.append(
            "tasks",
            "plan.refine.started",
            &job.task_id,
            json!({"job_id": job.id}),
        )?;

        let fail = |mut job: PlanRefineJob, error: String| -> Result<PlanRefineJob> {
            job.status = RefineJobStatus::Failed;
            job.finished_at = Some(now());
            job.error = Some(error.clone());
            self.store.plan_refine_jobs.upsert(job.clone())?;
            self.store.events.append(
                "tasks",
                "plan.refine.failed",
                &job.task_id,
                json!({"job_id": job.id, "error": error}),
            )?;
            Ok(job)
        };

        let Some(base) = self.store.plan_revisions.get(&job.base_revision_id)? else {
            return fail(job, "task or base revision not found".to_string());
        };
        let Some(mut task) = self.store.tasks.get(&job.task_id)? else {
            return fail(job, "task not found".to_string());
        };
        if base.task_id != job.task_id {
            return fail(job, "task or base revision not found".to_string());
        }

        // Stash refine inputs where the prompt builder reads them.
        task.metadata.plan_refine_base = Some(base.content.clone());
        task.metadata.plan_refine_feedback = Some(job.feedback.clone());
        task.metadata.plan_refine_instructions = job.instructions.clone();
        let task = self.store.tasks.upsert(task)?;

        let result = adapter.run_step(&task, "plan_refine", 1).await;

        // Cleanup before anything else, on every path.
        if let Some(mut cleanup) = self.store.tasks.get(&job.task_id)? {
            cleanup.metadata.plan_refine_base = None;
            cleanup.metadata.plan_refine_feedback = None;
            cleanup.metadata.plan_refine_instructions = None;
            self.store.tasks.upsert(cleanup)?;
        }

        if !result.is_ok() {
            let error = result
                .summary
                .unwrap_or_else(|| "plan_refine failed".to_string());
            return fail(job, error);
        }
        let revised = result.summary.unwrap_or_default();
        let revised = revised.trim();
        if revised.is_empty() {
            return fail(job, "worker returned empty refined plan".to_string());
        }

        let (provider, model) = self.worker_lineage("plan_refine");
        let revision = self.create_revision(
            &job.task_id,
            revised,
            PlanSource::WorkerRefine,
            Some(base.id.clone()),
            Some("plan_refine".to_string()),
            Some(job.feedback.clone()),
            provider,
            model,
        )?;

        job.status = RefineJobStatus::Completed;
        job.finished_at = Some(now());
        job.result_revision_id = Some(revision.id.clone());
        job.error = None;
        self.store.plan_refine_jobs.upsert(job.clone())?;
        self.store.events.append(
            "tasks",
            "plan.refine.completed",
            &job.task_id,
            json!({"job_id": job.id, "result_revision_id": revision.id}),
        )?;
        Ok(job)
    }

    /// Resolve the plan text used for task generation.
    pub fn resolve_plan_text(
        &self,
        task_id: &str,
        source: PlanTextSource,
    ) -> Result<(String, Option<String>)> {
        let task = self.require_task(task_id)?;
        let revisions = self.store.plan_revisions.for_task(task_id)?;

        match source {
            PlanTextSource::Override(text) => {
                let body = text.trim().to_string();
                if body.is_empty() {
                    bail!("plan override text is empty");
                }
                Ok((body, None))
            }
            PlanTextSource::Revision(revision_id) => {
                let revision = self.store.plan_revisions.get(&revision_id)?;
                match revision {
                    Some(r) if r.task_id == task_id => Ok((r.content.clone(), Some(r.id))),
                    _ => bail!("revision not found for task"),
                }
            }
            PlanTextSource::Committed => {
                let committed_id = task
                    .metadata
                    .committed_plan_revision_id
                    .clone()
                    .context("no committed plan revision exists for this task")?;
                let revision = self.store.plan_revisions.get(&committed_id)?;
                match revision {
                    Some(r) if r.task_id == task_id => Ok((r.content.clone(), Some(r.id))),
                    _ => bail!("committed plan revision no longer exists"),
                }
            }
            PlanTextSource::Latest => {
                let latest = revisions
                    .last()
                    .context("no plan revision exists for this task")?;
                Ok((latest.content.clone(), Some(latest.id.clone())))
            }
        }
    }

    /// Provider/model lineage recorded on worker-produced revisions.
    pub fn worker_lineage(&self, step: &str) -> (Option<String>, Option<String>) {
        match self.store.config.load() {
            Ok(config) => match config.workers.resolve_for_step(step) {
                Some(spec) => (Some(spec.name), spec.model),
                None => (None, None),
            },
            Err(_) => (None, None),
        }
    }
}

fn source_tag(source: PlanSource) -> &'static str {
    match source {
        PlanSource::WorkerPlan => "worker_plan",
        PlanSource::WorkerRefine => "worker_refine",
        PlanSource::HumanEdit => "human_edit",
        PlanSource::Import => "import",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StepResult;
    use async_trait::async_trait;
    use foreman_store::models::PlanRevisionStatus;
    use foreman_test_utils::create_temp_store;

    struct RefineStub {
        response: Option<String>,
    }

    #[async_trait]
    impl WorkerAdapter for RefineStub {
        async fn run_step(&self, task: &Task, step: &str, _attempt: u32) -> StepResult {
            assert_eq!(step, "plan_refine");
            // Refine inputs must be staged on the task.
            assert!(task.metadata.plan_refine_base.is_some());
            assert!(task.metadata.plan_refine_feedback.is_some());
            match &self.response {
                Some(text) => StepResult {
                    summary: Some(text.clone()),
                    ..StepResult::ok()
                },
                None => StepResult::error("refine blew up", None),
            }
        }
    }

    fn seeded(store: &StateStore) -> (Task, PlanService) {
        let mut task = Task::new("Plan me", "feature");
        task.id = "task-plan".to_string();
        store.tasks.upsert(task.clone()).unwrap();
        (task, PlanService::new(store.clone()))
    }

    #[test]
    fn revisions_build_a_lineage() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);

        let first = service
            .create_revision(&task.id, "v1", PlanSource::WorkerPlan, None, Some("plan".into()), None, None, None)
            .unwrap();
        let second = service
            .create_revision(&task.id, "v2", PlanSource::HumanEdit, None, None, None, None, None)
            .unwrap();

        assert!(first.parent_revision_id.is_none());
        assert_eq!(second.parent_revision_id.as_deref(), Some(first.id.as_str()));

        let doc = service.get_plan_document(&task.id).unwrap();
        assert_eq!(doc.revisions.len(), 2);
        assert_eq!(doc.latest_revision_id.as_deref(), Some(second.id.as_str()));
        assert!(doc.committed_revision_id.is_none());
    }

    #[test]
    fn empty_content_rejected() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);
        assert!(service
            .create_revision(&task.id, "   ", PlanSource::HumanEdit, None, None, None, None, None)
            .is_err());
    }

    #[test]
    fn commit_is_exclusive_and_tracked_on_task() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);

        let a = service
            .create_revision(&task.id, "v1", PlanSource::WorkerPlan, None, None, None, None, None)
            .unwrap();
        let b = service
            .create_revision(&task.id, "v2", PlanSource::WorkerRefine, None, None, None, None, None)
            .unwrap();

        service.commit_revision(&task.id, &a.id).unwrap();
        service.commit_revision(&task.id, &b.id).unwrap();

        let doc = service.get_plan_document(&task.id).unwrap();
        assert_eq!(doc.committed_revision_id.as_deref(), Some(b.id.as_str()));
        let committed: Vec<_> = doc
            .revisions
            .iter()
            .filter(|r| r.status == PlanRevisionStatus::Committed)
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].id, b.id);
    }

    #[tokio::test]
    async fn refine_job_produces_child_revision() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);

        let base = service
            .create_revision(&task.id, "base plan", PlanSource::WorkerPlan, None, None, None, None, None)
            .unwrap();
        let job = service
            .queue_refine_job(&task.id, "tighten step 2", None, None, RefinePriority::Normal)
            .unwrap();

        let stub = RefineStub {
            response: Some("refined plan".to_string()),
        };
        let done = service.process_refine_job(&stub, &job.id).await.unwrap();
        assert_eq!(done.status, RefineJobStatus::Completed);

        let result_id = done.result_revision_id.expect("result revision");
        let revision = store.plan_revisions.get(&result_id).unwrap().unwrap();
        assert_eq!(revision.content, "refined plan");
        assert_eq!(revision.parent_revision_id.as_deref(), Some(base.id.as_str()));
        assert_eq!(revision.source, PlanSource::WorkerRefine);
        assert_eq!(revision.feedback_note.as_deref(), Some("tighten step 2"));

        // Scratch metadata cleaned up.
        let task = store.tasks.get(&task.id).unwrap().unwrap();
        assert!(task.metadata.plan_refine_base.is_none());
        assert!(task.metadata.plan_refine_feedback.is_none());
    }

    #[tokio::test]
    async fn failed_refine_marks_job_and_cleans_up() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);

        service
            .create_revision(&task.id, "base", PlanSource::WorkerPlan, None, None, None, None, None)
            .unwrap();
        let job = service
            .queue_refine_job(&task.id, "feedback", None, None, RefinePriority::Normal)
            .unwrap();

        let stub = RefineStub { response: None };
        let done = service.process_refine_job(&stub, &job.id).await.unwrap();
        assert_eq!(done.status, RefineJobStatus::Failed);
        assert!(done.error.is_some());

        let task = store.tasks.get(&task.id).unwrap().unwrap();
        assert!(task.metadata.plan_refine_base.is_none());
    }

    #[test]
    fn second_active_refine_job_rejected() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);
        service
            .create_revision(&task.id, "base", PlanSource::WorkerPlan, None, None, None, None, None)
            .unwrap();

        service
            .queue_refine_job(&task.id, "first", None, None, RefinePriority::Normal)
            .unwrap();
        assert!(service
            .queue_refine_job(&task.id, "second", None, None, RefinePriority::High)
            .is_err());
    }

    #[test]
    fn refine_requires_existing_revision() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);
        assert!(service
            .queue_refine_job(&task.id, "feedback", None, None, RefinePriority::Normal)
            .is_err());
    }

    #[test]
    fn plan_text_resolution_sources() {
        let (_dir, store) = create_temp_store();
        let (task, service) = seeded(&store);

        let a = service
            .create_revision(&task.id, "alpha", PlanSource::WorkerPlan, None, None, None, None, None)
            .unwrap();
        let b = service
            .create_revision(&task.id, "beta", PlanSource::HumanEdit, None, None, None, None, None)
            .unwrap();
        service.commit_revision(&task.id, &a.id).unwrap();

        let (text, id) = service
            .resolve_plan_text(&task.id, PlanTextSource::Latest)
            .unwrap();
        assert_eq!(text, "beta");
        assert_eq!(id.as_deref(), Some(b.id.as_str()));

        let (text, id) = service
            .resolve_plan_text(&task.id, PlanTextSource::Committed)
            .unwrap();
        assert_eq!(text, "alpha");
        assert_eq!(id.as_deref(), Some(a.id.as_str()));

        let (text, id) = service
            .resolve_plan_text(&task.id, PlanTextSource::Override("custom".into()))
            .unwrap();
        assert_eq!(text, "custom");
        assert!(id.is_none());

        assert!(service
            .resolve_plan_text(&task.id, PlanTextSource::Revision("pr-missing".into()))
            .is_err());
    }
}

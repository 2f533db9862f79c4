//! File-backed repositories.
//!
//! Each collection persists to one YAML document of the form
//! `{schema_version: 3, <key>: [...]}`. Writes are atomic (tmp + fsync +
//! rename) and unknown top-level keys are preserved across writes so newer
//! tooling can annotate the files without being clobbered.
//!
//! Concurrency discipline: a per-repository in-process mutex plus the
//! advisory file lock from [`crate::lock`], both held for the full span of
//! every read-modify-write (this is what makes `claim_next_runnable`
//! atomic across threads and processes).

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::lock::FileLock;
use crate::models::{
    now, AgentRecord, PlanRefineJob, PlanRevision, QuickActionRun, ReviewCycle, RunRecord, Task,
    TaskStatus,
};

/// Schema version written into every collection document.
pub const SCHEMA_VERSION: u64 = 3;

/// Errors from the file repository layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file is not valid YAML: {path}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("state file has schema_version {found}, expected {expected}: {path}")]
    SchemaMismatch {
        path: PathBuf,
        found: u64,
        expected: u64,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn yaml_err(path: &Path, source: serde_yaml::Error) -> StoreError {
    StoreError::Yaml {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Generic YAML collection
// ---------------------------------------------------------------------------

/// One `{schema_version, <key>: [...]}` document on disk.
#[derive(Debug)]
pub struct YamlCollection<T> {
    path: PathBuf,
    lock: FileLock,
    mutex: Mutex<()>,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> YamlCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>, key: &'static str) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock: FileLock::new(lock_path),
            mutex: Mutex::new(()),
            key,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full document, returning an empty mapping when absent.
    fn read_document(&self) -> StoreResult<serde_yaml::Mapping> {
        if !self.path.exists() {
            return Ok(serde_yaml::Mapping::new());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        if text.trim().is_empty() {
            return Ok(serde_yaml::Mapping::new());
        }
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| yaml_err(&self.path, e))?;
        let map = match value {
            serde_yaml::Value::Mapping(map) => map,
            _ => return Ok(serde_yaml::Mapping::new()),
        };
        // Mixed-version files are refused outright; bootstrap archives and
        // recreates the state root before any repository touches it.
        if let Some(found) = map
            .get(serde_yaml::Value::from("schema_version"))
            .and_then(serde_yaml::Value::as_u64)
        {
            if found != SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    path: self.path.clone(),
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
        }
        Ok(map)
    }

    fn items_from_document(&self, doc: &serde_yaml::Mapping) -> StoreResult<Vec<T>> {
        let Some(raw) = doc.get(serde_yaml::Value::from(self.key)) else {
            return Ok(Vec::new());
        };
        let serde_yaml::Value::Sequence(seq) = raw else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(seq.len());
        for item in seq {
            let parsed: T =
                serde_yaml::from_value(item.clone()).map_err(|e| yaml_err(&self.path, e))?;
            out.push(parsed);
        }
        Ok(out)
    }

    /// Atomic write: serialize into the existing document (preserving
    /// unknown top-level keys), write to `<path>.tmp`, fsync, rename.
    fn write_items(&self, doc: &mut serde_yaml::Mapping, items: &[T]) -> StoreResult<()> {
        let seq: Vec<serde_yaml::Value> = items
            .iter()
            .map(|item| serde_yaml::to_value(item).map_err(|e| yaml_err(&self.path, e)))
            .collect::<StoreResult<_>>()?;
        doc.insert(
            serde_yaml::Value::from("schema_version"),
            serde_yaml::Value::from(SCHEMA_VERSION),
        );
        doc.insert(
            serde_yaml::Value::from(self.key),
            serde_yaml::Value::Sequence(seq),
        );

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(&self.path, e))?;
        }
        let tmp_path = self.path.with_extension("yaml.tmp");
        let text =
            serde_yaml::to_string(&serde_yaml::Value::Mapping(std::mem::take(doc)))
                .map_err(|e| yaml_err(&self.path, e))?;
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
            file.write_all(text.as_bytes())
                .map_err(|e| io_err(&tmp_path, e))?;
            file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    /// Snapshot of the collection. Readers without a concurrent writer do
    /// not need the file lock; the in-process mutex still orders them
    /// against local writers.
    pub fn read(&self) -> StoreResult<Vec<T>> {
        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let doc = self.read_document()?;
        self.items_from_document(&doc)
    }

    /// Full read-modify-write under both locks. The closure's return value
    /// is passed through; the (possibly) mutated items are always written
    /// back.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> StoreResult<R> {
        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _file_guard = self
            .lock
            .acquire()
            .map_err(|e| io_err(self.lock.path(), e))?;
        let mut doc = self.read_document()?;
        let mut items = self.items_from_document(&doc)?;
        let out = f(&mut items);
        self.write_items(&mut doc, &items)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Repository for [`Task`] records.
#[derive(Debug)]
pub struct TaskRepository {
    inner: YamlCollection<Task>,
}

impl TaskRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "tasks"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<Task>> {
        self.inner.read()
    }

    pub fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.list()?.into_iter().find(|t| t.id == task_id))
    }

    /// Insert-or-replace by id, refreshing `updated_at`.
    pub fn upsert(&self, mut task: Task) -> StoreResult<Task> {
        task.updated_at = now();
        let stored = task.clone();
        self.inner.update(move |tasks| {
            if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
                *existing = task;
            } else {
                tasks.push(task);
            }
        })?;
        Ok(stored)
    }

    pub fn delete(&self, task_id: &str) -> StoreResult<bool> {
        self.inner.update(|tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != task_id);
            tasks.len() != before
        })
    }

    /// Atomically claim the next runnable task.
    ///
    /// Runnable: status `ready`, no pending gate, every blocker terminal.
    /// Ordering: priority rank, then `retry_count`, then `created_at`.
    /// The selected task is flipped to `in_progress` inside the same locked
    /// section, so no two claimants can take the same task.
    pub fn claim_next_runnable(&self, max_in_progress: usize) -> StoreResult<Option<Task>> {
        self.inner.update(|tasks| {
            let in_progress = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .count();
            if in_progress >= max_in_progress {
                return None;
            }

            let statuses: std::collections::HashMap<String, TaskStatus> =
                tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

            let is_runnable = |task: &Task| -> bool {
                if task.status != TaskStatus::Ready || task.pending_gate.is_some() {
                    return false;
                }
                task.blocked_by.iter().all(|dep_id| {
                    statuses
                        .get(dep_id)
                        .map(|s| s.is_terminal())
                        .unwrap_or(false)
                })
            };

            let selected_id = tasks
                .iter()
                .filter(|t| is_runnable(t))
                .min_by_key(|t| (t.priority.rank(), t.retry_count, t.created_at))
                .map(|t| t.id.clone())?;

            let task = tasks.iter_mut().find(|t| t.id == selected_id)?;
            task.status = TaskStatus::InProgress;
            task.updated_at = now();
            Some(task.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RunRepository {
    inner: YamlCollection<RunRecord>,
}

impl RunRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "runs"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<RunRecord>> {
        self.inner.read()
    }

    pub fn get(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        Ok(self.list()?.into_iter().find(|r| r.id == run_id))
    }

    pub fn for_task(&self, task_id: &str) -> StoreResult<Vec<RunRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect())
    }

    pub fn upsert(&self, run: RunRecord) -> StoreResult<RunRecord> {
        let stored = run.clone();
        self.inner.update(move |runs| {
            if let Some(existing) = runs.iter_mut().find(|r| r.id == run.id) {
                *existing = run;
            } else {
                runs.push(run);
            }
        })?;
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Review cycles
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ReviewRepository {
    inner: YamlCollection<ReviewCycle>,
}

impl ReviewRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "review_cycles"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<ReviewCycle>> {
        self.inner.read()
    }

    pub fn for_task(&self, task_id: &str) -> StoreResult<Vec<ReviewCycle>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.task_id == task_id)
            .collect())
    }

    pub fn append(&self, cycle: ReviewCycle) -> StoreResult<ReviewCycle> {
        let stored = cycle.clone();
        self.inner.update(move |cycles| cycles.push(cycle))?;
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AgentRepository {
    inner: YamlCollection<AgentRecord>,
}

impl AgentRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "agents"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<AgentRecord>> {
        self.inner.read()
    }

    pub fn get(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>> {
        Ok(self.list()?.into_iter().find(|a| a.id == agent_id))
    }

    pub fn upsert(&self, agent: AgentRecord) -> StoreResult<AgentRecord> {
        let stored = agent.clone();
        self.inner.update(move |agents| {
            if let Some(existing) = agents.iter_mut().find(|a| a.id == agent.id) {
                *existing = agent;
            } else {
                agents.push(agent);
            }
        })?;
        Ok(stored)
    }

    pub fn delete(&self, agent_id: &str) -> StoreResult<bool> {
        self.inner.update(|agents| {
            let before = agents.len();
            agents.retain(|a| a.id != agent_id);
            agents.len() != before
        })
    }
}

// ---------------------------------------------------------------------------
// Quick actions
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct QuickActionRepository {
    inner: YamlCollection<QuickActionRun>,
}

impl QuickActionRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "quick_actions"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<QuickActionRun>> {
        self.inner.read()
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<QuickActionRun>> {
        Ok(self.list()?.into_iter().find(|q| q.id == id))
    }

    pub fn upsert(&self, mut action: QuickActionRun) -> StoreResult<QuickActionRun> {
        let id = action.id.clone();
        let result = self.inner.update(move |runs| {
            if let Some(existing) = runs.iter_mut().find(|q| q.id == id) {
                // Preserve promotion linkage across async status updates.
                if existing.promoted_task_id.is_some() && action.promoted_task_id.is_none() {
                    action.promoted_task_id = existing.promoted_task_id.clone();
                }
                *existing = action.clone();
            } else {
                runs.push(action.clone());
            }
            action
        })?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Plan revisions
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlanRevisionRepository {
    inner: YamlCollection<PlanRevision>,
}

impl PlanRevisionRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "plan_revisions"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<PlanRevision>> {
        self.inner.read()
    }

    pub fn get(&self, revision_id: &str) -> StoreResult<Option<PlanRevision>> {
        Ok(self.list()?.into_iter().find(|r| r.id == revision_id))
    }

    /// Revisions for one task, oldest first.
    pub fn for_task(&self, task_id: &str) -> StoreResult<Vec<PlanRevision>> {
        let mut revisions: Vec<PlanRevision> = self
            .list()?
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect();
        revisions.sort_by_key(|r| r.created_at);
        Ok(revisions)
    }

    pub fn upsert(&self, revision: PlanRevision) -> StoreResult<PlanRevision> {
        let stored = revision.clone();
        self.inner.update(move |revisions| {
            if let Some(existing) = revisions.iter_mut().find(|r| r.id == revision.id) {
                *existing = revision;
            } else {
                revisions.push(revision);
            }
        })?;
        Ok(stored)
    }

    /// Mark one revision committed and demote every sibling to draft, in a
    /// single locked write.
    pub fn commit_exclusive(&self, task_id: &str, revision_id: &str) -> StoreResult<bool> {
        use crate::models::PlanRevisionStatus;
        self.inner.update(|revisions| {
            let mut found = false;
            for revision in revisions.iter_mut().filter(|r| r.task_id == task_id) {
                if revision.id == revision_id {
                    revision.status = PlanRevisionStatus::Committed;
                    found = true;
                } else {
                    revision.status = PlanRevisionStatus::Draft;
                }
            }
            found
        })
    }
}

// ---------------------------------------------------------------------------
// Plan refine jobs
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlanRefineJobRepository {
    inner: YamlCollection<PlanRefineJob>,
}

impl PlanRefineJobRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: YamlCollection::new(path, "plan_refine_jobs"),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<PlanRefineJob>> {
        self.inner.read()
    }

    pub fn get(&self, job_id: &str) -> StoreResult<Option<PlanRefineJob>> {
        Ok(self.list()?.into_iter().find(|j| j.id == job_id))
    }

    pub fn for_task(&self, task_id: &str) -> StoreResult<Vec<PlanRefineJob>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|j| j.task_id == task_id)
            .collect())
    }

    pub fn upsert(&self, job: PlanRefineJob) -> StoreResult<PlanRefineJob> {
        let stored = job.clone();
        self.inner.update(move |jobs| {
            if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
                *existing = job;
            } else {
                jobs.push(job);
            }
        })?;
        Ok(stored)
    }

    /// Enqueue a job unless the task already has a queued or running one.
    /// The uniqueness check and the insert happen under the same lock.
    pub fn enqueue_exclusive(&self, job: PlanRefineJob) -> StoreResult<Option<PlanRefineJob>> {
        self.inner.update(move |jobs| {
            let active = jobs
                .iter()
                .any(|j| j.task_id == job.task_id && j.status.is_active());
            if active {
                return None;
            }
            jobs.push(job.clone());
            Some(job)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use chrono::Duration;
    use tempfile::TempDir;

    fn repo(dir: &TempDir) -> TaskRepository {
        TaskRepository::new(dir.path().join("tasks.yaml"))
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let task = Task::new("one", "feature");
        let id = task.id.clone();
        tasks.upsert(task).unwrap();

        let loaded = tasks.get(&id).unwrap().expect("task should exist");
        assert_eq!(loaded.title, "one");
        // Upsert(load(T)) == load(T)
        tasks.upsert(loaded.clone()).unwrap();
        let again = tasks.get(&id).unwrap().unwrap();
        assert_eq!(again.title, loaded.title);
        assert_eq!(again.status, loaded.status);
        assert_eq!(again.priority, loaded.priority);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let mut task = Task::new("before", "feature");
        let id = task.id.clone();
        tasks.upsert(task.clone()).unwrap();
        task.title = "after".into();
        tasks.upsert(task).unwrap();

        let all = tasks.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "after");
        assert_eq!(all[0].id, id);
    }

    #[test]
    fn delete_removes_and_reports() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);
        let task = Task::new("t", "chore");
        let id = task.id.clone();
        tasks.upsert(task).unwrap();

        assert!(tasks.delete(&id).unwrap());
        assert!(!tasks.delete(&id).unwrap());
        assert!(tasks.get(&id).unwrap().is_none());
    }

    #[test]
    fn unknown_top_level_keys_survive_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(
            &path,
            "schema_version: 3\nannotations:\n  owner: alice\ntasks: []\n",
        )
        .unwrap();

        let tasks = TaskRepository::new(&path);
        tasks.upsert(Task::new("keeps extras", "feature")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(
            doc.get("annotations").and_then(|a| a.get("owner")),
            Some(&serde_yaml::Value::from("alice"))
        );
    }

    #[test]
    fn claim_orders_by_priority_retry_created() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let mut low = Task::new("low", "feature");
        low.status = TaskStatus::Ready;
        low.priority = Priority::P3;

        let mut urgent = Task::new("urgent", "feature");
        urgent.status = TaskStatus::Ready;
        urgent.priority = Priority::P0;
        urgent.created_at = low.created_at + Duration::seconds(10);

        let mut retried = Task::new("retried", "feature");
        retried.status = TaskStatus::Ready;
        retried.priority = Priority::P0;
        retried.retry_count = 2;

        tasks.upsert(low.clone()).unwrap();
        tasks.upsert(urgent.clone()).unwrap();
        tasks.upsert(retried).unwrap();

        let claimed = tasks.claim_next_runnable(4).unwrap().expect("claimable");
        assert_eq!(claimed.title, "urgent");
        assert_eq!(claimed.status, TaskStatus::InProgress);
    }

    #[test]
    fn claim_respects_concurrency_cap() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let mut running = Task::new("running", "feature");
        running.status = TaskStatus::InProgress;
        let mut ready = Task::new("ready", "feature");
        ready.status = TaskStatus::Ready;
        tasks.upsert(running).unwrap();
        tasks.upsert(ready).unwrap();

        assert!(tasks.claim_next_runnable(1).unwrap().is_none());
        assert!(tasks.claim_next_runnable(2).unwrap().is_some());
    }

    #[test]
    fn claim_skips_gated_and_blocked_tasks() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let mut blocker = Task::new("dep", "feature");
        blocker.status = TaskStatus::InProgress;
        let blocker_id = blocker.id.clone();

        let mut gated = Task::new("gated", "feature");
        gated.status = TaskStatus::Ready;
        gated.pending_gate = Some("before_commit".into());

        let mut dependent = Task::new("dependent", "feature");
        dependent.status = TaskStatus::Ready;
        dependent.blocked_by = vec![blocker_id.clone()];

        tasks.upsert(blocker.clone()).unwrap();
        tasks.upsert(gated).unwrap();
        tasks.upsert(dependent.clone()).unwrap();

        // Blocker is in_progress, so the cap must leave room for the check.
        assert!(tasks.claim_next_runnable(4).unwrap().is_none());

        blocker.status = TaskStatus::Done;
        tasks.upsert(blocker).unwrap();
        let claimed = tasks.claim_next_runnable(4).unwrap().expect("claimable");
        assert_eq!(claimed.id, dependent.id);
    }

    #[test]
    fn claim_treats_missing_blocker_as_unresolved() {
        let dir = TempDir::new().unwrap();
        let tasks = repo(&dir);

        let mut task = Task::new("orphan dep", "feature");
        task.status = TaskStatus::Ready;
        task.blocked_by = vec!["task-does-not-exist".into()];
        tasks.upsert(task).unwrap();

        assert!(tasks.claim_next_runnable(4).unwrap().is_none());
    }

    #[test]
    fn review_append_and_for_task() {
        use crate::models::{ReviewCycle, ReviewDecision};
        let dir = TempDir::new().unwrap();
        let reviews = ReviewRepository::new(dir.path().join("review_cycles.yaml"));

        let cycle = ReviewCycle {
            id: crate::models::new_id("rc"),
            task_id: "task-1".into(),
            attempt: 1,
            findings: vec![],
            open_counts: Default::default(),
            decision: ReviewDecision::Approved,
            created_at: now(),
        };
        reviews.append(cycle).unwrap();
        assert_eq!(reviews.for_task("task-1").unwrap().len(), 1);
        assert!(reviews.for_task("task-2").unwrap().is_empty());
    }

    #[test]
    fn refine_enqueue_is_exclusive_per_task() {
        let dir = TempDir::new().unwrap();
        let jobs = PlanRefineJobRepository::new(dir.path().join("plan_refine_jobs.yaml"));

        let first = PlanRefineJob::new("task-1", "pr-1", "tighten the plan");
        assert!(jobs.enqueue_exclusive(first).unwrap().is_some());

        let second = PlanRefineJob::new("task-1", "pr-1", "more feedback");
        assert!(jobs.enqueue_exclusive(second).unwrap().is_none());

        let other_task = PlanRefineJob::new("task-2", "pr-9", "unrelated");
        assert!(jobs.enqueue_exclusive(other_task).unwrap().is_some());
    }

    #[test]
    fn plan_revision_commit_is_exclusive() {
        use crate::models::{PlanRevisionStatus, PlanSource};
        let dir = TempDir::new().unwrap();
        let revisions = PlanRevisionRepository::new(dir.path().join("plan_revisions.yaml"));

        let a = PlanRevision::new("task-1", "v1", PlanSource::WorkerPlan);
        let b = PlanRevision::new("task-1", "v2", PlanSource::WorkerRefine);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        revisions.upsert(a).unwrap();
        revisions.upsert(b).unwrap();

        assert!(revisions.commit_exclusive("task-1", &a_id).unwrap());
        assert!(revisions.commit_exclusive("task-1", &b_id).unwrap());

        let all = revisions.for_task("task-1").unwrap();
        let committed: Vec<_> = all
            .iter()
            .filter(|r| r.status == PlanRevisionStatus::Committed)
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].id, b_id);
    }
}

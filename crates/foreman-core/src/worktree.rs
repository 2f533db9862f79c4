//! Git worktree management for per-task isolation.
//!
//! Each active task runs in its own worktree under the state root, checked
//! out on `task-<id>`. Completed work is committed inside the worktree and
//! merged back into a single run branch created lazily on the first task.
//! Git does not tolerate concurrent worktree mutation on one repository,
//! so all mutating operations serialise through an internal mutex; merges
//! additionally hold a dedicated merge mutex so only one merge is in
//! flight across the pool.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;

use foreman_store::models::Task;

/// Errors from git plumbing.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Result of merging a task branch into the run branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Conflict left in place for the resolver; paths are repo-relative.
    Conflict { files: Vec<String> },
}

/// Manages the run branch, per-task worktrees, and merges.
#[derive(Debug)]
pub struct WorktreeManager {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    git_lock: Mutex<()>,
    merge_lock: Mutex<()>,
    run_branch: Mutex<Option<String>>,
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            git_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            run_branch: Mutex::new(None),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Branch name for a task's worktree.
    pub fn task_branch(task_id: &str) -> String {
        format!("task-{task_id}")
    }

    /// Whether the project directory is a git repository.
    pub fn is_git_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&self.project_dir)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn run_git(&self, args: &[&str], cwd: &Path) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    fn run_git_checked(&self, args: &[&str], cwd: &Path) -> Result<String, WorktreeError> {
        let output = self.run_git(args, cwd)?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// The current run branch, if one has been created.
    pub fn run_branch(&self) -> Option<String> {
        self.run_branch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ensure the run branch exists and is checked out in the main
    /// worktree. Created lazily on the first task; `None` outside git.
    pub fn ensure_run_branch(&self) -> Result<Option<String>, WorktreeError> {
        let mut slot = self.run_branch.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(branch) = slot.as_ref() {
            return Ok(Some(branch.clone()));
        }
        if !self.is_git_repo() {
            return Ok(None);
        }
        let branch = format!("foreman-run-{}", chrono::Utc::now().timestamp());
        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.run_git_checked(&["checkout", "-B", &branch], &self.project_dir) {
            Ok(_) => {
                *slot = Some(branch.clone());
                Ok(Some(branch))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to create run branch");
                Err(e)
            }
        }
    }

    /// Create `worktrees/<task_id>` on a fresh `task-<task_id>` branch.
    pub fn create_worktree(&self, task_id: &str) -> Result<PathBuf, WorktreeError> {
        self.ensure_run_branch()?;
        let worktree_dir = self.worktrees_dir.join(task_id);
        let branch = Self::task_branch(task_id);

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.worktrees_dir.exists() {
            std::fs::create_dir_all(&self.worktrees_dir).map_err(|e| WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktrees directory {}",
                    self.worktrees_dir.display()
                ),
                source: e,
            })?;
        }
        let worktree_str = worktree_dir.to_string_lossy().into_owned();
        self.run_git_checked(
            &["worktree", "add", &worktree_str, "-b", &branch],
            &self.project_dir,
        )?;
        Ok(worktree_dir)
    }

    /// Stage everything in the worktree and commit, allowing an empty
    /// commit so the merge step always has a head to merge. Returns the
    /// commit SHA.
    pub fn commit_in_worktree(
        &self,
        task: &Task,
        worktree_dir: &Path,
    ) -> Result<String, WorktreeError> {
        let title: String = task.title.chars().take(60).collect();
        let message = format!("task({}): {}", task.id, title);

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run_git_checked(&["add", "-A"], worktree_dir)?;
        self.run_git_checked(
            &["commit", "--allow-empty", "-m", &message],
            worktree_dir,
        )?;
        let sha = self.run_git_checked(&["rev-parse", "HEAD"], worktree_dir)?;
        Ok(sha.trim().to_string())
    }

    /// Commit directly on the run branch in the project directory, used
    /// when a task ran without worktree isolation.
    pub fn commit_in_project(&self, task: &Task) -> Result<String, WorktreeError> {
        self.ensure_run_branch()?;
        let title: String = task.title.chars().take(60).collect();
        let message = format!("task({}): {}", task.id, title);

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run_git_checked(&["add", "-A"], &self.project_dir)?;
        self.run_git_checked(
            &["commit", "--allow-empty", "-m", &message],
            &self.project_dir,
        )?;
        let sha = self.run_git_checked(&["rev-parse", "HEAD"], &self.project_dir)?;
        Ok(sha.trim().to_string())
    }

    /// Merge a task branch into the run branch.
    ///
    /// Holds the global merge mutex; at most one merge runs across the
    /// pool. On conflict the merge is left in place (not aborted) so the
    /// resolver can see the markers; the caller must either commit a
    /// resolution or call [`Self::abort_merge`].
    pub fn merge_task_branch(&self, task_id: &str) -> Result<MergeOutcome, WorktreeError> {
        let branch = Self::task_branch(task_id);
        let _merge = self.merge_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = self.run_git(&["merge", &branch, "--no-edit"], &self.project_dir)?;
        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let files = self.conflicted_files()?;
        if files.is_empty() {
            // Merge failed for a non-conflict reason.
            return Err(WorktreeError::GitExit {
                command: format!("merge {branch} --no-edit"),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(MergeOutcome::Conflict { files })
    }

    /// Repo-relative paths with unresolved conflicts.
    pub fn conflicted_files(&self) -> Result<Vec<String>, WorktreeError> {
        let stdout = self.run_git_checked(
            &["diff", "--name-only", "--diff-filter=U"],
            &self.project_dir,
        )?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage and commit a resolved merge.
    pub fn commit_merge_resolution(&self) -> Result<(), WorktreeError> {
        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run_git_checked(&["add", "-A"], &self.project_dir)?;
        self.run_git_checked(&["commit", "--no-edit"], &self.project_dir)?;
        Ok(())
    }

    /// Abort an in-progress merge, ignoring failure if none is active.
    pub fn abort_merge(&self) {
        let _ = self.run_git(&["merge", "--abort"], &self.project_dir);
    }

    /// Remove a worktree directory, forcing through dirty state.
    /// Idempotent: a missing or unregistered worktree is cleaned up
    /// best-effort.
    pub fn remove_worktree(&self, worktree_dir: &Path) -> Result<(), WorktreeError> {
        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let worktree_str = worktree_dir.to_string_lossy().into_owned();
        let output = self.run_git(
            &["worktree", "remove", &worktree_str, "--force"],
            &self.project_dir,
        )?;
        if !output.status.success() {
            if worktree_dir.exists() {
                let _ = std::fs::remove_dir_all(worktree_dir);
            }
            let _ = self.run_git(&["worktree", "prune"], &self.project_dir);
        }
        Ok(())
    }

    /// Delete a task branch. Branches survive only when an unresolved
    /// merge conflict must be recoverable by a human.
    pub fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.run_git(&["branch", "-D", branch], &self.project_dir)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") {
                return Err(WorktreeError::GitExit {
                    command: format!("branch -D {branch}"),
                    code: output.status.code().unwrap_or(-1),
                    stderr: stderr.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = self.run_git(
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
            &self.project_dir,
        )?;
        Ok(output.status.success())
    }

    /// Startup sweeper: remove every leftover worktree directory and its
    /// task branch. Failures are logged and skipped so one broken entry
    /// cannot wedge recovery.
    pub fn sweep_orphans(&self) {
        if !self.worktrees_dir.exists() || !self.is_git_repo() {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.worktrees_dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let task_id = entry.file_name().to_string_lossy().into_owned();
            tracing::info!(task_id = %task_id, "removing orphaned worktree");
            if let Err(e) = self.remove_worktree(&path) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to remove orphaned worktree");
            }
            if let Err(e) = self.delete_branch(&Self::task_branch(&task_id)) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to delete orphaned branch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_test_utils::{create_temp_repo, git};
    use tempfile::TempDir;

    fn manager(repo: &Path) -> (TempDir, WorktreeManager) {
        let wt_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(repo, wt_base.path().join("worktrees"));
        (wt_base, mgr)
    }

    fn task(id: &str, title: &str) -> Task {
        let mut task = Task::new(title, "feature");
        task.id = id.to_string();
        task
    }

    #[test]
    fn run_branch_created_lazily_and_cached() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);

        assert!(mgr.run_branch().is_none());
        let branch = mgr.ensure_run_branch().unwrap().expect("run branch");
        assert!(branch.starts_with("foreman-run-"));
        // Second call returns the cached branch.
        assert_eq!(mgr.ensure_run_branch().unwrap().unwrap(), branch);
        assert!(mgr.branch_exists(&branch).unwrap());
    }

    #[test]
    fn non_git_dir_yields_no_run_branch() {
        let plain = TempDir::new().unwrap();
        let (_wt, mgr) = manager(plain.path());
        assert!(!mgr.is_git_repo());
        assert!(mgr.ensure_run_branch().unwrap().is_none());
    }

    #[test]
    fn create_commit_merge_and_cleanup() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);

        let worktree = mgr.create_worktree("t1").unwrap();
        assert!(worktree.exists());
        std::fs::write(worktree.join("feature.txt"), "new feature\n").unwrap();

        let t = task("t1", "Add feature");
        let sha = mgr.commit_in_worktree(&t, &worktree).unwrap();
        assert_eq!(sha.len(), 40);

        mgr.remove_worktree(&worktree).unwrap();
        assert!(!worktree.exists());

        let outcome = mgr.merge_task_branch("t1").unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo.join("feature.txt").exists());

        mgr.delete_branch(&WorktreeManager::task_branch("t1")).unwrap();
        assert!(!mgr.branch_exists("task-t1").unwrap());
    }

    #[test]
    fn empty_commit_allowed() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);

        let worktree = mgr.create_worktree("t2").unwrap();
        let t = task("t2", "No changes");
        // Nothing modified; commit must still succeed.
        let sha = mgr.commit_in_worktree(&t, &worktree).unwrap();
        assert!(!sha.is_empty());
        mgr.remove_worktree(&worktree).unwrap();
    }

    #[test]
    fn conflicting_merges_report_files_and_abort_restores() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);
        std::fs::write(repo.join("shared.txt"), "base\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "add shared"]);

        // Alpha and Beta both edit shared.txt in their worktrees.
        let alpha_wt = mgr.create_worktree("alpha").unwrap();
        let beta_wt = mgr.create_worktree("beta").unwrap();
        std::fs::write(alpha_wt.join("shared.txt"), "alpha version\n").unwrap();
        std::fs::write(beta_wt.join("shared.txt"), "beta version\n").unwrap();
        mgr.commit_in_worktree(&task("alpha", "Alpha"), &alpha_wt).unwrap();
        mgr.commit_in_worktree(&task("beta", "Beta"), &beta_wt).unwrap();
        mgr.remove_worktree(&alpha_wt).unwrap();
        mgr.remove_worktree(&beta_wt).unwrap();

        // Beta merges first, cleanly.
        assert_eq!(mgr.merge_task_branch("beta").unwrap(), MergeOutcome::Merged);

        // Alpha conflicts.
        match mgr.merge_task_branch("alpha").unwrap() {
            MergeOutcome::Conflict { files } => {
                assert_eq!(files, vec!["shared.txt".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Conflict markers are visible in the project dir.
        let content = std::fs::read_to_string(repo.join("shared.txt")).unwrap();
        assert!(content.contains("<<<<<<<"));

        mgr.abort_merge();
        let restored = std::fs::read_to_string(repo.join("shared.txt")).unwrap();
        assert_eq!(restored, "beta version\n");
    }

    #[test]
    fn resolved_conflict_can_be_committed() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);
        std::fs::write(repo.join("shared.txt"), "base\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "add shared"]);

        let a_wt = mgr.create_worktree("a").unwrap();
        let b_wt = mgr.create_worktree("b").unwrap();
        std::fs::write(a_wt.join("shared.txt"), "a\n").unwrap();
        std::fs::write(b_wt.join("shared.txt"), "b\n").unwrap();
        mgr.commit_in_worktree(&task("a", "A"), &a_wt).unwrap();
        mgr.commit_in_worktree(&task("b", "B"), &b_wt).unwrap();
        mgr.remove_worktree(&a_wt).unwrap();
        mgr.remove_worktree(&b_wt).unwrap();

        assert_eq!(mgr.merge_task_branch("a").unwrap(), MergeOutcome::Merged);
        assert!(matches!(
            mgr.merge_task_branch("b").unwrap(),
            MergeOutcome::Conflict { .. }
        ));

        // Hand-resolve, then commit the resolution.
        std::fs::write(repo.join("shared.txt"), "a and b\n").unwrap();
        mgr.commit_merge_resolution().unwrap();
        assert!(mgr.conflicted_files().unwrap().is_empty());
    }

    #[test]
    fn sweep_orphans_removes_worktrees_and_branches() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);

        let w1 = mgr.create_worktree("orphan1").unwrap();
        let w2 = mgr.create_worktree("orphan2").unwrap();
        assert!(w1.exists() && w2.exists());

        mgr.sweep_orphans();

        assert!(!w1.exists());
        assert!(!w2.exists());
        assert!(!mgr.branch_exists("task-orphan1").unwrap());
        assert!(!mgr.branch_exists("task-orphan2").unwrap());
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_wt, mgr) = manager(&repo);
        mgr.delete_branch("task-never-existed").unwrap();
    }
}

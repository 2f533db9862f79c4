//! Error taxonomy helpers.
//!
//! The [`ErrorKind`] tags themselves live in `foreman-store` because they
//! are persisted on tasks and run records; this module adds the operator
//! guidance surfaced by the CLI when a task blocks.

pub use foreman_store::models::ErrorKind;

/// Suggested resolution steps for a blocked task, keyed on `error_type`.
pub fn resolution_steps(kind: ErrorKind) -> &'static [&'static str] {
    match kind {
        ErrorKind::CodexExit => &[
            "Verify the worker CLI is installed, authenticated, and reachable.",
            "Inspect the latest run's stderr.log for the failure output.",
        ],
        ErrorKind::PlanMissing => &[
            "Open the task and regenerate the plan step.",
            "Commit a plan revision before re-running the task.",
        ],
        ErrorKind::HeartbeatTimeout => &[
            "Check worker CLI connectivity and long-running command settings.",
            "Re-run the task after the worker is healthy.",
        ],
        ErrorKind::ShiftTimeout => &[
            "Raise the step timeout or split the task into smaller pieces.",
            "Re-run the task; transient slowness auto-resumes.",
        ],
        ErrorKind::BlockingIssues => &[
            "Read metadata.human_blocking_issues and resolve each item.",
            "Clear the pending gate to return the task to the queue.",
        ],
        ErrorKind::DisallowedFiles => &[
            "Revert or move the out-of-scope changes.",
            "Update the plan to include the needed files before re-running.",
        ],
        ErrorKind::TestTimeout => &[
            "Check for hung test processes or raise the test timeout.",
            "Re-run the verify step once the suite is stable.",
        ],
        ErrorKind::ReviewAttemptsExhausted => &[
            "Open the latest review cycle and address all open findings.",
            "Re-run the task once fixes are in place.",
        ],
        ErrorKind::GitPushFailed => &[
            "Check git remote and authentication, then push the branch manually.",
            "Re-run the task after the remote accepts pushes.",
        ],
        ErrorKind::GitCheckoutFailed => &[
            "Inspect the repository for uncommitted changes or lock files.",
            "Restore a clean checkout, then re-run the task.",
        ],
        ErrorKind::MergeConflict => &[
            "The task branch is preserved; merge it manually.",
            "Delete the branch and clear metadata.merge_conflict when resolved.",
        ],
        ErrorKind::InvalidStep => &[
            "The requested step is not part of this task's pipeline.",
            "Fix the pipeline template or the step override.",
        ],
        ErrorKind::Internal => &[
            "Inspect the coordinator log for the underlying error.",
        ],
    }
}

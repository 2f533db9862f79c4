//! Task execution reducer.
//!
//! `reduce(state, event, caps)` is a pure function over the attempt
//! counters carried in task metadata. It decides, for every step outcome,
//! whether the task advances, is re-queued at the same step, or blocks for
//! a human, and it records the step to replay so a later resume can pick
//! up exactly where execution stopped.

use foreman_store::models::{AttemptCounters, ErrorKind, HumanBlockingIssue};

use crate::hitl::HUMAN_INTERVENTION_GATE;

/// Attempt ceilings before a task is handed to a human.
#[derive(Debug, Clone, Copy)]
pub struct AttemptCaps {
    pub worker: u32,
    pub auto_resume: u32,
    pub plan: u32,
    pub no_progress: u32,
    pub review_fix: u32,
    pub allowlist_expansion: u32,
}

impl Default for AttemptCaps {
    fn default() -> Self {
        Self {
            worker: 5,
            auto_resume: 3,
            plan: 3,
            no_progress: 3,
            review_fix: 3,
            allowlist_expansion: 3,
        }
    }
}

/// Execution-relevant slice of a task's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecState {
    pub counters: AttemptCounters,
    /// The step to replay after a human resume.
    pub blocked_step: Option<String>,
}

/// Outcomes produced by the supervisor, classifier, and review loop.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    WorkerSucceeded {
        step: String,
    },
    WorkerFailed {
        step: String,
        kind: ErrorKind,
        message: String,
    },
    NoIntroducedChanges {
        step: String,
    },
    ProgressHumanBlockers {
        step: String,
        issues: Vec<HumanBlockingIssue>,
    },
    AllowlistViolation {
        step: String,
    },
    ReviewResult {
        approved: bool,
    },
    VerificationResult {
        step: String,
        passed: bool,
    },
}

/// What the orchestrator should do with the task next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Step complete; advance the pipeline.
    Advance,
    /// Re-queue the same step.
    Requeue,
    /// Park the task for a human.
    Block {
        kind: ErrorKind,
        reason: String,
        gate: Option<&'static str>,
    },
}

/// Advance the execution state by one event.
pub fn reduce(state: &ExecState, event: &ExecEvent, caps: &AttemptCaps) -> (ExecState, Disposition) {
    let mut next = state.clone();

    match event {
        ExecEvent::WorkerSucceeded { .. } => {
            next.counters.worker = 0;
            next.counters.auto_resume = 0;
            next.counters.no_progress = 0;
            next.blocked_step = None;
            (next, Disposition::Advance)
        }

        ExecEvent::WorkerFailed { step, kind, message } => {
            if kind.is_auto_resumable() {
                // Transient: does not consume a worker attempt.
                next.counters.auto_resume += 1;
                if next.counters.auto_resume >= caps.auto_resume {
                    next.blocked_step = Some(step.clone());
                    return (
                        next,
                        Disposition::Block {
                            kind: *kind,
                            reason: format!(
                                "{step} failed repeatedly with transient errors: {message}"
                            ),
                            gate: None,
                        },
                    );
                }
                return (next, Disposition::Requeue);
            }

            if *kind == ErrorKind::PlanMissing {
                next.counters.plan += 1;
                if next.counters.plan >= caps.plan {
                    next.blocked_step = Some(step.clone());
                    return (
                        next,
                        Disposition::Block {
                            kind: *kind,
                            reason: format!("{step} produced no plan after {} attempts", caps.plan),
                            gate: None,
                        },
                    );
                }
                return (next, Disposition::Requeue);
            }

            next.counters.worker += 1;
            if next.counters.worker >= caps.worker {
                next.blocked_step = Some(step.clone());
                return (
                    next,
                    Disposition::Block {
                        kind: *kind,
                        reason: format!(
                            "{step} failed after {} worker attempts: {message}",
                            caps.worker
                        ),
                        gate: None,
                    },
                );
            }
            (next, Disposition::Requeue)
        }

        ExecEvent::NoIntroducedChanges { step } => {
            next.counters.no_progress += 1;
            if next.counters.no_progress >= caps.no_progress {
                next.blocked_step = Some(step.clone());
                return (
                    next,
                    Disposition::Block {
                        kind: ErrorKind::Internal,
                        reason: format!(
                            "{step} made no changes in {} consecutive runs",
                            caps.no_progress
                        ),
                        gate: None,
                    },
                );
            }
            (next, Disposition::Requeue)
        }

        ExecEvent::ProgressHumanBlockers { step, issues } => {
            // Escalations block immediately; no retry budget applies.
            next.blocked_step = Some(step.clone());
            let first = issues
                .first()
                .map(|i| i.summary.clone())
                .unwrap_or_else(|| "human intervention required".to_string());
            let suffix = if issues.len() == 1 { "issue" } else { "issues" };
            (
                next,
                Disposition::Block {
                    kind: ErrorKind::BlockingIssues,
                    reason: format!(
                        "Human intervention required ({} {suffix}): {first}",
                        issues.len().max(1)
                    ),
                    gate: Some(HUMAN_INTERVENTION_GATE),
                },
            )
        }

        ExecEvent::AllowlistViolation { step } => {
            next.counters.allowlist_expansion += 1;
            if next.counters.allowlist_expansion >= caps.allowlist_expansion {
                next.blocked_step = Some(step.clone());
                return (
                    next,
                    Disposition::Block {
                        kind: ErrorKind::DisallowedFiles,
                        reason: format!("{step} kept modifying files outside the allowed set"),
                        gate: None,
                    },
                );
            }
            (next, Disposition::Requeue)
        }

        ExecEvent::ReviewResult { approved } => {
            if *approved {
                next.counters.review_gen = 0;
                next.counters.review_fix = 0;
                next.blocked_step = None;
                return (next, Disposition::Advance);
            }
            next.counters.review_fix += 1;
            if next.counters.review_fix >= caps.review_fix {
                next.blocked_step = Some("review".to_string());
                return (
                    next,
                    Disposition::Block {
                        kind: ErrorKind::ReviewAttemptsExhausted,
                        reason: "Review attempt cap exceeded".to_string(),
                        gate: None,
                    },
                );
            }
            (next, Disposition::Requeue)
        }

        ExecEvent::VerificationResult { step, passed } => {
            if *passed {
                next.counters.worker = 0;
                next.counters.auto_resume = 0;
                next.blocked_step = None;
                return (next, Disposition::Advance);
            }
            next.counters.worker += 1;
            if next.counters.worker >= caps.worker {
                next.blocked_step = Some(step.clone());
                return (
                    next,
                    Disposition::Block {
                        kind: ErrorKind::TestTimeout,
                        reason: format!("{step} kept failing verification"),
                        gate: None,
                    },
                );
            }
            (next, Disposition::Requeue)
        }
    }
}

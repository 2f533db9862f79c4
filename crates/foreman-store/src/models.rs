//! Domain models persisted by the state store.
//!
//! Every entity here is owned by the store in its durable form; components
//! read snapshots through repository calls and write back through `upsert`.
//! Relations between entities are expressed by id, never by owning pointers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate an opaque entity id: `<prefix>-<12 hex>`.
pub fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..12])
}

/// Current UTC timestamp.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// SHA-256 of plan content, hex-encoded.
pub fn content_sha256(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Done,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses satisfy blockers and are never scheduled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority. `P0` is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Rank for claim ordering; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" | "p0" => Ok(Self::P0),
            "P1" | "p1" => Ok(Self::P1),
            "P2" | "p2" => Ok(Self::P2),
            "P3" | "p3" => Ok(Self::P3),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// How a finished pipeline resolves the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    HumanReview,
    AutoApprove,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::HumanReview
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HumanReview => "human_review",
            Self::AutoApprove => "auto_approve",
        };
        f.write_str(s)
    }
}

/// Human-in-the-loop mode: which step boundaries require approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlMode {
    Autopilot,
    Supervised,
    Collaborative,
    ReviewOnly,
}

impl Default for HitlMode {
    fn default() -> Self {
        Self::Autopilot
    }
}

impl fmt::Display for HitlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Autopilot => "autopilot",
            Self::Supervised => "supervised",
            Self::Collaborative => "collaborative",
            Self::ReviewOnly => "review_only",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Severity of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(SeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Severity`] string.
#[derive(Debug, Clone)]
pub struct SeverityParseError(pub String);

impl fmt::Display for SeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid severity: {:?}", self.0)
    }
}

impl std::error::Error for SeverityParseError {}

/// Per-severity counters, used both as quality-gate thresholds and as
/// open-finding counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub high: u32,
    #[serde(default)]
    pub medium: u32,
    #[serde(default)]
    pub low: u32,
}

impl SeverityCounts {
    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn increment(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    /// True when any severity count exceeds the corresponding gate threshold.
    pub fn exceeds(&self, gate: &SeverityCounts) -> bool {
        Severity::ALL.iter().any(|&sev| self.get(sev) > gate.get(sev))
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// The `error_type` tag attached to blocked tasks and run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worker produced no progress heartbeat within grace.
    HeartbeatTimeout,
    /// Worker exceeded its wall-clock cap.
    ShiftTimeout,
    /// Worker exited non-zero.
    CodexExit,
    /// Plan step produced no plan document.
    PlanMissing,
    /// Worker reported human-blocking issues.
    BlockingIssues,
    /// Worker modified files outside the allowed set.
    DisallowedFiles,
    /// Internal test command timed out.
    TestTimeout,
    /// Review loop gave up.
    ReviewAttemptsExhausted,
    GitPushFailed,
    GitCheckoutFailed,
    /// Worktree merge could not be resolved.
    MergeConflict,
    /// Requested step not in the pipeline.
    InvalidStep,
    /// Unclassified internal failure.
    Internal,
}

impl ErrorKind {
    /// Transient failures are re-queued without consuming a worker attempt.
    pub fn is_auto_resumable(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::ShiftTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ShiftTimeout => "shift_timeout",
            Self::CodexExit => "codex_exit",
            Self::PlanMissing => "plan_missing",
            Self::BlockingIssues => "blocking_issues",
            Self::DisallowedFiles => "disallowed_files",
            Self::TestTimeout => "test_timeout",
            Self::ReviewAttemptsExhausted => "review_attempts_exhausted",
            Self::GitPushFailed => "git_push_failed",
            Self::GitCheckoutFailed => "git_checkout_failed",
            Self::MergeConflict => "merge_conflict",
            Self::InvalidStep => "invalid_step",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task metadata
// ---------------------------------------------------------------------------

/// A structured human escalation from the worker's progress file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanBlockingIssue {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl HumanBlockingIssue {
    pub fn from_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            details: None,
            category: None,
            action: None,
            blocking_on: None,
            severity: None,
        }
    }
}

/// Trace record for an inferred dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredDep {
    pub from: String,
    #[serde(default)]
    pub reason: String,
}

/// Candidate task context handed to the dependency analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepCandidate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Already-analyzed task context handed to the dependency analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepExisting {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// Attempt counters consumed by the task reducer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    #[serde(default)]
    pub worker: u32,
    #[serde(default)]
    pub plan: u32,
    #[serde(default)]
    pub no_progress: u32,
    #[serde(default)]
    pub review_gen: u32,
    #[serde(default)]
    pub review_fix: u32,
    #[serde(default)]
    pub allowlist_expansion: u32,
    #[serde(default)]
    pub auto_resume: u32,
}

impl AttemptCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Well-known per-run scratch carried on a task.
///
/// The known fields are typed; anything else survives round-trips in
/// `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_findings: Option<Vec<ReviewFinding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_blocking_issues: Option<Vec<HumanBlockingIssue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_conflict: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_conflict_files: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_other_tasks: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmerged_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_deps: Option<Vec<InferredDep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps_analyzed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_tasks: Option<Vec<DepCandidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_tasks: Option<Vec<DepExisting>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_plan_revision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_plan_revision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_refine_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_refine_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_refine_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_for_generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeouts: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "AttemptCounters::is_zero")]
    pub attempts: AttemptCounters,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The unit of autonomous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_template: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,

    #[serde(default)]
    pub quality_gate: SeverityCounts,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub hitl_mode: HitlMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_gate: Option<String>,

    #[serde(default = "default_source")]
    pub source: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: TaskMeta,
}

fn default_source() -> String {
    "manual".to_string()
}

impl Task {
    /// New backlog task with store defaults.
    pub fn new(title: impl Into<String>, task_type: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: new_id("task"),
            title: title.into(),
            description: String::new(),
            task_type: task_type.into(),
            priority: Priority::default(),
            status: TaskStatus::Backlog,
            labels: Vec::new(),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            parent_id: None,
            children_ids: Vec::new(),
            pipeline_template: Vec::new(),
            current_step: None,
            current_agent_id: None,
            run_ids: Vec::new(),
            retry_count: 0,
            error: None,
            error_type: None,
            quality_gate: SeverityCounts::default(),
            approval_mode: ApprovalMode::default(),
            hitl_mode: HitlMode::default(),
            pending_gate: None,
            source: default_source(),
            created_at: ts,
            updated_at: ts,
            metadata: TaskMeta::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Done,
    Blocked,
    InReview,
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::InReview => "in_review",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Per-step outcome appended to a run in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub step: String,
    pub status: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_counts: Option<SeverityCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_blocking_issues: Option<Vec<HumanBlockingIssue>>,
}

/// One end-to-end execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepLogEntry>,
}

impl RunRecord {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            id: new_id("run"),
            task_id: task_id.into(),
            branch: None,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            summary: None,
            steps: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Review cycles
// ---------------------------------------------------------------------------

/// Open/resolved state of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Resolved,
}

/// One issue surfaced by the review step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub id: String,
    pub task_id: String,
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub status: FindingStatus,
}

fn default_category() -> String {
    "quality".to_string()
}

/// Decision on one review cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        };
        f.write_str(s)
    }
}

/// One pass through the review step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: String,
    pub task_id: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub open_counts: SeverityCounts,
    pub decision: ReviewDecision,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Status of a logical worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Terminated,
    Failed,
}

/// A logical worker slot available for step dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_provider: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

fn default_capacity() -> u32 {
    1
}

impl AgentRecord {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            id: new_id("agent"),
            role: role.into(),
            status: AgentStatus::Running,
            capacity: 1,
            override_provider: None,
            last_seen_at: now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Quick actions
// ---------------------------------------------------------------------------

/// Status of an ad-hoc prompt run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickActionStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// An ad-hoc prompt run outside the task pipeline, optionally promoted to a
/// full task afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickActionRun {
    pub id: String,
    pub prompt: String,
    pub status: QuickActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl QuickActionRun {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: new_id("qrun"),
            prompt: prompt.into(),
            status: QuickActionStatus::Queued,
            started_at: None,
            finished_at: None,
            result_summary: None,
            promoted_task_id: None,
            kind: None,
            command: None,
            exit_code: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan revisions
// ---------------------------------------------------------------------------

/// Where a plan revision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    WorkerPlan,
    WorkerRefine,
    HumanEdit,
    Import,
}

/// Draft until explicitly committed; at most one committed per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRevisionStatus {
    Draft,
    Committed,
}

/// Immutable snapshot of a task's plan. Lineage forms a DAG through
/// `parent_revision_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRevision {
    pub id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub source: PlanSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_revision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub status: PlanRevisionStatus,
}

impl PlanRevision {
    pub fn new(task_id: impl Into<String>, content: impl Into<String>, source: PlanSource) -> Self {
        let content = content.into();
        Self {
            id: new_id("pr"),
            task_id: task_id.into(),
            created_at: now(),
            source,
            parent_revision_id: None,
            step: None,
            feedback_note: None,
            provider: None,
            model: None,
            content_hash: content_sha256(&content),
            content,
            status: PlanRevisionStatus::Draft,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan refine jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RefineJobStatus {
    /// Queued or running jobs hold the per-task refine slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinePriority {
    Normal,
    High,
}

impl Default for RefinePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Async worker job producing a new plan revision from (base, feedback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRefineJob {
    pub id: String,
    pub task_id: String,
    pub base_revision_id: String,
    pub status: RefineJobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub priority: RefinePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_revision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanRefineJob {
    pub fn new(
        task_id: impl Into<String>,
        base_revision_id: impl Into<String>,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("prj"),
            task_id: task_id.into(),
            base_revision_id: base_revision_id.into(),
            status: RefineJobStatus::Queued,
            created_at: now(),
            started_at: None,
            finished_at: None,
            feedback: feedback.into(),
            instructions: None,
            priority: RefinePriority::default(),
            result_revision_id: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One record in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub project_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_has_prefix_and_hex_suffix() {
        let id = new_id("task");
        assert!(id.starts_with("task-"));
        assert_eq!(id.len(), "task-".len() + 12);
        assert!(id["task-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn priority_rank_orders_p0_first() {
        assert!(Priority::P0.rank() < Priority::P1.rank());
        assert!(Priority::P1.rank() < Priority::P2.rank());
        assert!(Priority::P2.rank() < Priority::P3.rank());
    }

    #[test]
    fn severity_counts_exceeds_gate() {
        let gate = SeverityCounts {
            high: 1,
            ..Default::default()
        };
        let mut counts = SeverityCounts::default();
        assert!(!counts.exceeds(&gate));
        counts.increment(Severity::High);
        assert!(!counts.exceeds(&gate));
        counts.increment(Severity::High);
        assert!(counts.exceeds(&gate));
        // Any severity over its threshold trips the gate.
        let mut low_only = SeverityCounts::default();
        low_only.increment(Severity::Low);
        assert!(low_only.exceeds(&SeverityCounts::default()));
    }

    #[test]
    fn error_kind_auto_resume_set() {
        assert!(ErrorKind::HeartbeatTimeout.is_auto_resumable());
        assert!(ErrorKind::ShiftTimeout.is_auto_resumable());
        assert!(!ErrorKind::CodexExit.is_auto_resumable());
        assert!(!ErrorKind::BlockingIssues.is_auto_resumable());
    }

    #[test]
    fn task_yaml_round_trip_preserves_metadata_extra() {
        let mut task = Task::new("Add endpoint", "feature");
        task.metadata
            .extra
            .insert("custom_key".into(), serde_yaml::Value::from("custom"));
        task.metadata.deps_analyzed = Some(true);

        let yaml = serde_yaml::to_string(&task).unwrap();
        let back: Task = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.metadata.deps_analyzed, Some(true));
        assert_eq!(
            back.metadata.extra.get("custom_key"),
            Some(&serde_yaml::Value::from("custom"))
        );
    }

    #[test]
    fn plan_revision_hashes_content() {
        let rev = PlanRevision::new("task-1", "do the thing", PlanSource::WorkerPlan);
        assert_eq!(rev.content_hash, content_sha256("do the thing"));
        assert_eq!(rev.status, PlanRevisionStatus::Draft);
    }

    #[test]
    fn task_status_parse_round_trip() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::InReview.is_terminal());
    }
}

//! Step adapter: maps a pipeline step to one supervised worker invocation.
//!
//! [`WorkerAdapter`] is the seam the orchestrator talks through; tests
//! substitute stubs, production uses [`LiveWorkerAdapter`] which resolves
//! the provider from config, builds the prompt, supervises the process,
//! and classifies the outcome into a [`StepResult`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use foreman_store::config::{Config, ProviderKind, WorkerProviderSpec};
use foreman_store::models::{new_id, ErrorKind, HumanBlockingIssue, Severity, Task};
use foreman_store::StateStore;

use crate::pipeline::PipelineRegistry;
use crate::prompt::{build_step_prompt, detect_project_languages, PromptContext, StepCategory};
use crate::worker::command::{build_provider_command, probe_provider};
use crate::worker::ollama::run_ollama_generate;
use crate::worker::supervisor::{run_worker, WorkerInvocation, WorkerRunResult};

/// Fallback timeout when neither metadata nor the template names one.
const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 600;

/// `implement_fix` inherits the `implement` timeout when not set.
fn timeout_alias(step: &str) -> Option<&'static str> {
    match step {
        "implement_fix" => Some("implement"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Error,
    HumanBlocked,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Error
    }
}

/// A finding as parsed from worker output, before it becomes a persisted
/// `ReviewFinding`.
#[derive(Debug, Clone, Deserialize)]
pub struct FindingDraft {
    #[serde(default = "FindingDraft::default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

impl FindingDraft {
    fn default_severity() -> Severity {
        Severity::Medium
    }
}

/// A generated subtask as parsed from worker output.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedTaskDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Indices into the same batch; wired into blocked_by after creation.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// A dependency edge inferred by the analyzer worker.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DependencyEdge {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub reason: String,
}

/// Classified outcome of one step execution.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub status: StepStatus,
    pub summary: Option<String>,
    pub error_type: Option<ErrorKind>,
    pub findings: Vec<FindingDraft>,
    pub generated_tasks: Vec<GeneratedTaskDraft>,
    pub dependency_edges: Vec<DependencyEdge>,
    pub human_blocking_issues: Vec<HumanBlockingIssue>,
    pub response_text: Option<String>,
}

impl StepResult {
    pub fn ok() -> Self {
        Self {
            status: StepStatus::Ok,
            ..Default::default()
        }
    }

    pub fn error(summary: impl Into<String>, kind: Option<ErrorKind>) -> Self {
        Self {
            status: StepStatus::Error,
            summary: Some(summary.into()),
            error_type: kind,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    pub fn is_human_blocked(&self) -> bool {
        self.status == StepStatus::HumanBlocked
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// The orchestrator's only view of worker execution.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    async fn run_step(&self, task: &Task, step: &str, attempt: u32) -> StepResult;
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract the first top-level JSON object from worker text, tolerating
/// markdown code fences around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.starts_with("```") {
        let mut inner = Vec::new();
        let mut started = false;
        for line in text.lines() {
            if !started {
                if line.trim_start().starts_with("```") {
                    started = true;
                }
                continue;
            }
            if line.trim() == "```" {
                break;
            }
            inner.push(line);
        }
        return extract_json_range(&inner.join("\n"));
    }
    extract_json_range(text)
}

fn extract_json_range(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn tail_of_file(path: &std::path::Path, max_chars: usize) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let tail: String = text
        .chars()
        .rev()
        .take(max_chars)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(tail)
}

// ---------------------------------------------------------------------------
// Live adapter
// ---------------------------------------------------------------------------

/// Dispatches steps to the configured codex / claude / ollama providers.
pub struct LiveWorkerAdapter {
    store: StateStore,
}

impl LiveWorkerAdapter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn resolve_spec(&self, config: &Config, task: &Task, step: &str) -> Result<WorkerProviderSpec, String> {
        let provider_name = task
            .metadata
            .provider_override
            .clone()
            .filter(|name| config.workers.providers.contains_key(name));
        let mut spec = match provider_name {
            Some(name) => {
                let mut spec = config.workers.providers[&name].clone();
                spec.name = name;
                spec
            }
            None => config
                .workers
                .resolve_for_step(step)
                .ok_or_else(|| format!("no worker provider configured for step '{step}'"))?,
        };

        // Task-level model override wins, then the workers default.
        if spec.kind == ProviderKind::Codex || spec.kind == ProviderKind::Claude {
            let task_model = task
                .metadata
                .worker_model
                .clone()
                .filter(|m| !m.trim().is_empty());
            let effective = task_model
                .or_else(|| config.workers.default_model.clone())
                .or_else(|| spec.model.clone());
            spec.model = effective;
        }
        Ok(spec)
    }

    fn timeout_for_step(&self, task: &Task, step: &str) -> Duration {
        let keys = [Some(step), timeout_alias(step)];

        if let Some(overrides) = task.metadata.step_timeouts.as_ref() {
            for key in keys.iter().flatten() {
                if let Some(&seconds) = overrides.get(*key) {
                    if seconds > 0 {
                        return Duration::from_secs(seconds);
                    }
                }
            }
        }

        let registry = PipelineRegistry::new();
        let template = registry.resolve_for_task_type(&task.task_type);
        for key in keys.iter().flatten() {
            if let Some(def) = template.step(key) {
                return Duration::from_secs(def.timeout_seconds.max(1));
            }
        }
        Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS)
    }

    fn classify(
        &self,
        result: &WorkerRunResult,
        spec: &WorkerProviderSpec,
        step: &str,
    ) -> StepResult {
        if !result.human_blocking_issues.is_empty() {
            let issues = result.human_blocking_issues.clone();
            let first = issues[0].summary.clone();
            let suffix = if issues.len() == 1 { "issue" } else { "issues" };
            return StepResult {
                status: StepStatus::HumanBlocked,
                summary: Some(format!(
                    "Human intervention required ({} {suffix}): {first}",
                    issues.len()
                )),
                error_type: Some(ErrorKind::BlockingIssues),
                human_blocking_issues: issues,
                ..Default::default()
            };
        }
        if result.no_heartbeat {
            return StepResult::error(
                "Worker stalled (no heartbeat or output activity).",
                Some(ErrorKind::HeartbeatTimeout),
            );
        }
        if result.timed_out {
            return StepResult::error("Worker timed out", Some(ErrorKind::ShiftTimeout));
        }
        if result.exit_code != 0 {
            let detail = tail_of_file(&result.stderr_path, 500)
                .or_else(|| tail_of_file(&result.stdout_path, 500))
                .unwrap_or_else(|| format!("Worker exited with code {}", result.exit_code));
            return StepResult::error(detail, Some(ErrorKind::CodexExit));
        }

        self.parse_success(&result.response_text, spec, step)
    }

    fn parse_success(
        &self,
        response_text: &str,
        _spec: &WorkerProviderSpec,
        step: &str,
    ) -> StepResult {
        let category = StepCategory::of(step);
        let mut out = StepResult::ok();
        out.response_text = Some(response_text.to_string());

        let Some(parsed) = extract_json(response_text) else {
            // Unstructured output: keep a capped summary for plan capture.
            let trimmed = response_text.trim();
            if !trimmed.is_empty() {
                out.summary = Some(trimmed.chars().take(4000).collect());
            }
            return out;
        };

        match category {
            StepCategory::DependencyAnalysis => {
                if let Some(edges) = parsed.get("edges").and_then(Value::as_array) {
                    out.dependency_edges = edges
                        .iter()
                        .filter_map(|e| serde_json::from_value(e.clone()).ok())
                        .collect();
                }
            }
            StepCategory::Review | StepCategory::Scanning => {
                if let Some(findings) = parsed.get("findings").and_then(Value::as_array) {
                    out.findings = findings
                        .iter()
                        .filter_map(|f| serde_json::from_value(f.clone()).ok())
                        .collect();
                }
            }
            StepCategory::TaskGeneration => {
                if let Some(tasks) = parsed.get("tasks").and_then(Value::as_array) {
                    out.generated_tasks = tasks
                        .iter()
                        .filter_map(|t| serde_json::from_value(t.clone()).ok())
                        .collect();
                }
            }
            StepCategory::Verification => {
                let status = parsed.get("status").and_then(Value::as_str).unwrap_or("ok");
                let summary = parsed
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if !matches!(status, "ok" | "pass") {
                    return StepResult {
                        status: StepStatus::Error,
                        summary: summary.or(Some("verification failed".to_string())),
                        ..Default::default()
                    };
                }
                out.summary = summary;
            }
            _ => {
                let summary = parsed
                    .get("summary")
                    .or_else(|| parsed.get("plan"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                out.summary = summary;
            }
        }
        out
    }
}

#[async_trait]
impl WorkerAdapter for LiveWorkerAdapter {
    async fn run_step(&self, task: &Task, step: &str, attempt: u32) -> StepResult {
        let config = match self.store.config.load() {
            Ok(config) => config,
            Err(e) => return StepResult::error(format!("cannot load config: {e}"), None),
        };

        let spec = match self.resolve_spec(&config, task, step) {
            Ok(spec) => spec,
            Err(reason) => return StepResult::error(format!("Cannot resolve worker: {reason}"), None),
        };

        if let Err(reason) = probe_provider(&spec) {
            return StepResult::error(format!("Worker not available: {reason}"), None);
        }

        let project_dir: PathBuf = task
            .metadata
            .worktree_dir
            .clone()
            .unwrap_or_else(|| self.store.project_dir().to_path_buf());

        let run_dir = self.store.runs_dir().join(new_id("wrun"));
        let run_id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let progress_path = run_dir.join("progress.json");

        let languages = detect_project_languages(&project_dir);
        let wants_json_schema = spec.kind == ProviderKind::Ollama
            || matches!(
                StepCategory::of(step),
                StepCategory::Review
                    | StepCategory::Scanning
                    | StepCategory::TaskGeneration
                    | StepCategory::DependencyAnalysis
            );
        let ctx = PromptContext {
            wants_json_schema,
            project_languages: &languages,
            project_commands: Some(&config.project.commands),
            progress_path: Some(&progress_path),
            run_id: Some(&run_id),
        };
        let prompt = build_step_prompt(task, step, attempt, &ctx);

        let timeout = self.timeout_for_step(task, step);

        tracing::info!(
            task_id = %task.id,
            step,
            provider = %spec.name,
            timeout_secs = timeout.as_secs(),
            "dispatching worker step"
        );

        let result = match spec.kind {
            ProviderKind::Ollama => {
                run_ollama_generate(&spec, &prompt, &run_dir, timeout, &progress_path).await
            }
            ProviderKind::Codex | ProviderKind::Claude => {
                let Some(command_template) = build_provider_command(&spec) else {
                    return StepResult::error("provider has no command", None);
                };
                let invocation = WorkerInvocation {
                    command_template,
                    prompt,
                    project_dir,
                    run_dir,
                    timeout,
                    heartbeat_interval: Duration::from_secs(config.workers.heartbeat_seconds),
                    heartbeat_grace: Duration::from_secs(config.workers.heartbeat_grace_seconds),
                    progress_path: progress_path.clone(),
                    expected_run_id: Some(run_id.clone()),
                };
                let run_state = self.store.run_state.clone();
                let progress_for_state = progress_path.clone();
                run_worker(
                    &invocation,
                    Some(Box::new(move |pid| {
                        let _ = run_state.set_worker(Some(pid), Some(progress_for_state));
                    })),
                )
                .await
            }
        };

        // The worker slot is free again regardless of outcome.
        let _ = self.store.run_state.set_worker(None, None);

        match result {
            Ok(run) => self.classify(&run, &spec, step),
            Err(e) => StepResult::error(format!("Worker execution failed: {e:#}"), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_store::config::OrchestratorStatus;
    use foreman_test_utils::{create_temp_store, escalating_worker, failing_worker, write_script};

    fn store_with_provider(command: String) -> (tempfile::TempDir, StateStore) {
        let (dir, store) = create_temp_store();
        let mut config = store.config.load().unwrap();
        config.orchestrator.status = OrchestratorStatus::Running;
        let spec = WorkerProviderSpec {
            name: "codex".into(),
            kind: ProviderKind::Codex,
            command: Some(command),
            model: None,
            reasoning_effort: None,
            endpoint: None,
            temperature: None,
            num_ctx: None,
        };
        config.workers.providers.insert("codex".into(), spec);
        store.config.save(&config).unwrap();
        (dir, store)
    }

    #[test]
    fn extract_json_plain() {
        let value = extract_json(r#"{"summary": "done"}"#).unwrap();
        assert_eq!(value["summary"], "done");
    }

    #[test]
    fn extract_json_with_fences() {
        let text = "```json\n{\"findings\": []}\n```";
        let value = extract_json(text).unwrap();
        assert!(value["findings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn extract_json_with_prose_around() {
        let text = "Here is my result:\n{\"plan\": \"step 1\"}\nthanks";
        let value = extract_json(text).unwrap();
        assert_eq!(value["plan"], "step 1");
    }

    #[test]
    fn extract_json_rejects_garbage() {
        assert!(extract_json("no braces here").is_none());
        assert!(extract_json("}{").is_none());
    }

    #[tokio::test]
    async fn ok_worker_with_findings_parses() {
        let script_dir = tempfile::TempDir::new().unwrap();
        let script = write_script(
            script_dir.path(),
            "review_worker.sh",
            "cat - > /dev/null\necho '{\"findings\": [{\"severity\": \"high\", \"summary\": \"bad\", \"file\": \"src/lib.rs\"}]}'\n",
        );
        let (_dir, store) = store_with_provider(format!("{} -", script.display()));

        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("review me", "feature");
        let result = adapter.run_step(&task, "review", 1).await;

        assert!(result.is_ok(), "unexpected: {:?}", result.summary);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].severity, Severity::High);
        assert_eq!(result.findings[0].summary, "bad");
    }

    #[tokio::test]
    async fn failing_worker_classified_as_codex_exit_with_stderr_tail() {
        let script_dir = tempfile::TempDir::new().unwrap();
        let script = failing_worker(script_dir.path(), 2);
        let (_dir, store) = store_with_provider(format!("{} -", script.display()));

        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("fails", "feature");
        let result = adapter.run_step(&task, "implement", 1).await;

        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(result.error_type, Some(ErrorKind::CodexExit));
        assert!(result.summary.as_deref().unwrap_or("").contains("boom"));
    }

    #[tokio::test]
    async fn escalating_worker_classified_as_human_blocked() {
        let script_dir = tempfile::TempDir::new().unwrap();
        let script = escalating_worker(script_dir.path(), "need credentials");
        let (_dir, store) = store_with_provider(format!("{} -", script.display()));

        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("escalates", "feature");
        let result = adapter.run_step(&task, "implement", 1).await;

        assert!(result.is_human_blocked());
        assert_eq!(result.error_type, Some(ErrorKind::BlockingIssues));
        assert_eq!(result.human_blocking_issues.len(), 1);
        assert_eq!(result.human_blocking_issues[0].summary, "need credentials");
    }

    #[tokio::test]
    async fn dependency_edges_parse_from_any_provider() {
        let script_dir = tempfile::TempDir::new().unwrap();
        let script = write_script(
            script_dir.path(),
            "deps_worker.sh",
            "cat - > /dev/null\necho '{\"edges\": [{\"from\": \"task-a\", \"to\": \"task-b\", \"reason\": \"schema first\"}]}'\n",
        );
        let (_dir, store) = store_with_provider(format!("{} -", script.display()));

        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("Dependency analysis", "research");
        let result = adapter.run_step(&task, "analyze_deps", 1).await;

        assert!(result.is_ok());
        assert_eq!(
            result.dependency_edges,
            vec![DependencyEdge {
                from: "task-a".into(),
                to: "task-b".into(),
                reason: "schema first".into(),
            }]
        );
    }

    #[tokio::test]
    async fn benchmark_failure_maps_to_error() {
        // `verify` itself never reaches a worker; the worker-reported
        // pass/fail parse applies to the other verification-category
        // steps (benchmark, reproduce).
        let script_dir = tempfile::TempDir::new().unwrap();
        let script = write_script(
            script_dir.path(),
            "bench_worker.sh",
            "cat - > /dev/null\necho '{\"status\": \"fail\", \"summary\": \"p99 regressed\"}'\n",
        );
        let (_dir, store) = store_with_provider(format!("{} -", script.display()));

        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("benchmark", "performance");
        let result = adapter.run_step(&task, "benchmark", 1).await;

        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(result.summary.as_deref(), Some("p99 regressed"));
        assert!(result.error_type.is_none());
    }

    #[tokio::test]
    async fn missing_binary_reports_unavailable() {
        let (_dir, store) = store_with_provider("/nonexistent/worker -".to_string());
        let adapter = LiveWorkerAdapter::new(store);
        let task = Task::new("t", "feature");
        let result = adapter.run_step(&task, "implement", 1).await;
        assert_eq!(result.status, StepStatus::Error);
        assert!(result
            .summary
            .as_deref()
            .unwrap_or("")
            .contains("Worker not available"));
    }

    #[test]
    fn timeout_resolution_prefers_metadata_then_template() {
        let (_dir, store) = create_temp_store();
        let adapter = LiveWorkerAdapter::new(store);

        let mut task = Task::new("t", "bug");
        // Template: reproduce step carries a 300s timeout.
        assert_eq!(
            adapter.timeout_for_step(&task, "reproduce"),
            Duration::from_secs(300)
        );
        // Unknown step falls back to the default.
        assert_eq!(
            adapter.timeout_for_step(&task, "mystery"),
            Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS)
        );

        // Metadata override wins.
        let mut overrides = std::collections::BTreeMap::new();
        overrides.insert("reproduce".to_string(), 42u64);
        task.metadata.step_timeouts = Some(overrides);
        assert_eq!(
            adapter.timeout_for_step(&task, "reproduce"),
            Duration::from_secs(42)
        );

        // implement_fix aliases implement.
        let mut task = Task::new("t", "feature");
        let mut overrides = std::collections::BTreeMap::new();
        overrides.insert("implement".to_string(), 99u64);
        task.metadata.step_timeouts = Some(overrides);
        assert_eq!(
            adapter.timeout_for_step(&task, "implement_fix"),
            Duration::from_secs(99)
        );
    }
}

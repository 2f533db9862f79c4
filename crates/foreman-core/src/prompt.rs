//! Prompt composition for worker steps.
//!
//! The coordinator composes prompts from task fields plus step-specific
//! instruction blocks. Prompt wording is deliberately outside the state
//! machine: nothing here feeds back into task state except through the
//! worker's parsed output.

use std::fmt;
use std::path::Path;

use foreman_store::config::LanguageCommands;
use foreman_store::models::Task;

// ---------------------------------------------------------------------------
// Step categories
// ---------------------------------------------------------------------------

/// Step names grouped by the kind of instruction and output they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCategory {
    Planning,
    Implementation,
    Verification,
    Review,
    Reporting,
    Scanning,
    TaskGeneration,
    MergeResolution,
    DependencyAnalysis,
    General,
}

impl StepCategory {
    pub fn of(step: &str) -> Self {
        match step {
            "plan" | "plan_impl" | "plan_refine" | "analyze" => Self::Planning,
            "implement" | "implement_fix" | "prototype" => Self::Implementation,
            "verify" | "benchmark" | "reproduce" => Self::Verification,
            "review" => Self::Review,
            "report" | "summarize" => Self::Reporting,
            "scan" | "scan_deps" | "scan_code" | "gather" | "profile" => Self::Scanning,
            "generate_tasks" | "diagnose" => Self::TaskGeneration,
            "resolve_merge" => Self::MergeResolution,
            "analyze_deps" => Self::DependencyAnalysis,
            _ => Self::General,
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            Self::Planning => {
                "Create a scoped, independently testable plan for the following task.\n\
                 Describe a coherent technical approach. Do not assume infrastructure or\n\
                 services that are not already present. Planning does not modify\n\
                 repository code."
            }
            Self::Implementation => {
                "Implement the changes described in the following task.\n\
                 Complete the entire step fully. Partial work leaves the repository in\n\
                 an inconsistent state. Update README or docs when observable behavior\n\
                 changes."
            }
            Self::Verification => {
                "Run the project's test, lint, and type-check commands for the following\n\
                 task. Do not bypass or skip tests. Report results accurately. Do not\n\
                 mask failures. If you can identify the root cause of a failure, note it\n\
                 clearly so the next step can address it."
            }
            Self::Review => {
                "Review the implementation and list findings.\n\
                 Each finding must include a severity (critical / high / medium / low).\n\
                 Evaluate every acceptance criterion explicitly. Provide concrete\n\
                 evidence tied to files and diffs. Do not speculate and do not down-rank\n\
                 findings."
            }
            Self::Reporting => {
                "Produce a summary report for the following task.\n\
                 Tie conclusions to concrete evidence. Be explicit about risks and\n\
                 remaining uncertainty."
            }
            Self::Scanning => {
                "Scan and gather information for the following task.\n\
                 Report findings with severity and file locations. Provide concrete\n\
                 evidence only."
            }
            Self::TaskGeneration => {
                "Generate subtasks for the following task.\n\
                 Each subtask must be independently implementable. Include title,\n\
                 description, task_type, and priority. Cover the full scope without\n\
                 overlap."
            }
            Self::MergeResolution => {
                "Resolve the merge conflicts in the following files. Both tasks'\n\
                 objectives must be fulfilled in the resolution."
            }
            Self::DependencyAnalysis => {
                "Analyze task dependencies for this codebase.\n\n\
                 First, examine the project structure to understand what already exists.\n\
                 Then, given the pending tasks below, determine which tasks depend on\n\
                 others. A task B depends on task A only when B requires code, APIs,\n\
                 schemas, or artifacts that task A will CREATE, or B builds on modules\n\
                 task A will introduce. Do NOT create a dependency from vague thematic\n\
                 similarity or when the required code already exists. If tasks can\n\
                 safely run in parallel, leave them independent."
            }
            Self::General => "Follow the task description and report results clearly.",
        }
    }

    fn json_schema(self) -> &'static str {
        match self {
            Self::Planning => r#"{"plan": "string describing the plan"}"#,
            Self::Implementation => {
                r#"{"patch": "unified diff of changes", "summary": "description of changes"}"#
            }
            Self::Verification => r#"{"status": "pass|fail", "summary": "test results summary"}"#,
            Self::Review => {
                r#"{"findings": [{"severity": "critical|high|medium|low", "category": "string", "summary": "string", "file": "path", "line": 0, "suggested_fix": "string"}]}"#
            }
            Self::Reporting => r#"{"summary": "detailed report text"}"#,
            Self::Scanning => {
                r#"{"findings": [{"severity": "critical|high|medium|low", "category": "string", "summary": "string", "file": "path"}]}"#
            }
            Self::TaskGeneration => {
                r#"{"tasks": [{"title": "string", "description": "string", "task_type": "feature|bug|research", "priority": "P0|P1|P2|P3"}]}"#
            }
            Self::MergeResolution => r#"{"status": "ok|error", "summary": "string"}"#,
            Self::DependencyAnalysis => {
                r#"{"edges": [{"from": "task_id_first", "to": "task_id_depends", "reason": "why"}]}"#
            }
            Self::General => r#"{"status": "ok|error", "summary": "string"}"#,
        }
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Verification => "verification",
            Self::Review => "review",
            Self::Reporting => "reporting",
            Self::Scanning => "scanning",
            Self::TaskGeneration => "task_generation",
            Self::MergeResolution => "merge_resolution",
            Self::DependencyAnalysis => "dependency_analysis",
            Self::General => "general",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Prompt layers
// ---------------------------------------------------------------------------

const PREAMBLE: &str = "You are an autonomous coding agent managed by a coordinator process.\n\
The coordinator is the final authority on task state. It assigns steps,\n\
tracks progress, and handles all git commits.\n\n\
## Human-blocking issues\n\
If you encounter a problem that genuinely cannot be resolved without human\n\
intervention, report it as a human-blocking issue in the progress file.\n\
Valid reasons: specification is missing or contradictory, required\n\
credentials or access are unavailable. Do NOT escalate code-quality\n\
concerns, design preferences, refactoring suggestions, or review feedback.\n\
Handle those within your step output.";

const GUARDRAILS: &str = "## Guardrails\n\
- Do NOT commit, push, or rebase. The coordinator handles all commits.\n\
- Do NOT modify files under `.foreman/`. Those are coordinator state.\n\
- Do NOT suppress or down-rank review findings.\n\
- Prefer fixing issues over escalating; escalate only when truly stuck.\n\
- Be explicit about risks, uncertainty, and assumptions.";

// ---------------------------------------------------------------------------
// Language detection
// ---------------------------------------------------------------------------

const LANGUAGE_MARKERS: [(&str, &str); 6] = [
    ("pyproject.toml", "python"),
    ("setup.py", "python"),
    ("tsconfig.json", "typescript"),
    ("package.json", "javascript"),
    ("go.mod", "go"),
    ("Cargo.toml", "rust"),
];

/// Detect project languages from marker files. TypeScript subsumes
/// JavaScript when both markers are present.
pub fn detect_project_languages(project_dir: &Path) -> Vec<String> {
    let mut langs: Vec<String> = Vec::new();
    for (marker, lang) in LANGUAGE_MARKERS {
        if project_dir.join(marker).exists() && !langs.iter().any(|l| l == lang) {
            langs.push(lang.to_string());
        }
    }
    if langs.iter().any(|l| l == "typescript") {
        langs.retain(|l| l != "javascript");
    }
    langs
}

fn language_standards(lang: &str) -> Option<&'static str> {
    match lang {
        "python" => Some(
            "## Language standards: Python\n\
             - Google-style docstrings; module-level docstring in every file.\n\
             - Type hints (Python 3.10+ syntax). Aim for mypy strict compliance.\n\
             - Format with ruff; lint with ruff check.",
        ),
        "typescript" => Some(
            "## Language standards: TypeScript\n\
             - JSDoc on exported symbols. Strict tsconfig (no `any`).\n\
             - Compile-check with tsc --noEmit. Lint with ESLint.",
        ),
        "javascript" => Some(
            "## Language standards: JavaScript\n\
             - JSDoc on exported symbols.\n\
             - Lint with ESLint; format with Prettier.",
        ),
        "go" => Some(
            "## Language standards: Go\n\
             - Godoc conventions on exported symbols.\n\
             - Format with gofmt; lint with golangci-lint.",
        ),
        "rust" => Some(
            "## Language standards: Rust\n\
             - `///` doc comments on public items.\n\
             - Format with cargo fmt; lint with cargo clippy.",
        ),
        _ => None,
    }
}

fn display_language(lang: &str) -> String {
    match lang {
        "python" => "Python".to_string(),
        "typescript" => "TypeScript".to_string(),
        "javascript" => "JavaScript".to_string(),
        "go" => "Go".to_string(),
        "rust" => "Rust".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
    }
}

fn format_project_commands(
    commands: &std::collections::BTreeMap<String, LanguageCommands>,
    languages: &[String],
) -> Option<String> {
    let mut blocks: Vec<(String, Vec<String>)> = Vec::new();
    for lang in languages {
        let Some(cmds) = commands.get(lang) else { continue };
        let mut lines = Vec::new();
        for (label, value) in [
            ("Test", &cmds.test),
            ("Lint", &cmds.lint),
            ("Typecheck", &cmds.typecheck),
            ("Format", &cmds.format),
        ] {
            if let Some(cmd) = value.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                lines.push(format!("- {label}: `{cmd}`"));
            }
        }
        if !lines.is_empty() {
            blocks.push((lang.clone(), lines));
        }
    }
    if blocks.is_empty() {
        return None;
    }
    let mut parts = vec!["## Project commands".to_string()];
    if blocks.len() == 1 {
        parts.extend(blocks.remove(0).1);
    } else {
        for (lang, lines) in blocks {
            parts.push(format!("### {}", display_language(&lang)));
            parts.extend(lines);
        }
    }
    Some(parts.join("\n"))
}

// ---------------------------------------------------------------------------
// Prompt building
// ---------------------------------------------------------------------------

/// Inputs beyond the task itself that shape a step prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Structured JSON is requested explicitly for providers that do not
    /// emit it by convention.
    pub wants_json_schema: bool,
    pub project_languages: &'a [String],
    pub project_commands: Option<&'a std::collections::BTreeMap<String, LanguageCommands>>,
    pub progress_path: Option<&'a Path>,
    pub run_id: Option<&'a str>,
}

fn push_progress_contract(parts: &mut Vec<String>, ctx: &PromptContext<'_>) {
    let Some(progress) = ctx.progress_path else { return };
    let mut block = format!(
        "## Progress file\n\
         Write JSON to `{}` at least once per heartbeat interval:\n\
         {{\"run_id\": \"{}\", \"heartbeat\": \"<ISO-8601 UTC now>\", \"step\": \"<current step>\"}}\n\
         Add `human_blocking_issues` entries only for genuine human escalations.",
        progress.display(),
        ctx.run_id.unwrap_or("<run id>"),
    );
    block.push('\n');
    parts.push(block);
}

/// Build the prompt for a worker step from task fields.
pub fn build_step_prompt(task: &Task, step: &str, attempt: u32, ctx: &PromptContext<'_>) -> String {
    let category = StepCategory::of(step);
    let mut parts: Vec<String> = vec![PREAMBLE.to_string(), String::new()];
    parts.push(category.instruction().to_string());
    parts.push(String::new());

    if category == StepCategory::DependencyAnalysis {
        if let Some(candidates) = task.metadata.candidate_tasks.as_deref() {
            parts.push("## Tasks to analyze".to_string());
            parts.push(String::new());
            for candidate in candidates {
                parts.push(format!("- ID: {}", candidate.id));
                parts.push(format!("  Title: {}", candidate.title));
                let description: String = candidate.description.chars().take(200).collect();
                if !description.is_empty() {
                    parts.push(format!("  Description: {description}"));
                }
                parts.push(format!("  Type: {}", candidate.task_type));
                if !candidate.labels.is_empty() {
                    parts.push(format!("  Labels: {}", candidate.labels.join(", ")));
                }
                parts.push(String::new());
            }
        }
        if let Some(existing) = task.metadata.existing_tasks.as_deref() {
            if !existing.is_empty() {
                parts.push("## Already-scheduled tasks (may be blockers)".to_string());
                parts.push(String::new());
                for entry in existing {
                    parts.push(format!("- ID: {}", entry.id));
                    parts.push(format!("  Title: {}", entry.title));
                    parts.push(format!("  Status: {}", entry.status));
                    parts.push(String::new());
                }
            }
        }
        parts.push("## Rules".to_string());
        parts.push("- Only output edges where one task MUST complete before another can start.".into());
        parts.push("- Use the exact task IDs from above.".into());
        parts.push("- If all tasks are independent, return an empty edges array.".into());
        parts.push("- Do not create circular dependencies.".into());
        parts.push(String::new());
        push_progress_contract(&mut parts, ctx);
        parts.push(GUARDRAILS.to_string());
        if ctx.wants_json_schema {
            parts.push(String::new());
            parts.push(format!(
                "Respond with valid JSON matching this schema: {}",
                category.json_schema()
            ));
        }
        return parts.join("\n");
    }

    parts.push(format!("Task: {}", task.title));
    if !task.description.is_empty() {
        parts.push(format!("Description: {}", task.description));
    }
    parts.push(format!("Type: {}", task.task_type));
    parts.push(format!("Priority: {}", task.priority));
    parts.push(format!("Step: {step}"));
    if attempt > 1 {
        parts.push(format!("Attempt: {attempt}"));
    }

    // Open review findings feed the fix steps.
    if let Some(findings) = task.metadata.review_findings.as_deref() {
        if !findings.is_empty() {
            parts.push(String::new());
            parts.push("Review findings to address:".to_string());
            for finding in findings {
                let loc = match (finding.file.as_deref(), finding.line) {
                    (Some(file), Some(line)) => format!(" ({file}:{line})"),
                    (Some(file), None) => format!(" ({file})"),
                    _ => String::new(),
                };
                parts.push(format!("  - [{}] {}{loc}", finding.severity, finding.summary));
            }
        }
    }

    if category == StepCategory::MergeResolution {
        if let Some(conflicts) = task.metadata.merge_conflict_files.as_ref() {
            parts.push(String::new());
            parts.push(
                "Conflicted files (with <<<<<<< / ======= / >>>>>>> markers):".to_string(),
            );
            for (path, content) in conflicts {
                parts.push(format!("\n--- {path} ---"));
                parts.push(content.clone());
            }
        }
        if let Some(others) = task.metadata.merge_other_tasks.as_deref() {
            if !others.is_empty() {
                parts.push(String::new());
                parts.push("Other task(s) whose changes conflict with this task:".to_string());
                for info in others {
                    parts.push(info.clone());
                }
            }
        }
        parts.push(String::new());
        parts.push(
            "Edit the conflicted files to resolve all conflicts. Ensure BOTH this task's \
             and the other task(s)' objectives are preserved."
                .to_string(),
        );
    }

    // Plan refinement carries the base plan and the reviewer's feedback.
    if step == "plan_refine" {
        if let Some(base) = task.metadata.plan_refine_base.as_deref() {
            parts.push(String::new());
            parts.push("## Current plan".to_string());
            parts.push(base.to_string());
        }
        if let Some(feedback) = task.metadata.plan_refine_feedback.as_deref() {
            parts.push(String::new());
            parts.push("## Feedback to address".to_string());
            parts.push(feedback.to_string());
        }
        if let Some(instructions) = task.metadata.plan_refine_instructions.as_deref() {
            parts.push(String::new());
            parts.push("## Additional instructions".to_string());
            parts.push(instructions.to_string());
        }
    }

    if step == "generate_tasks" {
        if let Some(plan) = task.metadata.plan_for_generation.as_deref() {
            parts.push(String::new());
            parts.push("## Plan to decompose".to_string());
            parts.push(plan.to_string());
        }
    }

    if matches!(category, StepCategory::Implementation | StepCategory::Review) {
        for lang in ctx.project_languages {
            if let Some(block) = language_standards(lang) {
                parts.push(String::new());
                parts.push(block.to_string());
            }
        }
    }

    if matches!(
        category,
        StepCategory::Implementation | StepCategory::Verification
    ) {
        if let Some(commands) = ctx.project_commands {
            if let Some(block) = format_project_commands(commands, ctx.project_languages) {
                parts.push(String::new());
                parts.push(block);
            }
        }
    }

    parts.push(String::new());
    push_progress_contract(&mut parts, ctx);
    parts.push(GUARDRAILS.to_string());

    if ctx.wants_json_schema {
        parts.push(String::new());
        parts.push(format!(
            "Respond with valid JSON matching this schema: {}",
            category.json_schema()
        ));
    }

    parts.join("\n")
}

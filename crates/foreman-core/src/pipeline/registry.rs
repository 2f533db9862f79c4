//! Pipeline template registry.
//!
//! A template is the ordered step list a task walks, resolved from
//! `task_type` at creation. Built-ins cover every supported task type;
//! custom templates can be registered programmatically or loaded from
//! YAML files in the project's state directory.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One step in a pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDef {
    pub name: String,
    pub display_name: String,
    pub required: bool,
    /// Skip-rule expression, evaluated at runtime. Describes when the step
    /// should run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub timeout_seconds: u64,
    pub retry_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

impl Default for StepDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            required: true,
            condition: None,
            timeout_seconds: 600,
            retry_limit: 3,
            agent_role: None,
            config: BTreeMap::new(),
        }
    }
}

impl StepDef {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: title_case(name),
            ..Default::default()
        }
    }

    fn with_timeout(name: &str, timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds,
            ..Self::named(name)
        }
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Immutable template defining how a type of task is executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_skip: bool,
    #[serde(default)]
    pub allow_reorder: bool,
}

fn default_true() -> bool {
    true
}

impl PipelineTemplate {
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn new(id: &str, description: &str, task_types: &[&str], steps: Vec<StepDef>) -> Self {
        Self {
            id: id.to_string(),
            display_name: title_case(id),
            description: description.to_string(),
            steps,
            task_types: task_types.iter().map(|t| t.to_string()).collect(),
            allow_skip: true,
            allow_reorder: false,
        }
    }
}

fn builtin_templates() -> Vec<PipelineTemplate> {
    vec![
        PipelineTemplate::new(
            "feature",
            "Full feature lifecycle: plan, implement, verify, review, commit.",
            &["feature"],
            vec![
                StepDef::named("plan"),
                StepDef::named("plan_impl"),
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "bug",
            "Reproduce, diagnose, fix, verify, review, commit.",
            &["bug"],
            vec![
                StepDef::with_timeout("reproduce", 300),
                StepDef::named("diagnose"),
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "refactor",
            "Analyze current code, plan refactor, implement, verify, review.",
            &["refactor"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("plan"),
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "research",
            "Gather information, analyze, summarize findings.",
            &["research"],
            vec![
                StepDef::named("gather"),
                StepDef::named("analyze"),
                StepDef::named("summarize"),
                StepDef {
                    required: false,
                    ..StepDef::named("report")
                },
            ],
        ),
        PipelineTemplate::new(
            "docs",
            "Analyze code, write documentation, review, commit.",
            &["docs"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("implement"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "test",
            "Analyze coverage, write tests, verify, commit.",
            &["test"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "repo_review",
            "Scan codebase, analyze findings, generate improvement tasks.",
            &["repo_review"],
            vec![
                StepDef::named("scan"),
                StepDef::named("analyze"),
                StepDef::named("generate_tasks"),
            ],
        ),
        PipelineTemplate::new(
            "security_audit",
            "Scan dependencies and code for security issues.",
            &["security", "security_audit"],
            vec![
                StepDef::named("scan_deps"),
                StepDef::named("scan_code"),
                StepDef::named("report"),
                StepDef::named("generate_tasks"),
            ],
        ),
        PipelineTemplate::new(
            "review",
            "Analyze existing work, review changes, and produce a report.",
            &["review"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("review"),
                StepDef {
                    required: false,
                    ..StepDef::named("report")
                },
            ],
        ),
        PipelineTemplate::new(
            "performance",
            "Profile baseline, plan optimization, implement, benchmark to verify improvement.",
            &["performance"],
            vec![
                StepDef::named("profile"),
                StepDef::named("plan"),
                StepDef::named("implement"),
                StepDef::named("benchmark"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "hotfix",
            "Abbreviated bug fix: straight to fix, verify, review, commit.",
            &["hotfix"],
            vec![
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("review"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "spike",
            "Timeboxed exploration with throwaway prototyping. No commit.",
            &["spike"],
            vec![
                StepDef::named("gather"),
                StepDef::named("prototype"),
                StepDef::named("summarize"),
                StepDef::named("report"),
            ],
        ),
        PipelineTemplate::new(
            "chore",
            "Mechanical code change: implement, verify, commit. No plan or review.",
            &["chore"],
            vec![
                StepDef::named("implement"),
                StepDef::named("verify"),
                StepDef::named("commit"),
            ],
        ),
        PipelineTemplate::new(
            "plan_only",
            "Analyze and produce a plan or spec without implementing.",
            &["plan_only", "plan"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("plan"),
                StepDef::named("report"),
            ],
        ),
        PipelineTemplate::new(
            "decompose",
            "Break a large task into implementable subtasks.",
            &["decompose"],
            vec![
                StepDef::named("analyze"),
                StepDef::named("plan"),
                StepDef::named("generate_tasks"),
            ],
        ),
        PipelineTemplate::new(
            "verify_only",
            "Run tests and checks on current state without making changes.",
            &["verify_only", "verify"],
            vec![StepDef::named("verify"), StepDef::named("report")],
        ),
    ]
}

/// Registry of pipeline templates: built-ins plus custom registrations.
#[derive(Debug)]
pub struct PipelineRegistry {
    templates: BTreeMap<String, PipelineTemplate>,
    type_mapping: BTreeMap<String, String>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            templates: BTreeMap::new(),
            type_mapping: BTreeMap::new(),
        };
        for template in builtin_templates() {
            registry.register(template);
        }
        registry
    }

    pub fn get(&self, template_id: &str) -> Option<&PipelineTemplate> {
        self.templates.get(template_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &PipelineTemplate> {
        self.templates.values()
    }

    /// Best template for a task type; unknown types run the feature
    /// pipeline.
    pub fn resolve_for_task_type(&self, task_type: &str) -> &PipelineTemplate {
        self.type_mapping
            .get(task_type)
            .and_then(|id| self.templates.get(id))
            .unwrap_or_else(|| &self.templates["feature"])
    }

    pub fn register(&mut self, template: PipelineTemplate) {
        for task_type in &template.task_types {
            self.type_mapping
                .insert(task_type.clone(), template.id.clone());
        }
        self.templates.insert(template.id.clone(), template);
    }

    /// Load custom templates from a YAML file or a directory of them.
    /// Files that fail to parse are logged and skipped.
    pub fn load_from_yaml(&mut self, path: &Path) {
        if path.is_dir() {
            let Ok(entries) = std::fs::read_dir(path) else { return };
            let mut files: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect();
            files.sort();
            for file in files {
                self.load_single_yaml(&file);
            }
        } else if path.is_file() {
            self.load_single_yaml(path);
        }
    }

    fn load_single_yaml(&mut self, path: &Path) {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read pipeline YAML");
                return;
            }
        };
        match serde_yaml::from_str::<PipelineTemplate>(&text) {
            Ok(mut template) => {
                if template.display_name.is_empty() {
                    template.display_name = title_case(&template.id);
                }
                for step in &mut template.steps {
                    if step.display_name.is_empty() {
                        step.display_name = title_case(&step.name);
                    }
                }
                self.register(template);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse pipeline YAML");
            }
        }
    }
}

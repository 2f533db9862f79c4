//! Persistent project configuration (`config.yaml`).
//!
//! Loaded and saved through the same lock + atomic-write discipline as the
//! collections. Unknown keys round-trip through `extra` maps.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lock::FileLock;
use crate::models::{ApprovalMode, SeverityCounts};
use crate::repo::{StoreError, StoreResult, SCHEMA_VERSION};

/// Coordinator run status persisted in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Running,
    Paused,
    Stopped,
}

impl Default for OrchestratorStatus {
    fn default() -> Self {
        Self::Running
    }
}

/// Orchestrator scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub status: OrchestratorStatus,
    pub concurrency: usize,
    pub max_review_attempts: u32,
    pub auto_deps: bool,
    /// Wall-clock cap on one worker shift, minutes.
    pub shift_minutes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            status: OrchestratorStatus::Running,
            concurrency: 2,
            max_review_attempts: 10,
            auto_deps: true,
            shift_minutes: 45,
        }
    }
}

/// Worker provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Codex,
    Claude,
    Ollama,
}

/// One configured worker provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProviderSpec {
    #[serde(default = "default_provider_name")]
    pub name: String,
    pub kind: ProviderKind,
    /// Command template for CLI providers. Placeholders: `{prompt_file}`,
    /// `{prompt}`, `{project_dir}`, `{run_dir}`; a literal `-` means stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Base URL for HTTP providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u64>,
}

fn default_provider_name() -> String {
    "default".to_string()
}

impl WorkerProviderSpec {
    pub fn codex(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Codex,
            command: Some("codex exec".to_string()),
            model: None,
            reasoning_effort: None,
            endpoint: None,
            temperature: None,
            num_ctx: None,
        }
    }
}

/// Worker routing: default provider plus per-step overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// step name -> provider name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub step_providers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, WorkerProviderSpec>,
    pub heartbeat_seconds: u64,
    pub heartbeat_grace_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("codex".to_string(), WorkerProviderSpec::codex("codex"));
        Self {
            default_provider: "codex".to_string(),
            default_model: None,
            step_providers: BTreeMap::new(),
            providers,
            heartbeat_seconds: 30,
            heartbeat_grace_seconds: 120,
        }
    }
}

impl WorkersConfig {
    /// Resolve the provider for a step: per-step override, then default.
    pub fn resolve_for_step(&self, step: &str) -> Option<WorkerProviderSpec> {
        let name = self
            .step_providers
            .get(step)
            .unwrap_or(&self.default_provider);
        self.providers.get(name).map(|spec| {
            let mut spec = spec.clone();
            spec.name = name.clone();
            spec
        })
    }
}

/// Defaults applied to new tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub approval_mode: ApprovalMode,
    pub quality_gate: SeverityCounts,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::HumanReview,
            quality_gate: SeverityCounts::default(),
        }
    }
}

/// Per-language project commands surfaced in worker prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageCommands {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typecheck: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, LanguageCommands>,
}

/// Role routing for logical agent slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRoutingConfig {
    pub default_role: String,
    /// task_type -> role
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub task_type_roles: BTreeMap<String, String>,
    /// role -> provider name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub role_provider_overrides: BTreeMap<String, String>,
}

impl Default for AgentRoutingConfig {
    fn default() -> Self {
        Self {
            default_role: "general".to_string(),
            task_type_roles: BTreeMap::new(),
            role_provider_overrides: BTreeMap::new(),
        }
    }
}

/// The full persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u64,
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkersConfig,
    pub defaults: TaskDefaults,
    pub agent_routing: AgentRoutingConfig,
    pub project: ProjectConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pinned_projects: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            orchestrator: OrchestratorConfig::default(),
            workers: WorkersConfig::default(),
            defaults: TaskDefaults::default(),
            agent_routing: AgentRoutingConfig::default(),
            project: ProjectConfig::default(),
            pinned_projects: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Lock-guarded accessor for `config.yaml`.
#[derive(Debug)]
pub struct ConfigRepository {
    path: PathBuf,
    lock: FileLock,
    mutex: Mutex<()>,
}

impl ConfigRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock: FileLock::new(lock_path),
            mutex: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StoreResult<Config> {
        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if !self.path.exists() {
            return Ok(Config::default());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(&text).map_err(|e| StoreError::Yaml {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn save(&self, config: &Config) -> StoreResult<()> {
        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _file_guard = self.lock.acquire().map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        let text = serde_yaml::to_string(config).map_err(|e| StoreError::Yaml {
            path: self.path.clone(),
            source: e,
        })?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::Io {
                path: tmp_path.clone(),
                source: e,
            })?;
            file.write_all(text.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| StoreError::Io {
                    path: tmp_path.clone(),
                    source: e,
                })?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Load, apply `f`, save, return the updated config.
    pub fn update(&self, f: impl FnOnce(&mut Config)) -> StoreResult<Config> {
        let mut config = self.load()?;
        f(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.orchestrator.concurrency, 2);
        assert_eq!(config.orchestrator.max_review_attempts, 10);
        assert!(config.orchestrator.auto_deps);
        assert_eq!(config.orchestrator.status, OrchestratorStatus::Running);
        assert_eq!(config.defaults.approval_mode, ApprovalMode::HumanReview);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let repo = ConfigRepository::new(dir.path().join("config.yaml"));

        let mut config = Config::default();
        config.orchestrator.concurrency = 5;
        config.workers.step_providers.insert(
            "review".to_string(),
            "local-ollama".to_string(),
        );
        config.workers.providers.insert(
            "local-ollama".to_string(),
            WorkerProviderSpec {
                name: "local-ollama".to_string(),
                kind: ProviderKind::Ollama,
                command: None,
                model: Some("qwen2.5-coder".to_string()),
                reasoning_effort: None,
                endpoint: Some("http://localhost:11434".to_string()),
                temperature: Some(0.2),
                num_ctx: Some(32768),
            },
        );
        repo.save(&config).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.orchestrator.concurrency, 5);
        let spec = loaded.workers.resolve_for_step("review").unwrap();
        assert_eq!(spec.kind, ProviderKind::Ollama);
        assert_eq!(spec.model.as_deref(), Some("qwen2.5-coder"));
    }

    #[test]
    fn resolve_falls_back_to_default_provider() {
        let config = Config::default();
        let spec = config.workers.resolve_for_step("implement").unwrap();
        assert_eq!(spec.name, "codex");
        assert_eq!(spec.kind, ProviderKind::Codex);
    }

    #[test]
    fn unknown_keys_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "schema_version: 3\nui_theme: dark\norchestrator:\n  concurrency: 3\n",
        )
        .unwrap();

        let repo = ConfigRepository::new(&path);
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.orchestrator.concurrency, 3);
        repo.save(&loaded).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(doc.get("ui_theme"), Some(&serde_yaml::Value::from("dark")));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let repo = ConfigRepository::new(dir.path().join("config.yaml"));
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.orchestrator.concurrency, 2);
    }
}

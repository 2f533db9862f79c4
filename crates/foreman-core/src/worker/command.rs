//! Worker command construction.
//!
//! CLI providers are configured with a command template. The template may
//! reference `{prompt_file}`, `{prompt}`, `{project_dir}`, `{run_dir}`, or
//! carry a literal `-` to request the prompt on stdin; a template with no
//! prompt channel at all is a configuration error. Model and effort flags
//! are appended only when the CLI's `--help` output advertises them.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

use foreman_store::config::{ProviderKind, WorkerProviderSpec};

/// Placeholders recognized in command templates.
const PLACEHOLDERS: [&str; 4] = ["prompt_file", "prompt", "project_dir", "run_dir"];

/// Errors from command template handling.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("worker command template is empty")]
    Empty,

    #[error("unknown placeholder {{{0}}} in worker command template")]
    UnknownPlaceholder(String),

    #[error(
        "worker command must include {{prompt_file}}, {{prompt}}, or '-' to accept stdin input"
    )]
    NoPromptChannel,

    #[error("worker command template is not splittable: {0}")]
    Unsplittable(String),
}

/// A fully-interpolated command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub argv: Vec<String>,
    /// True when the prompt must be piped to the child's stdin and stdin
    /// closed afterwards.
    pub pipe_prompt_to_stdin: bool,
}

fn unknown_placeholder(template: &str) -> Option<String> {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let name = &template[i + 1..i + 1 + end];
                if !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !PLACEHOLDERS.contains(&name)
                {
                    return Some(name.to_string());
                }
                i += end + 2;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// Interpolate a command template and decide how the prompt reaches the
/// worker.
pub fn prepare_command(
    template: &str,
    prompt: &str,
    prompt_path: &Path,
    project_dir: &Path,
    run_dir: &Path,
) -> Result<PreparedCommand, CommandError> {
    let template = template.trim();
    if template.is_empty() {
        return Err(CommandError::Empty);
    }
    if let Some(name) = unknown_placeholder(template) {
        return Err(CommandError::UnknownPlaceholder(name));
    }

    let uses_prompt_placeholder =
        template.contains("{prompt_file}") || template.contains("{prompt}");

    let formatted = template
        .replace("{prompt_file}", &prompt_path.to_string_lossy())
        .replace("{prompt}", prompt)
        .replace("{project_dir}", &project_dir.to_string_lossy())
        .replace("{run_dir}", &run_dir.to_string_lossy());

    let argv = shlex::split(&formatted)
        .ok_or_else(|| CommandError::Unsplittable(formatted.clone()))?;
    if argv.is_empty() {
        return Err(CommandError::Empty);
    }

    let expects_stdin = argv.iter().any(|part| part == "-");
    if !uses_prompt_placeholder && !expects_stdin {
        return Err(CommandError::NoPromptChannel);
    }

    Ok(PreparedCommand {
        argv,
        pipe_prompt_to_stdin: !uses_prompt_placeholder && expects_stdin,
    })
}

// ---------------------------------------------------------------------------
// Provider command strings
// ---------------------------------------------------------------------------

fn help_cache() -> &'static Mutex<HashMap<String, bool>> {
    static CACHE: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Best-effort check whether `executable --help` mentions `flag`. Cached
/// per (executable, flag).
fn help_advertises(executable: &str, flag: &str) -> bool {
    let key = format!("{executable}\u{0}{flag}");
    if let Some(&known) = help_cache().lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
        return known;
    }
    let supported = Command::new(executable)
        .arg("--help")
        .output()
        .map(|out| {
            let text = format!(
                "{}\n{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            text.to_lowercase().contains(flag)
        })
        .unwrap_or(false);
    help_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key, supported);
    supported
}

fn split_base(base: &str, fallback: &[&str]) -> Vec<String> {
    let parts = shlex::split(base).unwrap_or_default();
    if parts.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        parts
    }
}

/// Build the codex command string, appending `--model` and
/// `--reasoning-effort` when configured and supported.
pub fn build_codex_command(spec: &WorkerProviderSpec) -> String {
    let base = spec.command.as_deref().unwrap_or("codex exec");
    let mut parts = split_base(base, &["codex", "exec"]);

    let has_model = parts.iter().any(|p| p == "--model");
    let has_effort = parts.iter().any(|p| p == "--reasoning-effort");

    if let Some(model) = spec.model.as_deref().filter(|m| !m.is_empty()) {
        if !has_model {
            parts.push("--model".to_string());
            parts.push(model.to_string());
        }
    }
    if let Some(effort) = spec.reasoning_effort.as_deref().filter(|e| !e.is_empty()) {
        if !has_effort && help_advertises(&parts[0], "--reasoning-effort") {
            parts.push("--reasoning-effort".to_string());
            parts.push(effort.to_string());
        }
    }
    shlex::try_join(parts.iter().map(String::as_str)).unwrap_or_else(|_| parts.join(" "))
}

/// Build the claude command string; ensures print mode and appends
/// `--model` / `--effort` when configured and supported.
pub fn build_claude_command(spec: &WorkerProviderSpec) -> String {
    let base = spec.command.as_deref().unwrap_or("claude -p");
    let mut parts = split_base(base, &["claude", "-p"]);

    if !parts.iter().any(|p| p == "-p" || p == "--print") {
        parts.push("-p".to_string());
    }

    let has_model = parts.iter().any(|p| p == "--model");
    let has_effort = parts.iter().any(|p| p == "--effort");

    if let Some(model) = spec.model.as_deref().filter(|m| !m.is_empty()) {
        if !has_model {
            parts.push("--model".to_string());
            parts.push(model.to_string());
        }
    }
    if let Some(effort) = spec.reasoning_effort.as_deref().filter(|e| !e.is_empty()) {
        if !has_effort && help_advertises(&parts[0], "--effort") {
            parts.push("--effort".to_string());
            parts.push(effort.to_string());
        }
    }
    shlex::try_join(parts.iter().map(String::as_str)).unwrap_or_else(|_| parts.join(" "))
}

/// Build the command string for any CLI provider kind.
pub fn build_provider_command(spec: &WorkerProviderSpec) -> Option<String> {
    match spec.kind {
        ProviderKind::Codex => Some(build_codex_command(spec)),
        ProviderKind::Claude => Some(build_claude_command(spec)),
        ProviderKind::Ollama => None,
    }
}

/// Quick availability probe before dispatch: CLI binaries must resolve,
/// HTTP providers must carry an endpoint and model.
pub fn probe_provider(spec: &WorkerProviderSpec) -> Result<(), String> {
    match spec.kind {
        ProviderKind::Codex | ProviderKind::Claude => {
            let command = build_provider_command(spec).unwrap_or_default();
            let parts = shlex::split(&command).unwrap_or_default();
            let Some(executable) = parts.first() else {
                return Err("empty worker command".to_string());
            };
            let found = if executable.contains('/') {
                Path::new(executable).exists()
            } else {
                std::env::var_os("PATH")
                    .map(|paths| {
                        std::env::split_paths(&paths).any(|dir| dir.join(executable).exists())
                    })
                    .unwrap_or(false)
            };
            if found {
                Ok(())
            } else {
                Err(format!("worker executable '{executable}' not found"))
            }
        }
        ProviderKind::Ollama => {
            if spec.endpoint.as_deref().unwrap_or("").is_empty() {
                return Err("ollama provider has no endpoint".to_string());
            }
            if spec.model.as_deref().unwrap_or("").is_empty() {
                return Err("ollama provider has no model".to_string());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(kind: ProviderKind, command: Option<&str>) -> WorkerProviderSpec {
        WorkerProviderSpec {
            name: "test".into(),
            kind,
            command: command.map(str::to_string),
            model: None,
            reasoning_effort: None,
            endpoint: None,
            temperature: None,
            num_ctx: None,
        }
    }

    fn paths() -> (String, PathBuf, PathBuf, PathBuf) {
        (
            "do the thing".to_string(),
            PathBuf::from("/state/runs/r1/prompt.txt"),
            PathBuf::from("/proj"),
            PathBuf::from("/state/runs/r1"),
        )
    }

    #[test]
    fn prompt_file_placeholder_interpolates() {
        let (prompt, prompt_path, project, run) = paths();
        let prepared =
            prepare_command("codex exec {prompt_file}", &prompt, &prompt_path, &project, &run)
                .unwrap();
        assert_eq!(
            prepared.argv,
            vec!["codex", "exec", "/state/runs/r1/prompt.txt"]
        );
        assert!(!prepared.pipe_prompt_to_stdin);
    }

    #[test]
    fn stdin_dash_pipes_prompt() {
        let (prompt, prompt_path, project, run) = paths();
        let prepared =
            prepare_command("claude -p -", &prompt, &prompt_path, &project, &run).unwrap();
        assert!(prepared.pipe_prompt_to_stdin);
        assert_eq!(prepared.argv, vec!["claude", "-p", "-"]);
    }

    #[test]
    fn missing_prompt_channel_is_config_error() {
        let (prompt, prompt_path, project, run) = paths();
        let err = prepare_command("codex exec", &prompt, &prompt_path, &project, &run)
            .expect_err("should fail");
        assert!(matches!(err, CommandError::NoPromptChannel));
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let (prompt, prompt_path, project, run) = paths();
        let err = prepare_command(
            "codex exec {prompt_file} {mystery}",
            &prompt,
            &prompt_path,
            &project,
            &run,
        )
        .expect_err("should fail");
        match err {
            CommandError::UnknownPlaceholder(name) => assert_eq!(name, "mystery"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn project_and_run_dirs_interpolate() {
        let (prompt, prompt_path, project, run) = paths();
        let prepared = prepare_command(
            "agent --cwd {project_dir} --out {run_dir} {prompt_file}",
            &prompt,
            &prompt_path,
            &project,
            &run,
        )
        .unwrap();
        assert!(prepared.argv.contains(&"/proj".to_string()));
        assert!(prepared.argv.contains(&"/state/runs/r1".to_string()));
    }

    #[test]
    fn codex_command_appends_model() {
        let mut spec = spec(ProviderKind::Codex, Some("codex exec"));
        spec.model = Some("o4-mini".into());
        let command = build_codex_command(&spec);
        assert!(command.contains("--model o4-mini"), "{command}");
    }

    #[test]
    fn codex_command_respects_existing_model_flag() {
        let mut spec = spec(ProviderKind::Codex, Some("codex exec --model gpt-5"));
        spec.model = Some("o4-mini".into());
        let command = build_codex_command(&spec);
        assert!(command.contains("--model gpt-5"));
        assert!(!command.contains("o4-mini"));
    }

    #[test]
    fn claude_command_ensures_print_mode() {
        let spec = spec(ProviderKind::Claude, Some("claude"));
        let command = build_claude_command(&spec);
        assert!(command.ends_with("-p") || command.contains(" -p "), "{command}");
    }

    #[test]
    fn ollama_probe_requires_endpoint_and_model() {
        let mut spec = spec(ProviderKind::Ollama, None);
        assert!(probe_provider(&spec).is_err());
        spec.endpoint = Some("http://localhost:11434".into());
        assert!(probe_provider(&spec).is_err());
        spec.model = Some("qwen2.5-coder".into());
        assert!(probe_provider(&spec).is_ok());
    }

    #[test]
    fn cli_probe_rejects_missing_binary() {
        let spec = spec(
            ProviderKind::Codex,
            Some("/nonexistent/path/to/codex exec {prompt_file}"),
        );
        assert!(probe_provider(&spec).is_err());
    }

    #[test]
    fn cli_probe_accepts_path_resolvable_binary() {
        // `sh` exists on every unix PATH.
        let spec = spec(ProviderKind::Codex, Some("sh -"));
        assert!(probe_provider(&spec).is_ok());
    }
}

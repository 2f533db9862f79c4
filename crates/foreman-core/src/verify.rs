//! Internal verification: runs the project's configured test commands.
//!
//! Unlike every other pipeline step, `verify` is not a worker dispatch.
//! The coordinator spawns the per-language test command itself, against
//! the task's working copy, and classifies the real exit code. A worker
//! cannot talk its way past a failing suite.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

use foreman_store::config::Config;
use foreman_store::models::ErrorKind;

use crate::prompt::detect_project_languages;

/// How much command output is carried into the step summary.
const SUMMARY_TAIL_CHARS: usize = 500;

/// Outcome of one internal verification pass.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub timed_out: bool,
    pub summary: String,
    /// `test_timeout` when the suite hit the wall clock; `None` for a
    /// plain failure.
    pub error_type: Option<ErrorKind>,
    pub commands: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl VerifyOutcome {
    fn skipped() -> Self {
        Self {
            passed: true,
            timed_out: false,
            summary: "no test command configured; skipping internal verification".to_string(),
            error_type: None,
            commands: Vec::new(),
            log_path: None,
        }
    }
}

/// Test commands for every language detected in the working copy.
pub fn test_commands(config: &Config, project_dir: &Path) -> Vec<String> {
    detect_project_languages(project_dir)
        .iter()
        .filter_map(|lang| config.project.commands.get(lang))
        .filter_map(|commands| commands.test.clone())
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty())
        .collect()
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= max_chars {
        trimmed.to_string()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

/// Run each test command in sequence under one shared wall-clock budget.
///
/// Output is appended to `log_path`; the first failure or timeout stops
/// the pass.
pub async fn run_test_commands(
    commands: &[String],
    project_dir: &Path,
    log_path: &Path,
    timeout: Duration,
) -> Result<VerifyOutcome> {
    if commands.is_empty() {
        return Ok(VerifyOutcome::skipped());
    }

    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create log dir {}", parent.display()))?;
    }

    let start = tokio::time::Instant::now();
    let mut log = String::new();
    let mut outcome = VerifyOutcome {
        passed: true,
        timed_out: false,
        summary: format!(
            "{} test command{} passed",
            commands.len(),
            if commands.len() == 1 { "" } else { "s" }
        ),
        error_type: None,
        commands: commands.to_vec(),
        log_path: Some(log_path.to_path_buf()),
    };

    for command in commands {
        log.push_str(&format!("$ {command}\n"));

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            outcome.passed = false;
            outcome.timed_out = true;
            outcome.error_type = Some(ErrorKind::TestTimeout);
            outcome.summary = format!(
                "test command timed out after {}s: {command}",
                timeout.as_secs()
            );
            log.push_str("[coordinator] timed out before the command could start\n");
            break;
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn test command '{command}'"))?;

        // Dropping the output future on timeout kills the child.
        match tokio::time::timeout(remaining, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                log.push_str(&stdout);
                log.push_str(&stderr);
                if !output.status.success() {
                    let code = output.status.code().unwrap_or(-1);
                    let detail = tail(&format!("{stdout}\n{stderr}"), SUMMARY_TAIL_CHARS);
                    outcome.passed = false;
                    outcome.summary = if detail.is_empty() {
                        format!("test command exited with code {code}: {command}")
                    } else {
                        format!("test command exited with code {code}: {command}\n{detail}")
                    };
                    break;
                }
            }
            Ok(Err(e)) => {
                outcome.passed = false;
                outcome.summary = format!("test command failed to run: {e}");
                log.push_str(&format!("[coordinator] {e}\n"));
                break;
            }
            Err(_elapsed) => {
                outcome.passed = false;
                outcome.timed_out = true;
                outcome.error_type = Some(ErrorKind::TestTimeout);
                outcome.summary = format!(
                    "test command timed out after {}s: {command}",
                    timeout.as_secs()
                );
                log.push_str(&format!(
                    "[coordinator] killed after {}s timeout\n",
                    timeout.as_secs()
                ));
                break;
            }
        }
    }

    tokio::fs::write(log_path, &log)
        .await
        .with_context(|| format!("failed to write verify log {}", log_path.display()))?;
    Ok(outcome)
}

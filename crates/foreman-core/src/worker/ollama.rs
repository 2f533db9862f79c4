//! Ollama HTTP worker provider.
//!
//! POSTs to `{endpoint}/api/generate` with `stream: true` and decodes the
//! NDJSON response one line per chunk, aggregating the `response` fields
//! into the run result's `response_text`. Transport failures land in
//! `stderr.log` and surface as a non-zero exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use foreman_store::config::WorkerProviderSpec;

use super::progress::read_human_blocking_issues;
use super::supervisor::WorkerRunResult;

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

/// Exit code reported when the generate call exceeds the step timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Run one streamed generate call against an ollama endpoint.
pub async fn run_ollama_generate(
    spec: &WorkerProviderSpec,
    prompt: &str,
    run_dir: &Path,
    timeout: Duration,
    progress_path: &Path,
) -> Result<WorkerRunResult> {
    let endpoint = spec
        .endpoint
        .as_deref()
        .context("ollama provider has no endpoint")?;
    let model = spec.model.as_deref().context("ollama provider has no model")?;

    tokio::fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;
    let prompt_path = run_dir.join("prompt.txt");
    let stdout_path = run_dir.join("stdout.log");
    let stderr_path = run_dir.join("stderr.log");
    tokio::fs::write(&prompt_path, prompt).await?;

    let options = match (spec.temperature, spec.num_ctx) {
        (None, None) => None,
        (temperature, num_ctx) => Some(GenerateOptions {
            temperature,
            num_ctx,
        }),
    };
    let request = GenerateRequest {
        model,
        prompt,
        stream: true,
        options,
    };

    let url = format!("{}/api/generate", endpoint.trim_end_matches('/'));
    let started_at = Utc::now();
    let start = tokio::time::Instant::now();

    let mut response_text = String::new();
    let mut stderr_text = String::new();
    let mut timed_out = false;

    let client = reqwest::Client::new();
    let outcome = client.post(&url).json(&request).send().await;

    match outcome {
        Ok(response) if response.status().is_success() => {
            let mut stream = response.bytes_stream();
            let mut pending = Vec::new();
            'outer: loop {
                let remaining = timeout
                    .checked_sub(start.elapsed())
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    timed_out = true;
                    stderr_text.push_str(&format!(
                        "[supervisor] ollama generate timed out after {}s\n",
                        timeout.as_secs()
                    ));
                    break;
                }
                match tokio::time::timeout(remaining, stream.next()).await {
                    Err(_) => {
                        timed_out = true;
                        stderr_text.push_str(&format!(
                            "[supervisor] ollama generate timed out after {}s\n",
                            timeout.as_secs()
                        ));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        stderr_text.push_str(&format!("[supervisor] ollama stream error: {e}\n"));
                        break;
                    }
                    Ok(Some(Ok(bytes))) => {
                        pending.extend_from_slice(&bytes);
                        while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=newline).collect();
                            let line = String::from_utf8_lossy(&line);
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(line) {
                                Ok(obj) => {
                                    if let Some(chunk) =
                                        obj.get("response").and_then(Value::as_str)
                                    {
                                        response_text.push_str(chunk);
                                    }
                                    if obj.get("done").and_then(Value::as_bool) == Some(true) {
                                        break 'outer;
                                    }
                                }
                                Err(_) => {
                                    stderr_text.push_str(line);
                                    stderr_text.push('\n');
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(response) => {
            stderr_text.push_str(&format!(
                "[supervisor] ollama HTTP error: {}\n",
                response.status()
            ));
        }
        Err(e) => {
            stderr_text.push_str(&format!("[supervisor] ollama request error: {e}\n"));
        }
    }

    tokio::fs::write(&stdout_path, &response_text).await?;
    tokio::fs::write(&stderr_path, &stderr_text).await?;

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else if stderr_text.trim().is_empty() {
        0
    } else {
        1
    };

    Ok(WorkerRunResult {
        prompt_path,
        stdout_path,
        stderr_path,
        started_at,
        finished_at: Utc::now(),
        runtime: start.elapsed(),
        exit_code,
        timed_out,
        no_heartbeat: false,
        last_heartbeat: None,
        response_text,
        human_blocking_issues: read_human_blocking_issues(progress_path),
    })
}

/// Relative path helper used by callers to keep run artifacts together.
pub fn progress_path_for(run_dir: &Path) -> PathBuf {
    run_dir.join("progress.json")
}

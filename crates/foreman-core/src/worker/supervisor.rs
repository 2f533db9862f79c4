//! Worker subprocess supervision.
//!
//! Spawns one worker CLI invocation, streams its output to the run
//! directory, and enforces the two liveness rules: a wall-clock timeout and
//! a heartbeat grace window read from the progress file. Termination is
//! SIGTERM first, SIGKILL five seconds later.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use foreman_store::models::HumanBlockingIssue;

use super::command::prepare_command;
use super::progress::{read_heartbeat, read_human_blocking_issues};

/// How much of the worker's stdout is retained in memory for parsing.
const RESPONSE_CAPTURE_CAP: usize = 512 * 1024;

/// Log writes are fsynced every this many chunks, and at EOF.
const SYNC_EVERY_CHUNKS: u32 = 32;

/// One supervised worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub command_template: String,
    pub prompt: String,
    pub project_dir: PathBuf,
    pub run_dir: PathBuf,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub progress_path: PathBuf,
    pub expected_run_id: Option<String>,
}

/// Normalized outcome of one supervised invocation.
#[derive(Debug, Clone)]
pub struct WorkerRunResult {
    pub prompt_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runtime: Duration,
    pub exit_code: i32,
    pub timed_out: bool,
    pub no_heartbeat: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Captured stdout (capped), used for structured-output parsing.
    pub response_text: String,
    pub human_blocking_issues: Vec<HumanBlockingIssue>,
}

/// Poll cadence: half the heartbeat interval, clamped to [5, 30] seconds.
pub fn poll_interval(heartbeat_interval: Duration) -> Duration {
    let half = heartbeat_interval.as_secs() / 2;
    Duration::from_secs(half.clamp(5, 30))
}

/// SIGTERM, a five second wait, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

/// Stream a child pipe to a log file with periodic fsync, optionally
/// retaining a capped copy in memory.
async fn stream_pipe(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    path: PathBuf,
    capture: bool,
) -> Vec<u8> {
    let mut captured = Vec::new();
    let Ok(mut file) = tokio::fs::File::create(&path).await else {
        tracing::warn!(path = %path.display(), "failed to create worker log file");
        return captured;
    };
    let mut buf = [0u8; 8192];
    let mut chunks: u32 = 0;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if file.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                chunks += 1;
                if chunks % SYNC_EVERY_CHUNKS == 0 {
                    let _ = file.sync_data().await;
                }
                if capture && captured.len() < RESPONSE_CAPTURE_CAP {
                    let room = RESPONSE_CAPTURE_CAP - captured.len();
                    captured.extend_from_slice(&buf[..n.min(room)]);
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "error streaming worker output");
                break;
            }
        }
    }
    let _ = file.sync_all().await;
    captured
}

/// Run one worker invocation to completion.
///
/// `on_spawn` fires with the child pid immediately after a successful
/// spawn so the caller can record it into the run state.
pub async fn run_worker(
    invocation: &WorkerInvocation,
    on_spawn: Option<Box<dyn FnOnce(u32) + Send>>,
) -> Result<WorkerRunResult> {
    tokio::fs::create_dir_all(&invocation.run_dir)
        .await
        .with_context(|| format!("failed to create run dir {}", invocation.run_dir.display()))?;

    let prompt_path = invocation.run_dir.join("prompt.txt");
    tokio::fs::write(&prompt_path, &invocation.prompt)
        .await
        .context("failed to write prompt file")?;

    let prepared = prepare_command(
        &invocation.command_template,
        &invocation.prompt,
        &prompt_path,
        &invocation.project_dir,
        &invocation.run_dir,
    )?;

    let stdout_path = invocation.run_dir.join("stdout.log");
    let stderr_path = invocation.run_dir.join("stderr.log");

    let mut command = Command::new(&prepared.argv[0]);
    command
        .args(&prepared.argv[1..])
        .current_dir(&invocation.project_dir)
        .env("FOREMAN_RUN_DIR", &invocation.run_dir)
        .env("FOREMAN_PROGRESS_FILE", &invocation.progress_path)
        .stdin(if prepared.pipe_prompt_to_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(run_id) = invocation.expected_run_id.as_deref() {
        command.env("FOREMAN_RUN_ID", run_id);
    }

    let started_at = Utc::now();
    let start = tokio::time::Instant::now();

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn worker '{}'", prepared.argv[0]))?;

    if let Some(on_spawn) = on_spawn {
        if let Some(pid) = child.id() {
            on_spawn(pid);
        }
    }

    if prepared.pipe_prompt_to_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(invocation.prompt.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write prompt to worker stdin");
            }
            // Close stdin so the worker starts processing.
            drop(stdin);
        }
    }

    let stdout_task = child.stdout.take().map(|pipe| {
        tokio::spawn(stream_pipe(pipe, stdout_path.clone(), true))
    });
    let stderr_task = child.stderr.take().map(|pipe| {
        tokio::spawn(stream_pipe(pipe, stderr_path.clone(), false))
    });

    let poll = poll_interval(invocation.heartbeat_interval);
    let mut timed_out = false;
    let mut no_heartbeat = false;
    let mut last_heartbeat: Option<DateTime<Utc>> = None;
    let mut exit_status: Option<std::process::ExitStatus> = None;

    loop {
        // Wait one poll tick for the child; a timeout is just a tick.
        match tokio::time::timeout(poll, child.wait()).await {
            Ok(status) => {
                exit_status = status.ok();
                break;
            }
            Err(_tick) => {}
        }

        if start.elapsed() > invocation.timeout {
            timed_out = true;
            terminate(&mut child).await;
            break;
        }

        let heartbeat =
            read_heartbeat(&invocation.progress_path, invocation.expected_run_id.as_deref());
        let now = Utc::now();
        let age = match heartbeat {
            Some(hb) if hb >= started_at => {
                last_heartbeat = Some(hb);
                now - hb
            }
            _ => now - started_at,
        };
        if age.num_seconds() > invocation.heartbeat_grace.as_secs() as i64 {
            no_heartbeat = true;
            terminate(&mut child).await;
            break;
        }
    }

    let exit_code = exit_status
        .or_else(|| child.try_wait().ok().flatten())
        .and_then(|s| s.code())
        .unwrap_or(-1);

    let response_bytes = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    // A worker that exited between polls may have left a final heartbeat.
    if let Some(hb) =
        read_heartbeat(&invocation.progress_path, invocation.expected_run_id.as_deref())
    {
        if hb >= started_at {
            last_heartbeat = Some(last_heartbeat.map_or(hb, |prev| prev.max(hb)));
        }
    }

    let finished_at = Utc::now();
    let human_blocking_issues = read_human_blocking_issues(&invocation.progress_path);

    Ok(WorkerRunResult {
        prompt_path,
        stdout_path,
        stderr_path,
        started_at,
        finished_at,
        runtime: start.elapsed(),
        exit_code,
        timed_out,
        no_heartbeat,
        last_heartbeat,
        response_text: String::from_utf8_lossy(&response_bytes).into_owned(),
        human_blocking_issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_test_utils::{escalating_worker, failing_worker, hanging_worker, write_script};
    use tempfile::TempDir;

    fn invocation(dir: &TempDir, command_template: String) -> WorkerInvocation {
        let run_dir = dir.path().join("run");
        WorkerInvocation {
            command_template,
            prompt: "hello worker".to_string(),
            project_dir: dir.path().to_path_buf(),
            run_dir: run_dir.clone(),
            timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(60),
            progress_path: run_dir.join("progress.json"),
            expected_run_id: Some("run-test".to_string()),
        }
    }

    #[test]
    fn poll_interval_clamps_to_spec_bounds() {
        assert_eq!(poll_interval(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(poll_interval(Duration::from_secs(30)), Duration::from_secs(15));
        assert_eq!(poll_interval(Duration::from_secs(600)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn successful_worker_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "echo_worker.sh",
            "cat - > /dev/null\necho '{\"summary\": \"all good\"}'\n",
        );
        let inv = invocation(&dir, format!("{} -", script.display()));

        let result = run_worker(&inv, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert!(!result.no_heartbeat);
        assert!(result.response_text.contains("all good"));
        assert!(result.stdout_path.exists());
        let logged = std::fs::read_to_string(&result.stdout_path).unwrap();
        assert!(logged.contains("all good"));
    }

    #[tokio::test]
    async fn prompt_reaches_worker_via_stdin() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "cat_worker.sh", "cat -\n");
        let inv = invocation(&dir, format!("{} -", script.display()));

        let result = run_worker(&inv, None).await.unwrap();
        assert!(result.response_text.contains("hello worker"));
    }

    #[tokio::test]
    async fn prompt_file_placeholder_reaches_worker() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "file_worker.sh", "cat \"$1\"\n");
        let inv = invocation(&dir, format!("{} {{prompt_file}}", script.display()));

        let result = run_worker(&inv, None).await.unwrap();
        assert!(result.response_text.contains("hello worker"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr_log() {
        let dir = TempDir::new().unwrap();
        let script = failing_worker(dir.path(), 3);
        let inv = invocation(&dir, format!("{} -", script.display()));

        let result = run_worker(&inv, None).await.unwrap();
        assert_eq!(result.exit_code, 3);
        let stderr = std::fs::read_to_string(&result.stderr_path).unwrap();
        assert!(stderr.contains("boom"));
    }

    #[tokio::test]
    async fn spawn_callback_receives_pid() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "pid_worker.sh", "exit 0\n");
        let inv = invocation(&dir, format!("{} -", script.display()));

        let (tx, rx) = std::sync::mpsc::channel();
        let result = run_worker(
            &inv,
            Some(Box::new(move |pid| {
                let _ = tx.send(pid);
            })),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 0);
        let pid = rx.recv().unwrap();
        assert!(pid > 0);
    }

    #[tokio::test]
    async fn wall_clock_timeout_terminates_worker() {
        let dir = TempDir::new().unwrap();
        let script = hanging_worker(dir.path());
        let mut inv = invocation(&dir, format!("{} -", script.display()));
        inv.timeout = Duration::from_secs(1);
        inv.heartbeat_interval = Duration::from_secs(10);
        // Generous grace so the timeout fires first.
        inv.heartbeat_grace = Duration::from_secs(600);

        let result = run_worker(&inv, None).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.no_heartbeat);
    }

    #[tokio::test]
    async fn missing_heartbeat_terminates_worker() {
        let dir = TempDir::new().unwrap();
        let script = hanging_worker(dir.path());
        let mut inv = invocation(&dir, format!("{} -", script.display()));
        inv.heartbeat_interval = Duration::from_secs(10);
        inv.heartbeat_grace = Duration::from_secs(1);

        let result = run_worker(&inv, None).await.unwrap();
        assert!(result.no_heartbeat);
        assert!(!result.timed_out);
        assert!(result.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn fresh_heartbeat_keeps_worker_alive() {
        let dir = TempDir::new().unwrap();
        // Writes a heartbeat every second, exits cleanly after 7.
        let body = r#"i=0
while [ $i -lt 7 ]; do
  printf '{"run_id": "run-test", "heartbeat": "%s"}' "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > "$FOREMAN_PROGRESS_FILE"
  sleep 1
  i=$((i+1))
done
"#;
        let script = write_script(dir.path(), "beating_worker.sh", body);
        let mut inv = invocation(&dir, format!("{} -", script.display()));
        inv.heartbeat_interval = Duration::from_secs(10);
        inv.heartbeat_grace = Duration::from_secs(6);

        let result = run_worker(&inv, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.no_heartbeat);
        assert!(result.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn escalation_surfaces_blocking_issues() {
        let dir = TempDir::new().unwrap();
        let script = escalating_worker(dir.path(), "need API key");
        let inv = invocation(&dir, format!("{} -", script.display()));

        let result = run_worker(&inv, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.human_blocking_issues.len(), 1);
        assert_eq!(result.human_blocking_issues[0].summary, "need API key");
    }

    #[tokio::test]
    async fn missing_prompt_channel_fails_before_spawn() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(&dir, "echo no-placeholders".to_string());
        let err = run_worker(&inv, None).await.expect_err("should fail");
        assert!(err.to_string().contains("stdin"), "{err}");
    }
}

//! Shared test utilities for foreman integration tests.
//!
//! Provides temporary git repositories, bootstrapped state stores, and
//! fake worker executables (shell scripts) that stand in for real coding
//! agent CLIs in supervision and orchestration tests.

use std::path::{Path, PathBuf};
use std::process::Command;

use foreman_store::StateStore;
use tempfile::TempDir;

/// Run a git command in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a temporary git repository with an initial commit.
///
/// Returns the `TempDir` (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    git(&repo_path, &["init", "-b", "main"]);
    git(&repo_path, &["config", "user.email", "test@foreman.dev"]);
    git(&repo_path, &["config", "user.name", "Foreman Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("failed to write README");
    git(&repo_path, &["add", "."]);
    git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Create a temp project dir (no git) with a bootstrapped state store.
pub fn create_temp_store() -> (TempDir, StateStore) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = StateStore::open(dir.path()).expect("failed to open state store");
    (dir, store)
}

/// Create a temp git repo with a bootstrapped state store inside it.
pub fn create_temp_repo_store() -> (TempDir, StateStore) {
    let (dir, repo_path) = create_temp_repo();
    let store = StateStore::open(&repo_path).expect("failed to open state store");
    (dir, store)
}

/// Write an executable shell script and return its path.
///
/// Used to fake worker CLIs: scripts can echo JSON, write progress files,
/// sleep past timeouts, or exit non-zero.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

/// A fake worker that exits 0 after echoing `stdout_text`.
pub fn ok_worker(dir: &Path, stdout_text: &str) -> PathBuf {
    write_script(dir, "ok_worker.sh", &format!("echo '{stdout_text}'\n"))
}

/// A fake worker that exits with the given code.
pub fn failing_worker(dir: &Path, exit_code: i32) -> PathBuf {
    write_script(
        dir,
        "failing_worker.sh",
        &format!("echo boom >&2\nexit {exit_code}\n"),
    )
}

/// A fake worker that sleeps far past any test timeout.
pub fn hanging_worker(dir: &Path) -> PathBuf {
    write_script(dir, "hanging_worker.sh", "sleep 3600\n")
}

/// A fake worker that writes `human_blocking_issues` into the progress file
/// named by `$FOREMAN_PROGRESS_FILE` and exits 0.
pub fn escalating_worker(dir: &Path, summary: &str) -> PathBuf {
    let body = format!(
        "printf '{{\"human_blocking_issues\": [{{\"summary\": \"{summary}\"}}]}}' > \"$FOREMAN_PROGRESS_FILE\"\n"
    );
    write_script(dir, "escalating_worker.sh", &body)
}

//! State-root bootstrap.
//!
//! Creates `.foreman/` with every collection file, or archives an
//! incompatible root to a timestamped sibling and recreates it. After
//! bootstrap the repositories refuse mixed-version files outright.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{Config, ConfigRepository};
use crate::repo::{StoreError, StoreResult, SCHEMA_VERSION};

/// Directory name of the state root, relative to the project directory.
pub const STATE_DIR_NAME: &str = ".foreman";

/// Collection files created at bootstrap.
pub const COLLECTION_FILES: [&str; 7] = [
    "tasks.yaml",
    "runs.yaml",
    "review_cycles.yaml",
    "agents.yaml",
    "quick_actions.yaml",
    "plan_revisions.yaml",
    "plan_refine_jobs.yaml",
];

/// Event log file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Per-run artifact directory (prompt.txt, stdout.log, stderr.log,
/// progress.json).
pub const RUNS_DIR: &str = "runs";

/// Transient per-task worktrees; never committed.
pub const WORKTREES_DIR: &str = "worktrees";

fn schema_version_of(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
    value.get("schema_version")?.as_u64()
}

fn needs_archive(base: &Path) -> bool {
    if !base.exists() {
        return false;
    }
    let config_path = base.join("config.yaml");
    if !config_path.exists() {
        return true;
    }
    schema_version_of(&config_path) != Some(SCHEMA_VERSION)
}

/// Ensure the state root exists and carries the current schema.
///
/// An incompatible root is renamed to `.foreman_legacy_<UTC stamp>` next to
/// the original before a fresh root is created.
pub fn ensure_state_root(project_dir: &Path) -> StoreResult<PathBuf> {
    let base = project_dir.join(STATE_DIR_NAME);

    if needs_archive(&base) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let archive = project_dir.join(format!("{STATE_DIR_NAME}_legacy_{stamp}"));
        tracing::warn!(
            from = %base.display(),
            to = %archive.display(),
            "state root has incompatible schema, archiving"
        );
        fs::rename(&base, &archive).map_err(|e| StoreError::Io {
            path: base.clone(),
            source: e,
        })?;
    }

    for dir in [base.clone(), base.join(RUNS_DIR), base.join(WORKTREES_DIR)] {
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;
    }

    for file_name in COLLECTION_FILES {
        let target = base.join(file_name);
        if !target.exists() {
            fs::write(&target, format!("schema_version: {SCHEMA_VERSION}\n")).map_err(|e| {
                StoreError::Io {
                    path: target.clone(),
                    source: e,
                }
            })?;
        }
    }

    let events = base.join(EVENTS_FILE);
    if !events.exists() {
        fs::write(&events, "").map_err(|e| StoreError::Io {
            path: events.clone(),
            source: e,
        })?;
    }

    // Re-save the config so defaults and the schema version are always
    // present; existing settings and unknown keys are preserved.
    let config_repo = ConfigRepository::new(base.join("config.yaml"));
    let mut config = if base.join("config.yaml").exists() {
        config_repo.load()?
    } else {
        Config::default()
    };
    config.schema_version = SCHEMA_VERSION;
    config_repo.save(&config)?;

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_fresh_state_root() {
        let dir = TempDir::new().unwrap();
        let root = ensure_state_root(dir.path()).unwrap();

        assert_eq!(root, dir.path().join(STATE_DIR_NAME));
        for file in COLLECTION_FILES {
            assert!(root.join(file).exists(), "{file} should exist");
        }
        assert!(root.join(EVENTS_FILE).exists());
        assert!(root.join(RUNS_DIR).is_dir());
        assert!(root.join(WORKTREES_DIR).is_dir());
        assert_eq!(
            schema_version_of(&root.join("config.yaml")),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn idempotent_on_existing_root() {
        let dir = TempDir::new().unwrap();
        ensure_state_root(dir.path()).unwrap();

        // Write a task file and re-bootstrap; content must survive.
        let tasks_path = dir.path().join(STATE_DIR_NAME).join("tasks.yaml");
        std::fs::write(&tasks_path, "schema_version: 3\ntasks:\n- id: task-1\n").unwrap();
        ensure_state_root(dir.path()).unwrap();
        let text = std::fs::read_to_string(&tasks_path).unwrap();
        assert!(text.contains("task-1"));
    }

    #[test]
    fn archives_incompatible_root() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join(STATE_DIR_NAME);
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("config.yaml"), "schema_version: 1\n").unwrap();
        std::fs::write(base.join("tasks.yaml"), "schema_version: 1\ntasks: []\n").unwrap();

        ensure_state_root(dir.path()).unwrap();

        // Old root archived, fresh root created.
        let archived: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(".foreman_legacy_")
            })
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(
            schema_version_of(&base.join("config.yaml")),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn archives_root_missing_config() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join(STATE_DIR_NAME);
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("tasks.yaml"), "tasks: []\n").unwrap();

        ensure_state_root(dir.path()).unwrap();
        assert!(base.join("config.yaml").exists());
    }
}

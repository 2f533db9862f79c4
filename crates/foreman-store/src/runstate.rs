//! Single-coordinator guard.
//!
//! Per project directory at most one coordinator runs. The guard combines
//! the `.lock` advisory file (held for the check-and-set) with a
//! `run_state.yaml` record carrying pids and freshness, so a crashed
//! coordinator can be detected and displaced while a live one cannot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::FileLock;
use crate::models::now;
use crate::repo::{StoreError, StoreResult};

/// Coordinator occupancy recorded in `run_state.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStateStatus {
    Idle,
    Running,
}

impl Default for RunStateStatus {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub status: RunStateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Why coordinator acquisition failed.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("another coordinator is active (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },

    #[error("coordinator lock is held by another process")]
    LockContended,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Is the given pid alive? `kill(pid, 0)` succeeds or fails with EPERM for
/// live processes.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as i32, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap portable probe; err on the safe side.
    true
}

fn progress_heartbeat(path: &Path) -> Option<DateTime<Utc>> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    let raw = value.get("heartbeat").or_else(|| value.get("timestamp"))?;
    raw.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Handle on `run_state.yaml` plus the coordinator `.lock`.
#[derive(Debug)]
pub struct RunStateFile {
    path: PathBuf,
    lock: FileLock,
}

impl RunStateFile {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("run_state.yaml"),
            lock: FileLock::new(state_root.join(".lock")),
        }
    }

    pub fn load(&self) -> StoreResult<RunState> {
        if !self.path.exists() {
            return Ok(RunState::default());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if text.trim().is_empty() {
            return Ok(RunState::default());
        }
        serde_yaml::from_str(&text).map_err(|e| StoreError::Yaml {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn save(&self, state: &RunState) -> StoreResult<()> {
        let text = serde_yaml::to_string(state).map_err(|e| StoreError::Yaml {
            path: self.path.clone(),
            source: e,
        })?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, text).map_err(|e| StoreError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Decide whether a `running` record belongs to a live coordinator.
    ///
    /// Checks in order: worker pid alive; coordinator pid recorded and
    /// dead; progress-file heartbeat older than grace; finally the record's
    /// own `updated_at` against `max(grace, shift)`.
    fn is_stale(&self, state: &RunState, grace: Duration, shift: Duration) -> bool {
        if let Some(worker_pid) = state.worker_pid {
            if pid_alive(worker_pid) {
                return false;
            }
        }
        if let Some(coordinator_pid) = state.coordinator_pid {
            if !pid_alive(coordinator_pid) {
                return true;
            }
        }
        if let Some(progress) = state.progress_path.as_deref() {
            if let Some(heartbeat) = progress_heartbeat(progress) {
                return now() - heartbeat > grace;
            }
        }
        match state.updated_at {
            Some(updated_at) => now() - updated_at > grace.max(shift),
            None => true,
        }
    }

    /// Take coordinator ownership, displacing only stale state.
    pub fn acquire(
        &self,
        grace: Duration,
        shift: Duration,
    ) -> Result<CoordinatorGuard<'_>, CoordinatorError> {
        let guard = self
            .lock
            .try_acquire()
            .map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?
            .ok_or(CoordinatorError::LockContended)?;

        let state = self.load()?;
        if state.status == RunStateStatus::Running {
            if !self.is_stale(&state, grace, shift) {
                return Err(CoordinatorError::AlreadyRunning {
                    pid: state.coordinator_pid,
                });
            }
            tracing::warn!(
                coordinator_pid = ?state.coordinator_pid,
                worker_pid = ?state.worker_pid,
                "stale coordinator state detected, resetting"
            );
        }

        let fresh = RunState {
            status: RunStateStatus::Running,
            coordinator_pid: Some(std::process::id()),
            worker_pid: None,
            progress_path: None,
            updated_at: Some(now()),
        };
        self.save(&fresh)?;
        drop(guard);

        Ok(CoordinatorGuard { file: self })
    }

    /// Refresh `updated_at` (called from the main loop tick).
    pub fn touch(&self) -> StoreResult<()> {
        let mut state = self.load()?;
        state.updated_at = Some(now());
        self.save(&state)
    }

    /// Record the active worker child pid (or clear it with `None`).
    pub fn set_worker(&self, pid: Option<u32>, progress_path: Option<PathBuf>) -> StoreResult<()> {
        let mut state = self.load()?;
        state.worker_pid = pid;
        state.progress_path = progress_path;
        state.updated_at = Some(now());
        self.save(&state)
    }
}

/// Releases coordinator ownership on drop.
#[derive(Debug)]
pub struct CoordinatorGuard<'a> {
    file: &'a RunStateFile,
}

impl Drop for CoordinatorGuard<'_> {
    fn drop(&mut self) {
        let idle = RunState {
            status: RunStateStatus::Idle,
            coordinator_pid: None,
            worker_pid: None,
            progress_path: None,
            updated_at: Some(now()),
        };
        if let Err(e) = self.file.save(&idle) {
            tracing::warn!(error = %e, "failed to reset run state on shutdown");
        }
    }
}

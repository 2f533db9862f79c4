//! Durable per-project state for the foreman coordinator.
//!
//! Layout (relative to the project root):
//!
//! ```text
//! .foreman/
//!   config.yaml           # orchestrator / workers / defaults / project
//!   tasks.yaml            # {schema_version, tasks: [...]}
//!   runs.yaml
//!   review_cycles.yaml
//!   agents.yaml
//!   quick_actions.yaml
//!   plan_revisions.yaml
//!   plan_refine_jobs.yaml
//!   events.jsonl          # one JSON object per line
//!   run_state.yaml        # single-coordinator guard
//!   worktrees/<task_id>/  # transient
//!   runs/<run_id>/        # prompt.txt, stdout.log, stderr.log, progress.json
//!   <collection>.lock     # sidecar advisory locks
//! ```
//!
//! All collection writes are atomic (tmp + fsync + rename) and serialized
//! by an in-process mutex plus an advisory file lock held across the full
//! read-modify-write span.

pub mod bootstrap;
pub mod config;
pub mod events;
pub mod lock;
pub mod models;
pub mod repo;
pub mod runstate;
pub mod store;

pub use config::Config;
pub use repo::{StoreError, StoreResult};
pub use store::StateStore;

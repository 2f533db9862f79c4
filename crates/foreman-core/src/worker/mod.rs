//! Worker supervision: command construction, subprocess supervision,
//! progress-file parsing, and the HTTP provider.

pub mod command;
pub mod ollama;
pub mod progress;
pub mod supervisor;

pub use command::{build_provider_command, probe_provider, prepare_command, CommandError};
pub use supervisor::{poll_interval, run_worker, WorkerInvocation, WorkerRunResult};

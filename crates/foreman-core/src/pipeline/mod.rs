//! Pipeline templates and step skip-conditions.

pub mod condition;
pub mod registry;

pub use condition::{evaluate, should_skip, CondValue, Namespace};
pub use registry::{PipelineRegistry, PipelineTemplate, StepDef};

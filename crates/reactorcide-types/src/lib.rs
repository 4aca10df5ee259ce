//! Shared data model and error kinds for the reactorcide job runner.
//!
//! This crate has no behavior of its own — every other crate in the
//! workspace depends on it for the types that cross component boundaries
//! (`JobDescriptor`, `PluginContext`, `JobDefinition`, `JobTrigger`, ...) and
//! for the typed errors each component raises.

mod descriptor;
mod error;
mod eval;
mod plugin;
mod validation;

pub use descriptor::{JobDescriptor, SourceType};
pub use error::{
    ConfigError, ContainerError, EvalError, PluginError, ReferenceError, RunnerError,
    SecretStoreError, SourceError,
};
pub use eval::{
    EventContext, EventKind, JobDefinition, JobSpec, JobTrigger, PathsSpec, TriggerCondition,
    TriggersFile, TriggersFileKind, TriggersSpec,
};
pub use plugin::{Phase, PluginContext, PluginRecord};
pub use validation::{ValidationIssue, ValidationResult};

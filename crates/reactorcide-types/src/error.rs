//! Typed error kinds per the error handling design: one enum per component
//! family, each with a short machine-readable variant and a human message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: missing required field(s): {0}")]
    MissingRequired(String),
    #[error("config: invalid env block: {0}")]
    InvalidEnvBlock(String),
    #[error("config: unsafe path outside workspace: {0}")]
    UnsafePath(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source: clone failed: {0}")]
    CloneFailed(String),
    #[error("source: checkout failed: {0}")]
    CheckoutFailed(String),
    #[error("source: copy failed: {0}")]
    CopyFailed(String),
    #[error("source: strategy not implemented: {0}")]
    NotImplemented(String),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin `{plugin}` failed in phase `{phase}`: {message}")]
    Failed {
        plugin: String,
        phase: String,
        message: String,
    },
    #[error("plugin load failed: {0}")]
    LoadFailed(String),
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container: runtime not available on PATH: {0}")]
    RuntimeUnavailable(String),
    #[error("container: image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("container: launch failed: {0}")]
    LaunchFailed(String),
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store: invalid password")]
    InvalidPassword,
    #[error("secret store: malformed blob: {0}")]
    MalformedBlob(String),
    #[error("secret store: invalid path or key: {0}")]
    InvalidPathOrKey(String),
    #[error("secret store: I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("secret reference not found: {path}:{key}")]
    SecretNotFound { path: String, key: String },
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("eval: YAML parse error in {file}: {message}")]
    Parse { file: String, message: String },
    #[error("eval: unknown event type: {0}")]
    UnknownEventType(String),
    #[error("eval: malformed job definition in {file}: {message}")]
    MalformedDefinition { file: String, message: String },
}

/// Top-level union, used where callers want to match across kinds without
/// threading five separate `Result` types through the orchestrator.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("validation failed with {0} error(s)")]
    Validation(usize),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl RunnerError {
    /// Exit-code mapping used by the CLI: propagate the child's exit code
    /// when one is available, else fall back to 1 for configuration-class
    /// errors.
    pub fn exit_code(&self, child_exit_code: Option<i32>) -> i32 {
        child_exit_code.unwrap_or(1)
    }
}

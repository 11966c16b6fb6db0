//! Error taxonomy for the dispatch scheduler.
//!
//! Validation and capacity errors surface synchronously from
//! [`Scheduler::enqueue`](crate::scheduler::Scheduler::enqueue). Engine errors
//! are raised once per batch and copied onto every handle of that batch, which
//! is why [`DispatchError`] is `Clone`. Configuration errors only ever come out
//! of construction.

use std::path::PathBuf;

/// Errors surfaced to callers, either from `enqueue` or through a
/// [`CompletionHandle`](crate::scheduler::CompletionHandle).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("queue for model '{model}' is full ({depth} queued, max {max})")]
    Capacity {
        model: String,
        depth: usize,
        max: usize,
    },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("request was cancelled before dispatch")]
    Cancelled,

    #[error("scheduler is shutting down")]
    Shutdown,

    #[error("request was dropped without a result")]
    Abandoned,
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Engine failures are the only errors that come back from a batch call.
    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}

/// Failure of a single `batch_infer` call. Applied to the whole batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("model '{model}' is not available on this engine")]
    Unavailable { model: String },

    #[error("inference failed: {0}")]
    Failed(String),

    #[error("engine returned {actual} outputs for {expected} prompts")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("engine task panicked: {0}")]
    Panicked(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<hyper::Error> for EngineError {
    fn from(e: hyper::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<hyper::http::Error> for EngineError {
    fn from(e: hyper::http::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(format!("malformed engine payload: {e}"))
    }
}

/// Invalid configuration. Fatal at startup, never produced per request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("failed to parse JSON config '{origin}': {message}")]
    ParseJson { origin: String, message: String },

    #[error("failed to parse YAML config '{origin}': {message}")]
    ParseYaml { origin: String, message: String },

    #[error("gpu_ids must contain at least one device")]
    EmptyGpuIds,

    #[error("gpu id {0} is listed more than once")]
    DuplicateGpuId(u32),

    #[error("unknown load balancing strategy '{0}' (expected round_robin, least_loaded or adaptive)")]
    InvalidStrategy(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("scheduler must be constructed inside a tokio runtime")]
    NoRuntime,
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

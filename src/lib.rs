#![warn(clippy::cast_lossless)]
//! Dynamic batching and load-balanced dispatch of text-generation requests.
//!
//! Requests enter through [`Scheduler::enqueue`], wait in a per-model queue,
//! and are handed to an [`InferenceEngine`] in batches by one background
//! worker per model. A [`LoadBalancer`] assigns every request a device and
//! keeps per-device load current.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod scheduler;

pub use config::{LoadBalancingStrategy, ParallelConfig, ParallelismStrategy, SchedulerConfig};
pub use engine::{BatchInput, DeviceMemory, EngineBackend, InferenceEngine};
pub use error::{ConfigError, DispatchError, EngineError};
pub use gpu::{GpuManager, LoadBalancer, LoadBalancerStats};
pub use scheduler::{
    ChatMessage, CompletionHandle, CompletionResult, GenerationRequest, ModelKey, Payload,
    Scheduler, SchedulerStats,
};

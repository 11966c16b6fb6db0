//! Inference engine interface consumed by the batch workers.
//!
//! The scheduler only ever talks to [`InferenceEngine`]. Concrete backends form
//! a closed set wrapped by [`EngineBackend`]:
//!
//! - [`LocalEngine`]: in-process generators, run on tokio's blocking pool
//! - [`RemoteEngine`]: an Ollama-compatible HTTP service
//!
//! Test code implements the trait directly with mocks.

use crate::error::EngineError;
use crate::scheduler::ModelKey;
use async_trait::async_trait;
use serde::Serialize;

pub mod local;
pub mod remote;

pub use local::{LocalEngine, TextGenerator};
pub use remote::{RemoteEngine, RemoteEngineConfig};

/// Memory usage reported by device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub allocated_bytes: u64,
    pub total_bytes: u64,
}

impl DeviceMemory {
    pub fn new(allocated_bytes: u64, total_bytes: u64) -> Self {
        Self {
            allocated_bytes,
            total_bytes,
        }
    }

    /// allocated / total, clamped to [0, 1]. Zero-sized devices report 0.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.allocated_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
        }
    }
}

/// One batched call into an engine.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub model: ModelKey,
    /// Device the batch should run on, if the engine can steer placement
    pub device: Option<u32>,
    /// Largest `max_tokens` of any request in the batch
    pub max_tokens: usize,
    pub temperature: f32,
    pub prompts: Vec<String>,
}

#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Generate one output per prompt, in prompt order.
    ///
    /// Any failure fails the whole call.
    async fn batch_infer(&self, input: BatchInput) -> Result<Vec<String>, EngineError>;

    /// Allocated and total memory of a device, if the engine can see it.
    fn device_stats(&self, gpu_id: u32) -> Option<DeviceMemory>;

    fn name(&self) -> &str;
}

/// Closed set of production backends behind one interface.
pub enum EngineBackend {
    Local(LocalEngine),
    Remote(RemoteEngine),
}

#[async_trait]
impl InferenceEngine for EngineBackend {
    async fn batch_infer(&self, input: BatchInput) -> Result<Vec<String>, EngineError> {
        match self {
            EngineBackend::Local(engine) => engine.batch_infer(input).await,
            EngineBackend::Remote(engine) => engine.batch_infer(input).await,
        }
    }

    fn device_stats(&self, gpu_id: u32) -> Option<DeviceMemory> {
        match self {
            EngineBackend::Local(engine) => engine.device_stats(gpu_id),
            EngineBackend::Remote(engine) => engine.device_stats(gpu_id),
        }
    }

    fn name(&self) -> &str {
        match self {
            EngineBackend::Local(engine) => engine.name(),
            EngineBackend::Remote(engine) => engine.name(),
        }
    }
}

impl From<LocalEngine> for EngineBackend {
    fn from(engine: LocalEngine) -> Self {
        EngineBackend::Local(engine)
    }
}

impl From<RemoteEngine> for EngineBackend {
    fn from(engine: RemoteEngine) -> Self {
        EngineBackend::Remote(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fraction() {
        assert_eq!(DeviceMemory::new(0, 0).fraction(), 0.0);
        assert_eq!(DeviceMemory::new(512, 1024).fraction(), 0.5);
        assert_eq!(DeviceMemory::new(4096, 1024).fraction(), 1.0);
    }
}

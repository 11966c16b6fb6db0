//! In-process engine backed by registered generators.

use super::{BatchInput, DeviceMemory, InferenceEngine};
use crate::error::EngineError;
use crate::scheduler::ModelKey;
use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Synchronous, possibly device-bound text generation for one model.
///
/// Called from tokio's blocking pool, never from a scheduler task.
pub trait TextGenerator: Send + Sync + 'static {
    fn generate(&self, input: &BatchInput) -> Result<Vec<String>, EngineError>;
}

impl<F> TextGenerator for F
where
    F: Fn(&BatchInput) -> Result<Vec<String>, EngineError> + Send + Sync + 'static,
{
    fn generate(&self, input: &BatchInput) -> Result<Vec<String>, EngineError> {
        self(input)
    }
}

/// Engine that runs registered generators in this process.
pub struct LocalEngine {
    models: RwLock<AHashMap<ModelKey, Arc<dyn TextGenerator>>>,
    memory: RwLock<AHashMap<u32, DeviceMemory>>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(AHashMap::new()),
            memory: RwLock::new(AHashMap::new()),
        }
    }

    #[must_use]
    pub fn with_model(self, key: ModelKey, generator: impl TextGenerator) -> Self {
        self.register(key, generator);
        self
    }

    /// Register or replace the generator serving `key`.
    pub fn register(&self, key: ModelKey, generator: impl TextGenerator) {
        debug!(model = %key, "registering local generator");
        self.models.write().insert(key, Arc::new(generator));
    }

    pub fn unregister(&self, key: &ModelKey) -> bool {
        self.models.write().remove(key).is_some()
    }

    pub fn has_model(&self, key: &ModelKey) -> bool {
        self.models.read().contains_key(key)
    }

    /// Record the memory picture of a device for `device_stats`.
    pub fn set_device_memory(&self, gpu_id: u32, memory: DeviceMemory) {
        self.memory.write().insert(gpu_id, memory);
    }
}

#[async_trait]
impl InferenceEngine for LocalEngine {
    async fn batch_infer(&self, input: BatchInput) -> Result<Vec<String>, EngineError> {
        let generator = self
            .models
            .read()
            .get(&input.model)
            .cloned()
            .ok_or_else(|| EngineError::Unavailable {
                model: input.model.to_string(),
            })?;

        tokio::task::spawn_blocking(move || generator.generate(&input))
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))?
    }

    fn device_stats(&self, gpu_id: u32) -> Option<DeviceMemory> {
        self.memory.read().get(&gpu_id).copied()
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(model: &str, prompts: &[&str]) -> BatchInput {
        BatchInput {
            model: ModelKey::new(model),
            device: Some(0),
            max_tokens: 16,
            temperature: 0.0,
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_runs_registered_generator() {
        let engine = LocalEngine::new().with_model(
            ModelKey::new("upper"),
            |input: &BatchInput| -> Result<Vec<String>, EngineError> {
                Ok(input.prompts.iter().map(|p| p.to_uppercase()).collect())
            },
        );
        let out = engine.batch_infer(input("upper", &["a", "b"])).await.unwrap();
        assert_eq!(out, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_unknown_model_is_unavailable() {
        let engine = LocalEngine::new();
        let err = engine.batch_infer(input("missing", &["a"])).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Unavailable {
                model: "missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_generator_panic_becomes_error() {
        let engine = LocalEngine::new().with_model(
            ModelKey::new("boom"),
            |_: &BatchInput| -> Result<Vec<String>, EngineError> { panic!("kernel fault") },
        );
        let err = engine.batch_infer(input("boom", &["a"])).await.unwrap_err();
        assert!(matches!(err, EngineError::Panicked(_)));
    }

    #[test]
    fn test_device_stats() {
        let engine = LocalEngine::new();
        assert!(engine.device_stats(0).is_none());
        engine.set_device_memory(0, DeviceMemory::new(3, 10));
        assert_eq!(engine.device_stats(0), Some(DeviceMemory::new(3, 10)));
        assert!(!engine.has_model(&ModelKey::new("x")));
    }
}

//! Mock inference engine for scheduler tests.

use async_trait::async_trait;
use llm_dispatch::{BatchInput, DeviceMemory, EngineError, InferenceEngine};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Engine that echoes prompts as `out:<prompt>` and records every call.
pub struct MockEngine {
    /// Simulated processing delay for every call
    pub delay_ms: u64,
    /// Per-model delay, overriding `delay_ms`
    pub model_delays: HashMap<String, u64>,
    /// Fail every call
    pub should_fail: bool,
    /// 0-based call indices that fail
    pub fail_calls: HashSet<usize>,
    /// 0-based call indices that panic
    pub panic_calls: HashSet<usize>,
    pub unavailable: HashSet<String>,
    memory: HashMap<u32, DeviceMemory>,
    calls: Mutex<Vec<BatchInput>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            delay_ms: 0,
            model_delays: HashMap::new(),
            should_fail: false,
            fail_calls: HashSet::new(),
            panic_calls: HashSet::new(),
            unavailable: HashSet::new(),
            memory: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_model_delay(mut self, model: &str, delay_ms: u64) -> Self {
        self.model_delays.insert(model.to_string(), delay_ms);
        self
    }

    pub fn with_failures(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn with_failure_on_call(mut self, call: usize) -> Self {
        self.fail_calls.insert(call);
        self
    }

    pub fn with_panic_on_call(mut self, call: usize) -> Self {
        self.panic_calls.insert(call);
        self
    }

    pub fn with_unavailable(mut self, model: &str) -> Self {
        self.unavailable.insert(model.to_string());
        self
    }

    pub fn with_memory(mut self, gpu_id: u32, allocated: u64, total: u64) -> Self {
        self.memory.insert(gpu_id, DeviceMemory::new(allocated, total));
        self
    }

    pub fn calls(&self) -> Vec<BatchInput> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Prompts of every call, flattened in call order.
    pub fn all_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .flat_map(|c| c.prompts.clone())
            .collect()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn batch_infer(&self, input: BatchInput) -> Result<Vec<String>, EngineError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(input.clone());
            calls.len() - 1
        };

        let delay = self
            .model_delays
            .get(&input.model.name)
            .copied()
            .unwrap_or(self.delay_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.panic_calls.contains(&call) {
            panic!("mock engine panic on call {call}");
        }
        if self.unavailable.contains(&input.model.name) {
            return Err(EngineError::Unavailable {
                model: input.model.to_string(),
            });
        }
        if self.should_fail || self.fail_calls.contains(&call) {
            return Err(EngineError::failed("Mock engine error"));
        }
        Ok(input.prompts.iter().map(|p| format!("out:{p}")).collect())
    }

    fn device_stats(&self, gpu_id: u32) -> Option<DeviceMemory> {
        self.memory.get(&gpu_id).copied()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

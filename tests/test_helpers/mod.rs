//! Shared helpers for integration tests.

pub mod mock_engine;

pub use mock_engine::MockEngine;

use llm_dispatch::{CompletionHandle, CompletionResult, SchedulerConfig};
use std::time::Duration;

/// Upper bound for any single wait in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_config(batch_size: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_batch_size(batch_size)
        .with_batch_interval(Duration::from_millis(10))
}

pub async fn wait_all(handles: &[CompletionHandle]) -> Vec<CompletionResult> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = tokio::time::timeout(TEST_TIMEOUT, handle.wait())
            .await
            .expect("handle did not resolve in time");
        results.push(result);
    }
    results
}

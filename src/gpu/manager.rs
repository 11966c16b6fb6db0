//! Live view of the configured devices and their load/memory metrics.

use crate::engine::InferenceEngine;
use crate::error::ConfigError;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Queue depth at which a device counts as fully loaded.
pub const FULL_LOAD_QUEUE_DEPTH: f64 = 10.0;

/// Per-device state. Every field is its own atomic so readers never contend
/// on a shared lock.
#[derive(Debug)]
struct GpuState {
    gpu_id: u32,
    /// Requests assigned to this device and not yet resolved
    queue_depth: AtomicUsize,
    /// f64 bits, 0.0..=1.0
    load: AtomicU64,
    /// f64 bits, allocated / total
    memory_fraction: AtomicU64,
    /// Unix millis of the last `update_metrics`, 0 if never
    last_updated_ms: AtomicI64,
}

impl GpuState {
    fn new(gpu_id: u32) -> Self {
        Self {
            gpu_id,
            queue_depth: AtomicUsize::new(0),
            load: AtomicU64::new(0f64.to_bits()),
            memory_fraction: AtomicU64::new(0f64.to_bits()),
            last_updated_ms: AtomicI64::new(0),
        }
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.load.load(Ordering::Acquire))
    }

    fn memory_fraction(&self) -> f64 {
        f64::from_bits(self.memory_fraction.load(Ordering::Acquire))
    }
}

/// Point-in-time copy of one device's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSnapshot {
    pub gpu_id: u32,
    pub queue_depth: usize,
    pub load: f64,
    pub memory_fraction: f64,
    pub last_updated_ms: i64,
}

pub struct GpuManager {
    states: Vec<GpuState>,
    index: AHashMap<u32, usize>,
    engine: Arc<dyn InferenceEngine>,
}

impl GpuManager {
    /// Build a manager for `gpu_ids`, in the given order.
    ///
    /// An empty device list is a configuration error.
    pub fn new(gpu_ids: &[u32], engine: Arc<dyn InferenceEngine>) -> Result<Self, ConfigError> {
        if gpu_ids.is_empty() {
            return Err(ConfigError::EmptyGpuIds);
        }
        let mut index = AHashMap::with_capacity(gpu_ids.len());
        let mut states = Vec::with_capacity(gpu_ids.len());
        for (i, id) in gpu_ids.iter().enumerate() {
            if index.insert(*id, i).is_some() {
                return Err(ConfigError::DuplicateGpuId(*id));
            }
            states.push(GpuState::new(*id));
        }
        info!(
            "GpuManager initialized with {} devices: {:?} (engine: {})",
            gpu_ids.len(),
            gpu_ids,
            engine.name()
        );
        Ok(Self {
            states,
            index,
            engine,
        })
    }

    /// Configured ids in configuration order.
    pub fn gpu_ids(&self) -> Vec<u32> {
        self.states.iter().map(|s| s.gpu_id).collect()
    }

    pub fn num_devices(&self) -> usize {
        self.states.len()
    }

    pub fn contains(&self, gpu_id: u32) -> bool {
        self.index.contains_key(&gpu_id)
    }

    fn state(&self, gpu_id: u32) -> Option<&GpuState> {
        self.index.get(&gpu_id).map(|&i| &self.states[i])
    }

    /// Recompute load and memory for every device.
    ///
    /// `load = min(1, queue_depth / 10)`, `memory = allocated / total` from the
    /// engine; devices the engine cannot see report 0.0 memory.
    pub fn update_metrics(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        for state in &self.states {
            let depth = state.queue_depth.load(Ordering::Acquire);
            let load = (depth as f64 / FULL_LOAD_QUEUE_DEPTH).min(1.0);
            let memory = self
                .engine
                .device_stats(state.gpu_id)
                .map(|m| m.fraction())
                .unwrap_or(0.0);
            state.load.store(load.to_bits(), Ordering::Release);
            state
                .memory_fraction
                .store(memory.to_bits(), Ordering::Release);
            state.last_updated_ms.store(now, Ordering::Release);
        }
    }

    /// Last computed load, or 0.0 for an unknown id.
    pub fn get_load(&self, gpu_id: u32) -> f64 {
        self.state(gpu_id).map(GpuState::load).unwrap_or(0.0)
    }

    /// Last computed memory fraction, or 0.0 for an unknown id.
    pub fn get_memory(&self, gpu_id: u32) -> f64 {
        self.state(gpu_id)
            .map(GpuState::memory_fraction)
            .unwrap_or(0.0)
    }

    pub fn queue_depth(&self, gpu_id: u32) -> usize {
        self.state(gpu_id)
            .map(|s| s.queue_depth.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Count a newly assigned request against a device.
    pub fn record_enqueued(&self, gpu_id: u32) {
        if let Some(state) = self.state(gpu_id) {
            state.queue_depth.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release a request once its handle has been resolved.
    pub fn record_completed(&self, gpu_id: u32) {
        if let Some(state) = self.state(gpu_id) {
            // Saturate instead of wrapping if completions ever outnumber assignments.
            let _ = state
                .queue_depth
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                    Some(d.saturating_sub(1))
                });
        }
    }

    /// (gpu_id, load, memory_fraction) for every device, in configuration order.
    pub(crate) fn metrics(&self) -> Vec<(u32, f64, f64)> {
        self.states
            .iter()
            .map(|s| (s.gpu_id, s.load(), s.memory_fraction()))
            .collect()
    }

    pub fn loads(&self) -> BTreeMap<u32, f64> {
        self.states.iter().map(|s| (s.gpu_id, s.load())).collect()
    }

    pub fn memory(&self) -> BTreeMap<u32, f64> {
        self.states
            .iter()
            .map(|s| (s.gpu_id, s.memory_fraction()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<GpuSnapshot> {
        self.states
            .iter()
            .map(|s| GpuSnapshot {
                gpu_id: s.gpu_id,
                queue_depth: s.queue_depth.load(Ordering::Acquire),
                load: s.load(),
                memory_fraction: s.memory_fraction(),
                last_updated_ms: s.last_updated_ms.load(Ordering::Acquire),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeviceMemory, LocalEngine};

    fn manager(ids: &[u32]) -> (GpuManager, Arc<LocalEngine>) {
        let engine = Arc::new(LocalEngine::new());
        let mgr = GpuManager::new(ids, engine.clone()).unwrap();
        (mgr, engine)
    }

    #[test]
    fn test_empty_device_set_is_config_error() {
        let engine = Arc::new(LocalEngine::new());
        assert!(matches!(
            GpuManager::new(&[], engine.clone()),
            Err(ConfigError::EmptyGpuIds)
        ));
        assert!(matches!(
            GpuManager::new(&[1, 1], engine),
            Err(ConfigError::DuplicateGpuId(1))
        ));
    }

    #[test]
    fn test_load_follows_queue_depth() {
        let (mgr, _) = manager(&[0, 1]);
        for _ in 0..3 {
            mgr.record_enqueued(0);
        }
        for _ in 0..25 {
            mgr.record_enqueued(1);
        }
        // Not visible until metrics are refreshed.
        assert_eq!(mgr.get_load(0), 0.0);
        mgr.update_metrics();
        assert!((mgr.get_load(0) - 0.3).abs() < 1e-12);
        assert_eq!(mgr.get_load(1), 1.0);

        mgr.record_completed(0);
        mgr.update_metrics();
        assert!((mgr.get_load(0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_memory_from_engine() {
        let (mgr, engine) = manager(&[0, 1]);
        engine.set_device_memory(1, DeviceMemory::new(9, 10));
        mgr.update_metrics();
        assert_eq!(mgr.get_memory(0), 0.0);
        assert!((mgr.get_memory(1) - 0.9).abs() < 1e-12);
        assert!(mgr.snapshot().iter().all(|s| s.last_updated_ms > 0));
    }

    #[test]
    fn test_unknown_id_reads_zero() {
        let (mgr, _) = manager(&[0]);
        mgr.record_enqueued(7);
        mgr.update_metrics();
        assert_eq!(mgr.get_load(7), 0.0);
        assert_eq!(mgr.get_memory(7), 0.0);
        assert_eq!(mgr.queue_depth(7), 0);
    }

    #[test]
    fn test_completed_saturates_at_zero() {
        let (mgr, _) = manager(&[0]);
        mgr.record_completed(0);
        assert_eq!(mgr.queue_depth(0), 0);
    }
}

//! Strategy-driven device selection on top of [`GpuManager`].

use super::manager::GpuManager;
use crate::config::LoadBalancingStrategy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOAD_WEIGHT: f64 = 0.7;
const MEMORY_WEIGHT: f64 = 0.3;
const HISTORY_CAPACITY: usize = 1024;
/// Relative deviation from an even split above which we warn.
const IMBALANCE_THRESHOLD: f64 = 0.2;

/// One recorded device assignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub request_id: String,
    pub gpu_id: u32,
    pub assigned_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub total_requests: u64,
    pub per_gpu_assignments: BTreeMap<u32, u64>,
    pub per_gpu_load: BTreeMap<u32, f64>,
    pub per_gpu_memory: BTreeMap<u32, f64>,
}

/// How far the assignment counts drift from an even split.
#[derive(Debug, Clone, Serialize)]
pub struct ImbalanceReport {
    pub ideal_per_gpu: f64,
    /// |actual - ideal| / ideal per device
    pub imbalances: BTreeMap<u32, f64>,
    pub max_imbalance: f64,
}

impl ImbalanceReport {
    pub fn is_balanced(&self) -> bool {
        self.max_imbalance <= IMBALANCE_THRESHOLD
    }
}

pub struct LoadBalancer {
    manager: Arc<GpuManager>,
    strategy: LoadBalancingStrategy,
    gpu_ids: Vec<u32>,
    cursor: AtomicUsize,
    total_requests: AtomicU64,
    /// Aligned with `gpu_ids`
    assignments: Vec<AtomicU64>,
    history: Mutex<VecDeque<Assignment>>,
}

impl LoadBalancer {
    pub fn new(manager: Arc<GpuManager>, strategy: LoadBalancingStrategy) -> Self {
        let gpu_ids = manager.gpu_ids();
        let assignments = gpu_ids.iter().map(|_| AtomicU64::new(0)).collect();
        info!("Load balancer initialized (strategy: {strategy}, devices: {gpu_ids:?})");
        Self {
            manager,
            strategy,
            gpu_ids,
            cursor: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            assignments,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn manager(&self) -> &Arc<GpuManager> {
        &self.manager
    }

    /// Pick a device for a request and account for it.
    ///
    /// Refreshes metrics first so the decision never uses stale load. The
    /// chosen device's queue depth is incremented; callers must release it
    /// with [`GpuManager::record_completed`] once the request resolves.
    pub fn assign_request(&self, request_id: &str) -> u32 {
        self.manager.update_metrics();
        let (slot, gpu_id) = self.select();

        self.manager.record_enqueued(gpu_id);
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.assignments[slot].fetch_add(1, Ordering::AcqRel);

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(Assignment {
                request_id: request_id.to_string(),
                gpu_id,
                assigned_at_ms: chrono::Utc::now().timestamp_millis(),
            });
        }

        debug!(request_id, gpu_id, strategy = %self.strategy, "request assigned");
        gpu_id
    }

    /// Returns (slot in `gpu_ids`, gpu id). The device list is never empty.
    fn select(&self) -> (usize, u32) {
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let slot = self.cursor.fetch_add(1, Ordering::AcqRel) % self.gpu_ids.len();
                (slot, self.gpu_ids[slot])
            }
            LoadBalancingStrategy::LeastLoaded => {
                self.pick_min(|load, _memory| load)
            }
            LoadBalancingStrategy::Adaptive => {
                self.pick_min(|load, memory| adaptive_score(load, memory))
            }
        }
    }

    /// Lowest score wins; equal scores go to the smaller gpu id.
    fn pick_min(&self, score: impl Fn(f64, f64) -> f64) -> (usize, u32) {
        self.manager
            .metrics()
            .into_iter()
            .enumerate()
            .map(|(slot, (id, load, memory))| (slot, id, score(load, memory)))
            .min_by(|a, b| a.2.total_cmp(&b.2).then(a.1.cmp(&b.1)))
            .map(|(slot, id, _)| (slot, id))
            .unwrap_or((0, self.gpu_ids[0]))
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            strategy: self.strategy,
            total_requests: self.total_requests(),
            per_gpu_assignments: self
                .gpu_ids
                .iter()
                .zip(&self.assignments)
                .map(|(id, count)| (*id, count.load(Ordering::Acquire)))
                .collect(),
            per_gpu_load: self.manager.loads(),
            per_gpu_memory: self.manager.memory(),
        }
    }

    /// Most recent assignments, oldest first.
    pub fn recent_assignments(&self, limit: usize) -> Vec<Assignment> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Compare assignment counts with an even split. `None` before any request.
    pub fn imbalance_report(&self) -> Option<ImbalanceReport> {
        let total = self.total_requests();
        if total == 0 {
            return None;
        }
        let ideal = total as f64 / self.gpu_ids.len() as f64;
        let imbalances: BTreeMap<u32, f64> = self
            .gpu_ids
            .iter()
            .zip(&self.assignments)
            .map(|(id, count)| {
                let actual = count.load(Ordering::Acquire) as f64;
                (*id, (actual - ideal).abs() / ideal)
            })
            .collect();
        let max_imbalance = imbalances.values().copied().fold(0.0, f64::max);
        let report = ImbalanceReport {
            ideal_per_gpu: ideal,
            imbalances,
            max_imbalance,
        };
        if !report.is_balanced() {
            warn!(
                "Load imbalance detected: {:?} (consider a different load balancing strategy)",
                report.imbalances
            );
        }
        Some(report)
    }
}

pub fn adaptive_score(load: f64, memory_fraction: f64) -> f64 {
    LOAD_WEIGHT * load + MEMORY_WEIGHT * memory_fraction
}

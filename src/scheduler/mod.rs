//! Request admission, per-model batching and dispatch.
//!
//! [`Scheduler`] owns one [`RequestQueue`] and one batch worker per
//! [`ModelKey`], created on first use. Callers get a [`CompletionHandle`] back
//! from [`Scheduler::enqueue`] immediately; the worker for that key drains the
//! queue every `batch_interval`, hands the batch to the inference engine, and
//! resolves every handle in arrival order.

pub mod handle;
pub mod queue;
pub mod request;
pub mod worker;

pub use handle::{CompletionHandle, CompletionResult};
pub use queue::RequestQueue;
pub use request::{ChatMessage, GenerationRequest, ModelKey, Payload, Request};
pub use worker::{WorkerCountersSnapshot, WorkerPhase};

use crate::config::{LoadBalancingStrategy, SchedulerConfig};
use crate::engine::InferenceEngine;
use crate::error::{ConfigError, DispatchError, Result};
use crate::gpu::{
    GpuManager, GpuSnapshot, ImbalanceReport, LoadBalancer, LoadBalancerStats, ParallelLayout,
};
use ahash::AHashMap;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker::{resolve_shutdown, BatchWorker, WorkerCounters, WorkerStatus};

struct WorkerEntry {
    queue: Arc<RequestQueue>,
    status: Arc<WorkerStatus>,
    task: Option<JoinHandle<()>>,
}

/// Configuration echo included in [`SchedulerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub gpu_ids: Vec<u32>,
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub batch_size: usize,
    pub batch_interval_seconds: f64,
    pub max_queue_depth: Option<usize>,
    pub parallel: ParallelLayout,
    pub memory_fraction: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub model: String,
    pub phase: WorkerPhase,
    pub queue_depth: usize,
}

/// Point-in-time view of the whole scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub engine: String,
    pub config: ConfigSummary,
    pub load_balancer: LoadBalancerStats,
    pub devices: Vec<GpuSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
    pub workers_spawned: u64,
    pub counters: WorkerCountersSnapshot,
    pub shutting_down: bool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<dyn InferenceEngine>,
    gpus: Arc<GpuManager>,
    balancer: LoadBalancer,
    runtime: Handle,
    registry: RwLock<AHashMap<ModelKey, WorkerEntry>>,
    counters: Arc<WorkerCounters>,
    workers_spawned: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl Scheduler {
    /// Validate `config` and build the device view.
    ///
    /// Must be called from inside a tokio runtime; workers are spawned onto it.
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<dyn InferenceEngine>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let gpus = Arc::new(GpuManager::new(&config.gpu_ids, engine.clone())?);
        let balancer = LoadBalancer::new(gpus.clone(), config.load_balancing_strategy);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "🏗️ SCHEDULER: created - engine={}, batch_size={}, interval={:?}, max_queue_depth={:?}",
            engine.name(),
            config.batch_size,
            config.batch_interval(),
            config.max_queue_depth
        );

        Ok(Self {
            config,
            engine,
            gpus,
            balancer,
            runtime,
            registry: RwLock::new(AHashMap::new()),
            counters: Arc::new(WorkerCounters::default()),
            workers_spawned: AtomicU64::new(0),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn gpu_manager(&self) -> &Arc<GpuManager> {
        &self.gpus
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Admit a request for `model_key`.
    ///
    /// Never blocks. Fails synchronously with a validation, capacity or
    /// shutdown error; otherwise the request is queued and the returned handle
    /// resolves once its batch has run.
    pub fn enqueue(&self, model_key: ModelKey, request: GenerationRequest) -> Result<CompletionHandle> {
        model_key.validate()?;
        request.validate()?;

        {
            let registry = self.registry.read();
            if let Some(entry) = registry.get(&model_key) {
                return self.admit(&entry.queue, model_key, request);
            }
        }

        let mut registry = self.registry.write();
        let queue = self.get_or_spawn_worker(&mut registry, &model_key)?;
        self.admit(&queue, model_key, request)
    }

    /// Start the worker for `model_key` if it is not running yet.
    ///
    /// Returns true if this call created it. Concurrent callers for the same
    /// key create exactly one worker.
    pub fn ensure_worker(&self, model_key: &ModelKey) -> Result<bool> {
        model_key.validate()?;
        if self.registry.read().contains_key(model_key) {
            return Ok(false);
        }
        let mut registry = self.registry.write();
        let existed = registry.contains_key(model_key);
        self.get_or_spawn_worker(&mut registry, model_key)?;
        Ok(!existed)
    }

    fn get_or_spawn_worker(
        &self,
        registry: &mut AHashMap<ModelKey, WorkerEntry>,
        model_key: &ModelKey,
    ) -> Result<Arc<RequestQueue>> {
        if let Some(entry) = registry.get(model_key) {
            return Ok(entry.queue.clone());
        }
        // Checked under the write lock so shutdown cannot miss a new worker.
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }

        let queue = Arc::new(RequestQueue::new(self.config.max_queue_depth));
        let status = Arc::new(WorkerStatus::new());
        let worker = BatchWorker {
            model_key: model_key.clone(),
            queue: queue.clone(),
            engine: self.engine.clone(),
            gpus: self.gpus.clone(),
            batch_size: self.config.batch_size,
            interval: self.config.batch_interval(),
            status: status.clone(),
            counters: self.counters.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let task = self.runtime.spawn(worker.run());
        self.workers_spawned.fetch_add(1, Ordering::AcqRel);
        info!("🧵 SCHEDULER: spawned batch worker - model={}", model_key);

        registry.insert(
            model_key.clone(),
            WorkerEntry {
                queue: queue.clone(),
                status,
                task: Some(task),
            },
        );
        Ok(queue)
    }

    /// Assign a device and push. Called with the registry lock held so that
    /// shutdown, which takes the write lock, sees every admitted request.
    ///
    /// The capacity check, the assignment and the push share the queue lock,
    /// so a rejected request never shows up in the balancer's counters.
    fn admit(
        &self,
        queue: &RequestQueue,
        model_key: ModelKey,
        request: GenerationRequest,
    ) -> Result<CompletionHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }
        let pushed = queue.push_with(&model_key, || {
            let request_id = uuid::Uuid::new_v4().to_string();
            let gpu_id = self.balancer.assign_request(&request_id);
            Request::with_id(request_id, model_key.clone(), request, gpu_id)
        });
        if let Err(DispatchError::Capacity { depth, max, .. }) = &pushed {
            warn!(model = %model_key, depth, max, "queue full, rejecting request");
        }
        pushed
    }

    /// Number of pending requests per model key.
    pub fn queue_depths(&self) -> BTreeMap<ModelKey, usize> {
        self.registry
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.queue.len()))
            .collect()
    }

    /// Model keys that have a batch worker, sorted.
    pub fn active_worker_keys(&self) -> Vec<ModelKey> {
        self.registry.read().keys().cloned().sorted().collect()
    }

    /// Number of workers ever spawned. Never exceeds the number of distinct keys.
    pub fn workers_spawned(&self) -> u64 {
        self.workers_spawned.load(Ordering::Acquire)
    }

    /// Load balancer counters together with freshly computed device metrics.
    pub fn load_balancer_stats(&self) -> LoadBalancerStats {
        self.gpus.update_metrics();
        self.balancer.stats()
    }

    pub fn imbalance_report(&self) -> Option<ImbalanceReport> {
        self.balancer.imbalance_report()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let load_balancer = self.load_balancer_stats();
        let workers = self
            .registry
            .read()
            .iter()
            .map(|(key, entry)| WorkerSnapshot {
                model: key.to_string(),
                phase: entry.status.phase(),
                queue_depth: entry.queue.len(),
            })
            .sorted_by(|a, b| a.model.cmp(&b.model))
            .collect();

        SchedulerStats {
            engine: self.engine.name().to_string(),
            config: ConfigSummary {
                gpu_ids: self.config.gpu_ids.clone(),
                load_balancing_strategy: self.config.load_balancing_strategy,
                batch_size: self.config.batch_size,
                batch_interval_seconds: self.config.batch_interval_seconds,
                max_queue_depth: self.config.max_queue_depth,
                parallel: ParallelLayout::describe(&self.config.parallel, &self.config.gpu_ids),
                memory_fraction: self.config.parallel.memory_fraction,
            },
            load_balancer,
            devices: self.gpus.snapshot(),
            workers,
            workers_spawned: self.workers_spawned(),
            counters: self.counters.snapshot(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stop every worker and resolve everything still queued with
    /// [`DispatchError::Shutdown`].
    ///
    /// Batches already handed to the engine finish normally. Subsequent
    /// `enqueue` calls fail with `Shutdown`. Calling this twice is a no-op.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.write();
            if self.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shutdown_tx.send_replace(true);
            registry
                .values_mut()
                .filter_map(|entry| entry.task.take())
                .collect()
        };
        info!("🛑 SCHEDULER: shutting down {} workers", tasks.len());

        for task in tasks {
            if let Err(e) = task.await {
                warn!("batch worker ended abnormally: {e}");
            }
        }

        // Workers drain their own queues on exit; this catches anything that
        // remains if a worker died early.
        let registry = self.registry.read();
        for entry in registry.values() {
            resolve_shutdown(entry.queue.drain(), &self.gpus, &self.counters);
        }
        info!("🛑 SCHEDULER: shutdown complete");
    }
}

//! Background batch loop, one per model key.

use super::queue::RequestQueue;
use super::request::{ModelKey, Request};
use crate::engine::{BatchInput, InferenceEngine};
use crate::error::{DispatchError, EngineError};
use crate::gpu::GpuManager;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a batch worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Draining,
    Dispatching,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerPhase::Idle,
            1 => WorkerPhase::Draining,
            2 => WorkerPhase::Dispatching,
            _ => WorkerPhase::Stopped,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorkerStatus {
    phase: AtomicU8,
}

impl WorkerStatus {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(WorkerPhase::Idle as u8),
        }
    }

    pub(crate) fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Counters shared by every worker of one scheduler.
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    batches_dispatched: AtomicU64,
    batches_failed: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    requests_shutdown: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCountersSnapshot {
    pub batches_dispatched: u64,
    pub batches_failed: u64,
    /// Requests resolved with a generated result
    pub requests_completed: u64,
    /// Requests resolved with an engine error
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    /// Requests resolved with `Shutdown` while still queued
    pub requests_shutdown: u64,
}

impl WorkerCounters {
    pub(crate) fn snapshot(&self) -> WorkerCountersSnapshot {
        WorkerCountersSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Acquire),
            batches_failed: self.batches_failed.load(Ordering::Acquire),
            requests_completed: self.requests_completed.load(Ordering::Acquire),
            requests_failed: self.requests_failed.load(Ordering::Acquire),
            requests_cancelled: self.requests_cancelled.load(Ordering::Acquire),
            requests_shutdown: self.requests_shutdown.load(Ordering::Acquire),
        }
    }

    pub(crate) fn add_shutdown(&self, n: usize) {
        self.requests_shutdown.fetch_add(n as u64, Ordering::AcqRel);
    }
}

/// Resolve queued requests that will never be dispatched.
pub(crate) fn resolve_shutdown(requests: Vec<Request>, gpus: &GpuManager, counters: &WorkerCounters) {
    if requests.is_empty() {
        return;
    }
    counters.add_shutdown(requests.len());
    for request in requests {
        gpus.record_completed(request.gpu_id);
        request.resolve(Err(DispatchError::Shutdown));
    }
}

pub(crate) struct BatchWorker {
    pub(crate) model_key: ModelKey,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) engine: Arc<dyn InferenceEngine>,
    pub(crate) gpus: Arc<GpuManager>,
    pub(crate) batch_size: usize,
    pub(crate) interval: Duration,
    pub(crate) status: Arc<WorkerStatus>,
    pub(crate) counters: Arc<WorkerCounters>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl BatchWorker {
    /// Sleep, drain, dispatch, repeat until shutdown.
    ///
    /// Engine failures are turned into per-request errors and never end the
    /// loop. On shutdown the batch in flight finishes and whatever is still
    /// queued is resolved with [`DispatchError::Shutdown`].
    pub(crate) async fn run(mut self) {
        info!(
            "🚀 BATCH_WORKER: started - model={}, batch_size={}, interval={:?}",
            self.model_key, self.batch_size, self.interval
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.status.set(WorkerPhase::Idle);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                // A dropped sender means the scheduler is gone.
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
            self.run_cycle().await;
        }

        let remaining = self.queue.drain();
        if !remaining.is_empty() {
            warn!(
                "🛑 BATCH_WORKER: resolving {} queued requests with shutdown - model={}",
                remaining.len(),
                self.model_key
            );
        }
        resolve_shutdown(remaining, &self.gpus, &self.counters);
        self.status.set(WorkerPhase::Stopped);
        info!("🛑 BATCH_WORKER: stopped - model={}", self.model_key);
    }

    async fn run_cycle(&self) {
        if self.queue.is_empty() {
            return;
        }
        self.status.set(WorkerPhase::Draining);
        let mut batch = self.queue.pop_batch(self.batch_size);
        batch.retain(|request| {
            if !request.is_cancelled() {
                return true;
            }
            debug!(request_id = %request.id, model = %self.model_key, "skipping cancelled request");
            self.gpus.record_completed(request.gpu_id);
            request.resolve(Err(DispatchError::Cancelled));
            self.counters
                .requests_cancelled
                .fetch_add(1, Ordering::AcqRel);
            false
        });
        if batch.is_empty() {
            return;
        }

        self.status.set(WorkerPhase::Dispatching);
        self.dispatch(batch).await;
    }

    async fn dispatch(&self, batch: Vec<Request>) {
        let input = BatchInput {
            model: self.model_key.clone(),
            // The oldest request's device steers the whole batch.
            device: batch.first().map(|r| r.gpu_id),
            max_tokens: batch.iter().map(|r| r.max_tokens).max().unwrap_or(0),
            temperature: batch.first().map(|r| r.temperature).unwrap_or(0.0),
            prompts: batch.iter().map(Request::prompt).collect(),
        };
        let expected = batch.len();
        debug!(
            model = %self.model_key,
            batch = expected,
            device = ?input.device,
            "dispatching batch"
        );

        let started = Instant::now();
        // Run the call on its own task so a panicking engine cannot take the loop down.
        let engine = self.engine.clone();
        let outcome = match tokio::spawn(async move { engine.batch_infer(input).await }).await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Panicked(e.to_string())),
        }
        .and_then(|outputs| {
            if outputs.len() == expected {
                Ok(outputs)
            } else {
                Err(EngineError::OutputMismatch {
                    expected,
                    actual: outputs.len(),
                })
            }
        });

        for request in &batch {
            self.gpus.record_completed(request.gpu_id);
        }
        self.counters
            .batches_dispatched
            .fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(outputs) => {
                for (request, output) in batch.iter().zip(outputs) {
                    request.resolve(Ok(output));
                }
                self.counters
                    .requests_completed
                    .fetch_add(expected as u64, Ordering::AcqRel);
                info!(
                    "✅ BATCH_WORKER: batch completed - model={}, size={}, elapsed={:?}",
                    self.model_key,
                    expected,
                    started.elapsed()
                );
            }
            Err(e) => {
                error!(
                    "❌ BATCH_WORKER: batch failed - model={}, size={}, error={}",
                    self.model_key, expected, e
                );
                let err = DispatchError::Engine(e);
                for request in &batch {
                    request.resolve(Err(err.clone()));
                }
                self.counters.batches_failed.fetch_add(1, Ordering::AcqRel);
                self.counters
                    .requests_failed
                    .fetch_add(expected as u64, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::scheduler::request::GenerationRequest;
    use crate::scheduler::CompletionHandle;

    struct Fixture {
        queue: Arc<RequestQueue>,
        gpus: Arc<GpuManager>,
        counters: Arc<WorkerCounters>,
        status: Arc<WorkerStatus>,
        shutdown: watch::Sender<bool>,
        worker: Option<BatchWorker>,
    }

    fn fixture(engine: LocalEngine, batch_size: usize) -> Fixture {
        let engine: Arc<dyn InferenceEngine> = Arc::new(engine);
        let gpus = Arc::new(GpuManager::new(&[0, 1], engine.clone()).unwrap());
        let queue = Arc::new(RequestQueue::new(None));
        let counters = Arc::new(WorkerCounters::default());
        let status = Arc::new(WorkerStatus::new());
        let (tx, rx) = watch::channel(false);
        let worker = BatchWorker {
            model_key: ModelKey::new("echo"),
            queue: queue.clone(),
            engine,
            gpus: gpus.clone(),
            batch_size,
            interval: Duration::from_millis(5),
            status: status.clone(),
            counters: counters.clone(),
            shutdown: rx,
        };
        Fixture {
            queue,
            gpus,
            counters,
            status,
            shutdown: tx,
            worker: Some(worker),
        }
    }

    fn push(f: &Fixture, text: &str, gpu_id: u32) -> CompletionHandle {
        let (request, handle) =
            Request::new(ModelKey::new("echo"), GenerationRequest::prompt(text), gpu_id);
        f.gpus.record_enqueued(gpu_id);
        f.queue.push(request).unwrap();
        handle
    }

    fn echo_engine() -> LocalEngine {
        LocalEngine::new().with_model(
            ModelKey::new("echo"),
            |input: &BatchInput| -> Result<Vec<String>, EngineError> {
                Ok(input.prompts.iter().map(|p| format!("echo:{p}")).collect())
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_resolves_in_order() {
        let mut f = fixture(echo_engine(), 4);
        let handles: Vec<_> = ["a", "b", "c"].iter().map(|t| push(&f, t, 0)).collect();
        let worker = f.worker.take().unwrap();
        worker.run_cycle().await;

        let results: Vec<String> = handles
            .iter()
            .map(|h| h.try_result().unwrap().unwrap())
            .collect();
        assert_eq!(results, vec!["echo:a", "echo:b", "echo:c"]);
        assert_eq!(f.gpus.queue_depth(0), 0);
        assert_eq!(f.counters.snapshot().batches_dispatched, 1);
        assert_eq!(f.counters.snapshot().requests_completed, 3);
    }

    #[tokio::test]
    async fn test_cycle_respects_batch_size() {
        let mut f = fixture(echo_engine(), 2);
        let handles: Vec<_> = ["a", "b", "c"].iter().map(|t| push(&f, t, 1)).collect();
        let worker = f.worker.take().unwrap();
        worker.run_cycle().await;
        assert!(handles[1].is_resolved());
        assert!(!handles[2].is_resolved());
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.gpus.queue_depth(1), 1);
    }

    #[tokio::test]
    async fn test_cancelled_requests_are_skipped() {
        let mut f = fixture(echo_engine(), 4);
        let first = push(&f, "a", 0);
        let second = push(&f, "b", 0);
        first.cancel();
        let worker = f.worker.take().unwrap();
        worker.run_cycle().await;
        assert!(matches!(first.try_result(), Some(Err(DispatchError::Cancelled))));
        assert_eq!(second.try_result().unwrap().unwrap(), "echo:b");
        assert_eq!(f.counters.snapshot().requests_cancelled, 1);
    }

    #[tokio::test]
    async fn test_output_count_mismatch_fails_batch() {
        let engine = LocalEngine::new().with_model(
            ModelKey::new("echo"),
            |_: &BatchInput| -> Result<Vec<String>, EngineError> { Ok(vec!["only one".to_string()]) },
        );
        let mut f = fixture(engine, 4);
        let handles: Vec<_> = ["a", "b"].iter().map(|t| push(&f, t, 0)).collect();
        let worker = f.worker.take().unwrap();
        worker.run_cycle().await;
        for handle in &handles {
            assert!(matches!(
                handle.try_result(),
                Some(Err(DispatchError::Engine(EngineError::OutputMismatch {
                    expected: 2,
                    actual: 1
                })))
            ));
        }
        assert_eq!(f.counters.snapshot().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_resolves_queued_requests() {
        let mut f = fixture(echo_engine(), 4);
        let worker = f.worker.take().unwrap();
        f.shutdown.send_replace(true);
        let handle = push(&f, "late", 0);
        worker.run().await;
        assert!(matches!(handle.try_result(), Some(Err(DispatchError::Shutdown))));
        assert_eq!(f.status.phase(), WorkerPhase::Stopped);
        assert_eq!(f.gpus.queue_depth(0), 0);
        assert_eq!(f.counters.snapshot().requests_shutdown, 1);
    }
}

//! Per-model FIFO of pending requests.

use super::request::{ModelKey, Request};
use crate::error::DispatchError;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Ordered queue for one model key.
///
/// Append and drain both take the same lock, so a batch is removed atomically
/// and in arrival order.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<VecDeque<Request>>,
    max_depth: Option<usize>,
}

impl RequestQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    /// Append a request, or hand it back if the queue is at capacity.
    ///
    /// The request is returned inside the error so the caller decides how to
    /// resolve it; nothing is queued on rejection.
    pub fn push(&self, request: Request) -> Result<(), (Request, DispatchError)> {
        let mut guard = self.inner.lock();
        if let Some(max) = self.max_depth {
            if guard.len() >= max {
                let err = DispatchError::Capacity {
                    model: request.model_key.to_string(),
                    depth: guard.len(),
                    max,
                };
                return Err((request, err));
            }
        }
        guard.push_back(request);
        Ok(())
    }

    /// Check capacity, build the request, and append it under one lock.
    ///
    /// `build` runs only when there is room, so any side effects it has (such
    /// as a device assignment) happen exactly for requests that get queued.
    pub fn push_with<T, F>(&self, model_key: &ModelKey, build: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> (Request, T),
    {
        let mut guard = self.inner.lock();
        if let Some(max) = self.max_depth {
            if guard.len() >= max {
                return Err(DispatchError::Capacity {
                    model: model_key.to_string(),
                    depth: guard.len(),
                    max,
                });
            }
        }
        let (request, output) = build();
        guard.push_back(request);
        Ok(output)
    }

    /// Remove up to `max` of the oldest requests.
    pub fn pop_batch(&self, max: usize) -> Vec<Request> {
        let mut guard = self.inner.lock();
        let n = max.min(guard.len());
        guard.drain(..n).collect()
    }

    /// Remove everything, e.g. at shutdown.
    pub fn drain(&self) -> Vec<Request> {
        let mut guard = self.inner.lock();
        guard.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }
}

//! Write-once result cell handed to callers at enqueue time.
//!
//! [`CompletionHandle`] is the read side: it can be cloned, polled without
//! blocking, awaited from async code, or waited on from a plain thread.
//! [`CompletionSender`] is the write side and stays with the queued request.
//! The first `resolve` wins; later calls are ignored. A sender dropped before
//! resolving resolves the handle with [`DispatchError::Abandoned`].

use crate::error::DispatchError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub type CompletionResult = Result<String, DispatchError>;

#[derive(Debug)]
struct Shared {
    request_id: String,
    slot: Mutex<Option<CompletionResult>>,
    cancelled: AtomicBool,
    notify: Notify,
    condvar: Condvar,
}

pub(crate) fn completion_pair(request_id: String) -> (CompletionSender, CompletionHandle) {
    let shared = Arc::new(Shared {
        request_id,
        slot: Mutex::new(None),
        cancelled: AtomicBool::new(false),
        notify: Notify::new(),
        condvar: Condvar::new(),
    });
    (
        CompletionSender {
            shared: shared.clone(),
        },
        CompletionHandle { shared },
    )
}

/// Caller-facing side of a queued request.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

impl CompletionHandle {
    pub fn request_id(&self) -> &str {
        &self.shared.request_id
    }

    /// Non-blocking observation. `None` while the request is pending.
    pub fn try_result(&self) -> Option<CompletionResult> {
        self.shared.slot.lock().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.slot.lock().is_some()
    }

    /// Wait for the result from async code.
    ///
    /// There is no internal timeout; wrap this in `tokio::time::timeout` if the
    /// caller needs one.
    pub async fn wait(&self) -> CompletionResult {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a resolve in between is not lost.
            notified.as_mut().enable();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from inside an async task.
    pub fn wait_blocking(&self) -> CompletionResult {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.shared.condvar.wait(&mut slot);
        }
    }

    /// Like [`wait_blocking`](Self::wait_blocking) but gives up after `timeout`.
    pub fn wait_blocking_timeout(&self, timeout: Duration) -> Option<CompletionResult> {
        let mut slot = self.shared.slot.lock();
        if slot.is_none() {
            self.shared.condvar.wait_while_for(&mut slot, |s| s.is_none(), timeout);
        }
        slot.clone()
    }

    /// Ask for the request to be skipped. Best effort: a request that is
    /// already part of an in-flight batch still runs and may still resolve
    /// with a result.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

/// Resolving side of a completion handle.
#[derive(Debug)]
pub(crate) struct CompletionSender {
    shared: Arc<Shared>,
}

impl CompletionSender {
    /// Store the result and wake every waiter. Returns false if already resolved.
    pub(crate) fn resolve(&self, result: CompletionResult) -> bool {
        {
            let mut slot = self.shared.slot.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            self.shared.condvar.notify_all();
        }
        self.shared.notify.notify_waiters();
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for CompletionSender {
    fn drop(&mut self) {
        if self.resolve(Err(DispatchError::Abandoned)) {
            tracing::warn!(
                request_id = %self.shared.request_id,
                "request dropped before it was resolved"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_exactly_once() {
        let (sender, handle) = completion_pair("req-1".to_string());
        assert!(handle.try_result().is_none());
        assert!(sender.resolve(Ok("first".to_string())));
        assert!(!sender.resolve(Ok("second".to_string())));
        assert_eq!(handle.try_result().unwrap().unwrap(), "first");
        drop(sender);
        // Drop after resolve must not overwrite the result.
        assert_eq!(handle.try_result().unwrap().unwrap(), "first");
    }

    #[test]
    fn test_read_many() {
        let (sender, handle) = completion_pair("req-2".to_string());
        let other = handle.clone();
        sender.resolve(Err(DispatchError::Cancelled));
        assert!(matches!(handle.try_result(), Some(Err(DispatchError::Cancelled))));
        assert!(matches!(other.try_result(), Some(Err(DispatchError::Cancelled))));
        assert!(other.is_resolved());
    }

    #[tokio::test]
    async fn test_async_wait_wakes_up() {
        let (sender, handle) = completion_pair("req-3".to_string());
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.resolve(Ok("done".to_string()));
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let (sender, handle) = completion_pair("req-4".to_string());
        let t = std::thread::spawn(move || handle.wait_blocking());
        std::thread::sleep(Duration::from_millis(10));
        sender.resolve(Ok("threaded".to_string()));
        assert_eq!(t.join().unwrap().unwrap(), "threaded");
    }

    #[test]
    fn test_blocking_wait_timeout() {
        let (_sender, handle) = completion_pair("req-5".to_string());
        assert!(handle
            .wait_blocking_timeout(Duration::from_millis(5))
            .is_none());
    }

    #[test]
    fn test_cancel_is_visible_to_sender() {
        let (sender, handle) = completion_pair("req-6".to_string());
        assert!(!sender.is_cancelled());
        handle.cancel();
        assert!(sender.is_cancelled());
        assert!(handle.is_cancelled());
        // Cancelling does not resolve.
        assert!(!handle.is_resolved());
    }
}

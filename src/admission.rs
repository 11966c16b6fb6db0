//! Admission checks run before a request reaches the scheduler.
//!
//! The scheduler itself assumes every request it sees was already approved;
//! front ends call an [`AdmissionPolicy`] first and only enqueue on
//! [`Admission::Allow`].

use ahash::AHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// What the admission layer knows about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Caller identity, e.g. a remote address or API key id
    pub client_id: String,
    pub model: String,
}

impl RequestMetadata {
    pub fn new(client_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(String),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

pub trait AdmissionPolicy: Send + Sync {
    fn check(&self, metadata: &RequestMetadata) -> Admission;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn check(&self, _metadata: &RequestMetadata) -> Admission {
        Admission::Allow
    }
}

pub const DEFAULT_RATE_LIMIT: usize = 5;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct AccessLog {
    clients: AHashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl AccessLog {
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.clients.retain(|_, history| {
            history
                .back()
                .is_some_and(|t| now.saturating_duration_since(*t) < window)
        });
        self.last_sweep = Some(now);
    }
}

/// Sliding-window limit of `limit` requests per `window` for each client.
///
/// Clients with nothing inside the window are forgotten at most once per
/// window, so the map only holds recently active clients.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    access: Mutex<AccessLog>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            access: Mutex::new(AccessLog::default()),
        }
    }

    pub fn check_at(&self, metadata: &RequestMetadata, now: Instant) -> Admission {
        let mut access = self.access.lock();
        let sweep_due = access
            .last_sweep
            .map_or(true, |t| now.saturating_duration_since(t) >= self.window);
        if sweep_due {
            access.sweep(now, self.window);
        }

        let history = access.clients.entry(metadata.client_id.clone()).or_default();
        while history
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            history.pop_front();
        }
        if history.len() >= self.limit {
            warn!(client = %metadata.client_id, model = %metadata.model, "rate limit exceeded");
            return Admission::Deny(format!(
                "rate limit exceeded: {} requests per {:?}",
                self.limit, self.window
            ));
        }
        history.push_back(now);
        Admission::Allow
    }

    /// Drop clients with no request inside the window.
    pub fn prune(&self, now: Instant) {
        self.access.lock().sweep(now, self.window);
    }

    pub fn tracked_clients(&self) -> usize {
        self.access.lock().clients.len()
    }
}

impl AdmissionPolicy for RateLimiter {
    fn check(&self, metadata: &RequestMetadata) -> Admission {
        self.check_at(metadata, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.check(&RequestMetadata::new("a", "llama")).is_allowed());
    }

    #[test]
    fn test_rate_limit_per_client() {
        let limiter = RateLimiter::default();
        let alice = RequestMetadata::new("alice", "llama");
        let bob = RequestMetadata::new("bob", "llama");
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_at(&alice, start).is_allowed());
        }
        assert!(matches!(limiter.check_at(&alice, start), Admission::Deny(_)));
        // Other clients are unaffected.
        assert!(limiter.check_at(&bob, start).is_allowed());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let client = RequestMetadata::new("c", "llama");
        let start = Instant::now();
        assert!(limiter.check_at(&client, start).is_allowed());
        assert!(limiter
            .check_at(&client, start + Duration::from_secs(30))
            .is_allowed());
        assert!(!limiter
            .check_at(&client, start + Duration::from_secs(59))
            .is_allowed());
        // The first request has left the window.
        assert!(limiter
            .check_at(&client, start + Duration::from_secs(61))
            .is_allowed());
    }

    #[test]
    fn test_prune_forgets_idle_clients() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.check_at(&RequestMetadata::new("c", "llama"), start);
        assert_eq!(limiter.tracked_clients(), 1);
        limiter.prune(start + Duration::from_secs(2));
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_idle_clients_are_forgotten_while_checking() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..50 {
            limiter.check_at(&RequestMetadata::new(format!("client-{i}"), "llama"), start);
        }
        assert_eq!(limiter.tracked_clients(), 50);

        // One window later only the new caller remains.
        let later = start + Duration::from_secs(11);
        assert!(limiter
            .check_at(&RequestMetadata::new("fresh", "llama"), later)
            .is_allowed());
        assert_eq!(limiter.tracked_clients(), 1);
    }
}

//! Process lifecycle coordination.
//!
//! Tracks the relay through `Starting → Ready → ShuttingDown → Stopped`,
//! counts in-flight public requests so shutdown can drain them, and owns the
//! cancellation token every background task watches.
//!
//! ## Lifecycle states
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Initialization in progress.
    Starting,
    /// Accepting traffic.
    Ready,
    /// Draining, rejecting new requests and registrations.
    ShuttingDown,
    /// Shutdown complete.
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of the drain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// All in-flight requests completed within the grace window.
    Complete,
    /// The grace window elapsed with requests still running.
    Timeout { remaining: usize },
}

/// Central coordination point for startup, readiness and shutdown.
///
/// All state is atomics or lock-free swaps; safe for concurrent access from
/// every task in the process.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,
    /// Grace window for in-flight requests after shutdown is signaled.
    drain_timeout: Duration,
    version: &'static str,
}

impl LifecycleManager {
    /// Create a manager in the `Starting` state.
    #[must_use]
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            drain_timeout,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "relay ready"
        );
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Token cancelled once shutdown begins; clone into background tasks.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Enter `ShuttingDown` and cancel the shutdown token.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_requests.load(Ordering::SeqCst),
            "shutdown initiated"
        );
    }

    /// Register an in-flight public request. Returns `None` once shutdown
    /// has begun; callers must reject the request. The guard decrements the
    /// counter on drop, panics included.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            lifecycle: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Wait for in-flight requests to finish, bounded by the grace window.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let remaining = self.active_request_count();
            if remaining == 0 {
                return DrainResult::Complete;
            }
            if Instant::now() >= deadline {
                return DrainResult::Timeout { remaining };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII guard for one tracked request.
pub struct RequestGuard {
    lifecycle: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle
            .active_requests
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let lifecycle = Arc::new(LifecycleManager::new(Duration::from_secs(5)));
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(!lifecycle.is_ready());

        lifecycle.mark_ready();
        assert!(lifecycle.is_ready());

        lifecycle.begin_shutdown();
        assert!(lifecycle.is_shutting_down());
        assert!(lifecycle.shutdown_token().is_cancelled());

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn requests_rejected_after_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new(Duration::from_secs(5)));
        lifecycle.mark_ready();

        let guard = lifecycle.track_request();
        assert!(guard.is_some());
        assert_eq!(lifecycle.active_request_count(), 1);
        drop(guard);
        assert_eq!(lifecycle.active_request_count(), 0);

        lifecycle.begin_shutdown();
        assert!(lifecycle.track_request().is_none());
    }

    #[test]
    fn guard_decrements_on_panic() {
        use std::panic::AssertUnwindSafe;

        let lifecycle = Arc::new(LifecycleManager::new(Duration::from_secs(5)));
        lifecycle.mark_ready();

        let inner = Arc::clone(&lifecycle);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = inner.track_request();
            panic!("simulated handler panic");
        }));
        assert!(result.is_err());
        assert_eq!(lifecycle.active_request_count(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_idle() {
        let lifecycle = Arc::new(LifecycleManager::new(Duration::from_millis(200)));
        lifecycle.mark_ready();
        assert_eq!(lifecycle.drain_requests().await, DrainResult::Complete);
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_request() {
        let lifecycle = Arc::new(LifecycleManager::new(Duration::from_millis(100)));
        lifecycle.mark_ready();
        let _guard = lifecycle.track_request().expect("tracked");
        assert_eq!(
            lifecycle.drain_requests().await,
            DrainResult::Timeout { remaining: 1 }
        );
    }
}

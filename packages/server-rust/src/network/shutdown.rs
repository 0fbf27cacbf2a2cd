//! Shared lifecycle context for the protocol sub-servers.
//!
//! Uses `ArcSwap` for lock-free state transitions, a watch channel as the
//! single-use cancellation signal, and an atomic counter with RAII guards
//! as the wait-group of running sub-server tasks.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state of a [`Server`](super::Server).
///
/// State machine: Created -> Serving -> `ShuttingDown` -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Built but not yet serving.
    Created,
    /// Sub-servers are running.
    Serving,
    /// Cancellation fired; sub-servers are draining.
    ShuttingDown,
    /// Every sub-server task has exited.
    Closed,
}

impl ServerState {
    /// Returns the lowercase name of the state, for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        }
    }
}

/// Cancelable lifecycle context shared by the supervisor and its sub-servers.
///
/// 1. `set_serving()` marks the start of the serve phase
/// 2. sub-server tasks hold a [`TaskGuard`] and await `cancelled()`
/// 3. `trigger_shutdown()` moves to `ShuttingDown` and wakes every waiter
/// 4. `wait_for_drain()` blocks until every guard is dropped
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    running: Arc<AtomicU64>,
    state: Arc<ArcSwap<ServerState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            running: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(ServerState::Created)),
        }
    }

    /// Transitions to `Serving`.
    ///
    /// Returns false (and leaves the state alone) unless the controller is
    /// still `Created`, so a controller serves at most once.
    pub fn set_serving(&self) -> bool {
        let current = self.state.load();
        if **current != ServerState::Created {
            return false;
        }
        let prev = self
            .state
            .compare_and_swap(&current, Arc::new(ServerState::Serving));
        Arc::ptr_eq(&prev, &current)
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Returns a future that resolves once shutdown has been triggered.
    ///
    /// Resolves immediately if it already was.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_receiver();
        async move {
            // An error means the controller is gone, which also ends serving.
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    /// Returns true once shutdown has been triggered.
    #[must_use]
    pub fn is_shutdown_triggered(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    /// Cancels the lifecycle context.
    ///
    /// Idempotent: triggering an already-triggered controller is a no-op.
    pub fn trigger_shutdown(&self) {
        if self.shutdown_signal.send_replace(true) {
            return;
        }
        if self.state() != ServerState::Closed {
            self.state.store(Arc::new(ServerState::ShuttingDown));
        }
    }

    /// Marks the controller closed once all tasks have exited.
    pub fn set_closed(&self) {
        self.state.store(Arc::new(ServerState::Closed));
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    /// Creates an RAII guard that tracks a running sub-server task.
    ///
    /// The counter is incremented on creation and decremented when the
    /// guard is dropped, even if the task panics.
    #[must_use]
    pub fn task_guard(&self) -> TaskGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            running: Arc::clone(&self.running),
        }
    }

    /// Returns the number of sub-server tasks still running.
    #[must_use]
    pub fn running_count(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    /// Waits for every tracked task to exit, up to the given timeout.
    ///
    /// Returns `true` (and transitions to `Closed`) if all tasks exited.
    /// Returns `false` if the timeout expired; the tasks keep draining.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.running.load(Ordering::SeqCst) == 0 {
                self.set_closed();
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the running-task counter when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    running: Arc<AtomicU64>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

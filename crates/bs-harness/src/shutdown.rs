use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownPhase
// ---------------------------------------------------------------------------

/// Phases only move forward: `Running -> Draining -> Aborting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    /// No new work may start; in-flight work may finish.
    Draining,
    /// In-flight work must stop now.
    Aborting,
}

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative two-phase shutdown
// ---------------------------------------------------------------------------

/// Shutdown coordinator shared by every long-running component.
///
/// `trigger()` starts the drain phase: loops stop scheduling new work but
/// let the current unit finish. `abort()` starts the hard phase: whatever is
/// still running is interrupted. Components either poll
/// [`is_shutting_down`](Self::is_shutting_down) between units of work or
/// `select!` on [`triggered`](Self::triggered) / [`aborted`](Self::aborted).
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
///
/// tokio::select! {
///     _ = shutdown.aborted() => { /* record as cancelled */ }
///     result = run_job() => { /* normal path */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ShutdownPhase::Running);
        Self { phase: Arc::new(tx) }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// True once `trigger()` or `abort()` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.phase() >= ShutdownPhase::Draining
    }

    pub fn is_aborting(&self) -> bool {
        self.phase() == ShutdownPhase::Aborting
    }

    /// Enter the drain phase.
    pub fn trigger(&self) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if changed {
            info!("shutdown triggered, draining");
        } else {
            debug!("shutdown already triggered");
        }
    }

    /// Enter the abort phase. Implies `trigger()`.
    pub fn abort(&self) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase != ShutdownPhase::Aborting {
                *phase = ShutdownPhase::Aborting;
                true
            } else {
                false
            }
        });
        if changed {
            warn!("shutdown grace period over, aborting in-flight work");
        }
    }

    /// Resolves once shutdown has been triggered (immediately if it already was).
    pub async fn triggered(&self) {
        self.wait_for(ShutdownPhase::Draining).await;
    }

    /// Resolves once the abort phase has started.
    pub async fn aborted(&self) {
        self.wait_for(ShutdownPhase::Aborting).await;
    }

    async fn wait_for(&self, target: ShutdownPhase) {
        let mut rx = self.phase.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|phase| *phase >= target).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_signal_is_running() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.phase(), ShutdownPhase::Running);
        assert!(!signal.is_shutting_down());
        assert!(!signal.is_aborting());
    }

    #[test]
    fn trigger_then_abort() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        assert!(signal.is_shutting_down());
        assert!(!signal.is_aborting());
        signal.abort();
        assert!(signal.is_aborting());
    }

    #[test]
    fn trigger_after_abort_does_not_go_back() {
        let signal = ShutdownSignal::new();
        signal.abort();
        signal.trigger();
        assert_eq!(signal.phase(), ShutdownPhase::Aborting);
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn triggered_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });

        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn triggered_resolves_immediately_when_already_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(50), signal.triggered()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn aborted_waits_for_abort_phase() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let early = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(early.is_err(), "draining is not aborting");

        signal.abort();
        let late = tokio::time::timeout(Duration::from_millis(50), signal.aborted()).await;
        assert!(late.is_ok());
    }
}

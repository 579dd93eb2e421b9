//! Lifecycle scaffolding shared by beacons and monitors.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐   run()   ┌─────────┐  loop exits  ┌────────┐
//! │ Configured ├──────────►│ Running ├─────────────►│ Closed │
//! └─────┬──────┘           └─────────┘              └────────┘
//!       │                       ▲ close() signals       ▲
//!       └───────────────────────┼───────────────────────┘
//!                 close() releases the connection directly
//! ```
//!
//! A running loop owns its connection. `close()` only signals it; the loop
//! drops the connection and then publishes the [`CloseReason`], so a
//! published reason always means the connection is gone.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::error::{CloseReason, HeartbeatError, HeartbeatResult};

/// Observable lifecycle state of a beacon or monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, loop not started yet.
    Configured,
    /// Loop is running.
    Running,
    /// Terminal. The connection has been released or is being released.
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Configured => write!(f, "configured"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

/// Lock a tunables mutex, ignoring poisoning.
///
/// Guarded values are plain numbers and durations, a panicking writer
/// cannot leave them half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once shutdown has been requested on `shutdown_rx`.
pub(crate) async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    // An error means the lifecycle is gone, which also means stop.
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Start/stop bookkeeping for one named instance.
pub(crate) struct Lifecycle {
    name: String,
    state: Mutex<LifecycleState>,
    /// Set to true once to ask the running loop to stop.
    shutdown_tx: watch::Sender<bool>,
    /// Holds the close reason once the instance is closed.
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl Lifecycle {
    pub(crate) fn new(name: String) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(None);
        Self {
            name,
            state: Mutex::new(LifecycleState::Configured),
            shutdown_tx,
            closed_tx,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Move from Configured to Running and hand out the shutdown signal
    /// the loop has to watch.
    pub(crate) fn start(&self) -> HeartbeatResult<watch::Receiver<bool>> {
        let mut state = lock(&self.state);
        match *state {
            LifecycleState::Configured => {
                *state = LifecycleState::Running;
                Ok(self.shutdown_tx.subscribe())
            }
            LifecycleState::Running => Err(HeartbeatError::AlreadyStarted {
                name: self.name.clone(),
            }),
            LifecycleState::Closed => Err(HeartbeatError::Closed {
                name: self.name.clone(),
            }),
        }
    }

    /// Ask the instance to close.
    ///
    /// Returns true when the instance never started: the caller then owns
    /// the release of the connection and must call [`Lifecycle::finish`].
    /// A running loop is signalled instead and finishes on its own.
    pub(crate) fn request_close(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            LifecycleState::Configured => {
                *state = LifecycleState::Closed;
                true
            }
            LifecycleState::Running => {
                self.shutdown_tx.send_replace(true);
                false
            }
            LifecycleState::Closed => false,
        }
    }

    /// Mark the instance closed and publish `reason`.
    ///
    /// Only the first call publishes; later calls return false.
    pub(crate) fn finish(&self, reason: CloseReason) -> bool {
        *lock(&self.state) = LifecycleState::Closed;

        let published = self.closed_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        });

        if published {
            if reason.is_failure() {
                tracing::warn!(name = %self.name, reason = %reason, "connection closed");
            } else {
                tracing::info!(name = %self.name, reason = %reason, "connection closed");
            }
        }
        published
    }

    /// Reason the instance closed, if it has.
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.closed_tx.borrow().clone()
    }

    /// Wait until the instance is closed.
    pub(crate) async fn closed(&self) -> CloseReason {
        let mut closed_rx = self.closed_tx.subscribe();
        let reason = match closed_rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone().unwrap_or(CloseReason::Shutdown),
            // The sender lives as long as self.
            Err(_) => CloseReason::Shutdown,
        };
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_start_only_once() {
        let lifecycle = Lifecycle::new("beacon".into());
        assert_eq!(lifecycle.state(), LifecycleState::Configured);
        assert!(lifecycle.start().is_ok());
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert_eq!(
            lifecycle.start().err(),
            Some(HeartbeatError::AlreadyStarted {
                name: "beacon".into()
            })
        );
    }

    #[test]
    fn test_close_before_start_hands_release_to_caller() {
        let lifecycle = Lifecycle::new("monitor".into());
        assert!(lifecycle.request_close());
        assert!(!lifecycle.request_close());
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert_eq!(
            lifecycle.start().err(),
            Some(HeartbeatError::Closed {
                name: "monitor".into()
            })
        );
    }

    #[tokio::test]
    async fn test_close_while_running_signals_loop() {
        let lifecycle = Lifecycle::new("beacon".into());
        let mut shutdown_rx = lifecycle.start().expect("start");
        assert!(!*shutdown_rx.borrow());

        assert!(!lifecycle.request_close());
        shutdown_rx
            .wait_for(|stop| *stop)
            .await
            .expect("shutdown signal");
        // Still running until the loop finishes.
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[test]
    fn test_finish_publishes_first_reason_only() {
        let lifecycle = Lifecycle::new("beacon".into());
        let _ = lifecycle.start().expect("start");
        assert!(lifecycle.finish(CloseReason::LifetimeElapsed));
        assert!(!lifecycle.finish(CloseReason::Shutdown));
        assert_eq!(lifecycle.close_reason(), Some(CloseReason::LifetimeElapsed));
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_closed_after_finish_resolves_immediately() {
        let lifecycle = Lifecycle::new("beacon".into());
        assert!(lifecycle.request_close());
        lifecycle.finish(CloseReason::Shutdown);
        assert_eq!(lifecycle.closed().await, CloseReason::Shutdown);
        assert_eq!(lifecycle.closed().await, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_closed_waits_for_finish() {
        let lifecycle = Arc::new(Lifecycle::new("monitor".into()));
        let _ = lifecycle.start().expect("start");

        let waiter = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.closed().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lifecycle.finish(CloseReason::ReadFailed("reset".into()));
        let reason = waiter.await.expect("waiter panicked");
        assert_eq!(reason, CloseReason::ReadFailed("reset".into()));
    }
}

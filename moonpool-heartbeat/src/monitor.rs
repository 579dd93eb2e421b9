//! Monitor: the receiving side of a heartbeat pair.
//!
//! A monitor owns one inbound connection and expects *something* to arrive
//! within every timeout window. Content is not parsed, any successful read
//! counts as a heartbeat.
//!
//! # Miss Counting
//!
//! ```text
//!             read within window
//!          ┌──────────────────────┐
//!          ▼                      │
//!   ┌─────────────┐  window   ┌───┴──────────┐  misses > threshold  ┌────────┐
//!   │ misses = 0  ├──────────►│ misses += 1  ├─────────────────────►│ Closed │
//!   └─────────────┘  elapsed  └──────────────┘                      └────────┘
//! ```
//!
//! The window restarts on every iteration, after a read as well as after a
//! miss. A read resets the counter, so sparse misses never add up to a
//! dead peer while heartbeats keep coming.
//!
//! A read error closes the monitor immediately. End of stream is different:
//! the peer can no longer send anything, so every following window is
//! counted as a miss until the threshold declares it dead.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::config::MonitorConfig;
use crate::error::{CloseReason, HeartbeatError, HeartbeatResult};
use crate::lifecycle::{lock, shutdown_requested, Lifecycle, LifecycleState};
use crate::metrics::MonitorMetrics;
use crate::network::TcpListenerTrait;

/// Read buffer size. Anything beyond the marker is accepted and discarded.
const READ_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy)]
struct MonitorTunables {
    timeout: Duration,
    threshold: u32,
    consecutive_misses: u32,
}

struct MonitorShared {
    lifecycle: Lifecycle,
    tunables: Mutex<MonitorTunables>,
    metrics: Mutex<MonitorMetrics>,
}

impl MonitorShared {
    fn tunables(&self) -> MonitorTunables {
        *lock(&self.tunables)
    }

    fn record_heartbeat(&self, bytes: usize) {
        lock(&self.tunables).consecutive_misses = 0;
        lock(&self.metrics).record_heartbeat(bytes);
        tracing::debug!(name = %self.lifecycle.name(), bytes, "monitor received heartbeat");
    }

    /// Count one elapsed window. Returns the close reason once the counter
    /// goes over the threshold.
    fn record_miss(&self) -> Option<CloseReason> {
        let (misses, threshold) = {
            let mut tunables = lock(&self.tunables);
            tunables.consecutive_misses = tunables.consecutive_misses.saturating_add(1);
            (tunables.consecutive_misses, tunables.threshold)
        };
        lock(&self.metrics).record_miss();
        tracing::debug!(
            name = %self.lifecycle.name(),
            misses,
            threshold,
            "monitor window elapsed without heartbeat"
        );

        (misses > threshold).then_some(CloseReason::ThresholdExceeded { misses, threshold })
    }
}

/// Liveness detector counting consecutive missed windows on one owned
/// connection.
///
/// All methods take `&self`; wrap the monitor in an [`Arc`] to tune, reset
/// or close it from other tasks or threads.
pub struct Monitor<S> {
    shared: Arc<MonitorShared>,
    /// Connection until `run()` moves it into the loop.
    stream: Mutex<Option<S>>,
}

impl<S> Monitor<S>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    /// Configure a monitor over an already-accepted connection.
    ///
    /// The monitor is not running until [`Monitor::run`] is called.
    pub fn new(name: impl Into<String>, stream: S, config: MonitorConfig) -> Self {
        let name = name.into();
        tracing::debug!(
            name = %name,
            timeout = ?config.timeout,
            threshold = config.threshold,
            "monitor configured"
        );
        Self {
            shared: Arc::new(MonitorShared {
                lifecycle: Lifecycle::new(name),
                tunables: Mutex::new(MonitorTunables {
                    timeout: config.timeout,
                    threshold: config.threshold,
                    consecutive_misses: 0,
                }),
                metrics: Mutex::new(MonitorMetrics::default()),
            }),
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Accept one connection from `listener` and configure a monitor for it.
    ///
    /// One monitor watches one peer; call again for the next peer.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Connection`] if the accept fails.
    pub async fn accept<L>(
        listener: &L,
        name: impl Into<String>,
        config: MonitorConfig,
    ) -> HeartbeatResult<Self>
    where
        L: TcpListenerTrait<TcpStream = S>,
    {
        let name = name.into();
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| HeartbeatError::connection(&name, e))?;
        tracing::debug!(name = %name, peer = %peer_addr, "monitor accepted connection");
        Ok(Self::new(name, stream, config))
    }

    /// Start the miss-counting loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::AlreadyStarted`] or [`HeartbeatError::Closed`]
    /// if the monitor is not in the configured state, and
    /// [`HeartbeatError::NoRuntime`] when called outside a tokio runtime.
    pub fn run(&self) -> HeartbeatResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            HeartbeatError::NoRuntime {
                name: self.name().to_string(),
            }
        })?;
        let shutdown_rx = self.shared.lifecycle.start()?;
        let stream = match lock(&self.stream).take() {
            Some(stream) => stream,
            None => {
                self.shared.lifecycle.finish(CloseReason::Shutdown);
                return Err(HeartbeatError::Closed {
                    name: self.name().to_string(),
                });
            }
        };

        tracing::info!(
            name = %self.name(),
            timeout = ?self.timeout(),
            threshold = self.threshold(),
            "monitor running"
        );
        runtime.spawn(monitoring_loop(self.shared.clone(), stream, shutdown_rx));
        Ok(())
    }
}

impl<S> Drop for Monitor<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S> Monitor<S> {
    /// Diagnostic name of this monitor.
    pub fn name(&self) -> &str {
        self.shared.lifecycle.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Current timeout window.
    pub fn timeout(&self) -> Duration {
        self.shared.tunables().timeout
    }

    /// Change the timeout window. Applies from the next window on.
    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.shared.tunables).timeout = timeout;
        tracing::debug!(name = %self.name(), timeout = ?timeout, "monitor timeout changed");
    }

    /// Current miss threshold.
    pub fn threshold(&self) -> u32 {
        self.shared.tunables().threshold
    }

    /// Change the miss threshold. Checked on the next miss.
    pub fn set_threshold(&self, threshold: u32) {
        lock(&self.shared.tunables).threshold = threshold;
        tracing::debug!(name = %self.name(), threshold, "monitor threshold changed");
    }

    /// Current consecutive-miss counter.
    pub fn consecutive_misses(&self) -> u32 {
        self.shared.tunables().consecutive_misses
    }

    /// Reset the consecutive-miss counter.
    ///
    /// For callers holding other evidence that the peer is alive.
    pub fn reset_failures(&self) {
        let previous = std::mem::take(&mut lock(&self.shared.tunables).consecutive_misses);
        tracing::debug!(name = %self.name(), previous, "monitor misses reset");
    }

    /// Snapshot of the monitoring counters.
    pub fn metrics(&self) -> MonitorMetrics {
        let mut metrics = lock(&self.shared.metrics).clone();
        metrics.consecutive_misses = self.consecutive_misses();
        metrics
    }

    /// Close the monitor and release its connection.
    ///
    /// Safe to call any number of times, from any thread, including while
    /// the loop is closing itself. Dropping the monitor closes it too.
    pub fn close(&self) {
        if self.shared.lifecycle.request_close() {
            drop(lock(&self.stream).take());
            self.shared.lifecycle.finish(CloseReason::Shutdown);
        }
    }

    /// Reason the monitor closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lifecycle.close_reason()
    }

    /// Wait until the monitor is closed and its connection released.
    pub async fn closed(&self) -> CloseReason {
        self.shared.lifecycle.closed().await
    }
}

/// What ended one timeout window.
enum WindowOutcome {
    Heartbeat(usize),
    Elapsed,
    PeerFinished,
    Failed(io::Error),
}

async fn wait_for_heartbeat<S>(
    stream: &mut S,
    buf: &mut [u8],
    window: Duration,
    peer_finished: bool,
) -> WindowOutcome
where
    S: AsyncRead + Unpin,
{
    if peer_finished {
        tokio::time::sleep(window).await;
        return WindowOutcome::Elapsed;
    }

    match tokio::time::timeout(window, stream.read(buf)).await {
        Ok(Ok(0)) => WindowOutcome::PeerFinished,
        Ok(Ok(n)) => WindowOutcome::Heartbeat(n),
        Ok(Err(e)) => WindowOutcome::Failed(e),
        Err(_) => WindowOutcome::Elapsed,
    }
}

async fn monitoring_loop<S>(
    shared: Arc<MonitorShared>,
    mut stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut peer_finished = false;

    let reason = loop {
        let window = shared.tunables().timeout;

        let outcome = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => break CloseReason::Shutdown,
            outcome = wait_for_heartbeat(&mut stream, &mut buf, window, peer_finished) => outcome,
        };

        match outcome {
            WindowOutcome::Heartbeat(bytes) => shared.record_heartbeat(bytes),
            WindowOutcome::Elapsed => {
                if let Some(reason) = shared.record_miss() {
                    break reason;
                }
            }
            WindowOutcome::PeerFinished => {
                tracing::debug!(name = %shared.lifecycle.name(), "monitor peer finished sending");
                peer_finished = true;
            }
            WindowOutcome::Failed(e) => break CloseReason::ReadFailed(e.to_string()),
        }
    };

    drop(stream);
    shared.lifecycle.finish(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt, ReadBuf};
    use tokio::time::Instant;

    use crate::MARKER;

    fn config(timeout_ms: u64, threshold: u32) -> MonitorConfig {
        MonitorConfig::new(Duration::from_millis(timeout_ms), threshold)
    }

    /// Reader whose every read fails like a reset connection.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_threshold_plus_one_misses() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("silent", local, config(50, 2));
        monitor.run().expect("run");
        let started = Instant::now();

        let reason = monitor.closed().await;
        assert_eq!(
            reason,
            CloseReason::ThresholdExceeded {
                misses: 3,
                threshold: 2
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(160));
        assert_eq!(monitor.metrics().total_misses, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_misses_keep_running() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("tolerant", local, config(50, 2));
        monitor.run().expect("run");

        tokio::time::sleep(Duration::from_millis(125)).await;
        assert_eq!(monitor.consecutive_misses(), 2);
        assert_eq!(monitor.state(), LifecycleState::Running);

        monitor.close();
        assert_eq!(monitor.closed().await, CloseReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_resets_counter_and_window() {
        let (local, mut remote) = duplex(64);
        let monitor = Monitor::new("recovering", local, config(50, 3));
        monitor.run().expect("run");

        // Misses at 50 and 100.
        tokio::time::sleep(Duration::from_millis(125)).await;
        assert_eq!(monitor.consecutive_misses(), 2);

        remote.write_all(MARKER).await.expect("write");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(monitor.consecutive_misses(), 0);

        // Window restarted at 125: misses at 175 and 225.
        tokio::time::sleep(Duration::from_millis(114)).await;
        assert_eq!(monitor.consecutive_misses(), 2);
        assert_eq!(monitor.state(), LifecycleState::Running);

        let metrics = monitor.metrics();
        assert_eq!(metrics.total_misses, 4);
        assert_eq!(metrics.heartbeats_received, 1);
        assert_eq!(metrics.bytes_received, 2);

        // Two more silent windows cross the threshold of 3.
        assert_eq!(
            monitor.closed().await,
            CloseReason::ThresholdExceeded {
                misses: 4,
                threshold: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_failures_prevents_close() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("reset", local, config(50, 2));
        monitor.run().expect("run");

        tokio::time::sleep(Duration::from_millis(125)).await;
        assert_eq!(monitor.consecutive_misses(), 2);
        monitor.reset_failures();
        assert_eq!(monitor.consecutive_misses(), 0);

        // Without the reset the miss at 150 would have closed it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.consecutive_misses(), 1);
        assert_eq!(monitor.state(), LifecycleState::Running);

        monitor.close();
        monitor.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_threshold_while_running() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("raised", local, config(50, 1));
        monitor.run().expect("run");

        tokio::time::sleep(Duration::from_millis(75)).await;
        monitor.set_threshold(5);
        monitor.set_timeout(Duration::from_millis(100));
        assert_eq!(monitor.threshold(), 5);
        assert_eq!(monitor.timeout(), Duration::from_millis(100));

        // The pending window still ends at 100 (miss 2), then 100ms
        // windows: 200, 300, 400, and 500 where 6 > 5.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(monitor.consecutive_misses(), 5);
        assert_eq!(monitor.state(), LifecycleState::Running);

        assert_eq!(
            monitor.closed().await,
            CloseReason::ThresholdExceeded {
                misses: 6,
                threshold: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_counts_as_silence() {
        let (local, remote) = duplex(64);
        drop(remote);

        let monitor = Monitor::new("orphan", local, config(50, 1));
        monitor.run().expect("run");
        let started = Instant::now();

        assert_eq!(
            monitor.closed().await,
            CloseReason::ThresholdExceeded {
                misses: 2,
                threshold: 1
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(monitor.metrics().heartbeats_received, 0);
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let monitor = Monitor::new("reset-peer", ResetStream, config(1_000, 10));
        monitor.run().expect("run");

        match monitor.closed().await {
            CloseReason::ReadFailed(message) => assert!(message.contains("reset")),
            other => panic!("expected read failure, got {other:?}"),
        }
        assert_eq!(monitor.metrics().total_misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_running_monitor_releases_connection() {
        let (local, mut remote) = duplex(64);
        let monitor = Monitor::new("dropped", local, config(1_000, 3));
        monitor.run().expect("run");

        remote.write_all(MARKER).await.expect("write while watched");
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(monitor);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The read half is gone, so the peer's next write fails.
        assert!(remote.write_all(MARKER).await.is_err());
    }

    #[test]
    fn test_run_outside_runtime_stays_configured() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("no-runtime", local, config(50, 1));
        assert_eq!(
            monitor.run(),
            Err(HeartbeatError::NoRuntime {
                name: "no-runtime".into()
            })
        );
        assert_eq!(monitor.state(), LifecycleState::Configured);

        monitor.close();
        assert_eq!(monitor.close_reason(), Some(CloseReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_twice_is_noop() {
        let (local, _remote) = duplex(64);
        let monitor = Monitor::new("closing", local, config(1_000, 1));
        monitor.run().expect("run");

        monitor.close();
        monitor.close();
        assert_eq!(monitor.closed().await, CloseReason::Shutdown);
        monitor.close();
        assert_eq!(monitor.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(
            monitor.run(),
            Err(HeartbeatError::Closed {
                name: "closing".into()
            })
        );
    }
}

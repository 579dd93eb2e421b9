//! Beacon: the emitting side of a heartbeat pair.
//!
//! A beacon owns one outbound connection and writes [`MARKER`] to it every
//! `interval`. It stops on the first write failure, when its optional
//! lifetime bound elapses, or when [`Beacon::close`] is called.
//!
//! # Emission Loop
//!
//! ```text
//! loop {
//!     interval, lifetime = read tunables        (one critical section)
//!     select { shutdown | lifetime elapsed | sleep(interval) }
//!     select { shutdown | lifetime elapsed | write_all(MARKER) + flush }
//! }
//! ```
//!
//! The tunables lock is released before every wait and every write, so
//! [`Beacon::set_interval`] never queues behind I/O. A new interval applies
//! to the next wait, the pending one is not preempted.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::BeaconConfig;
use crate::error::{CloseReason, HeartbeatError, HeartbeatResult};
use crate::lifecycle::{lock, shutdown_requested, Lifecycle, LifecycleState};
use crate::metrics::BeaconMetrics;
use crate::network::NetworkProvider;
use crate::MARKER;

#[derive(Debug, Clone, Copy)]
struct BeaconTunables {
    interval: Duration,
    lifetime: Option<Duration>,
}

/// State shared between the handle and the spawned loop.
struct BeaconShared {
    lifecycle: Lifecycle,
    tunables: Mutex<BeaconTunables>,
    metrics: Mutex<BeaconMetrics>,
}

impl BeaconShared {
    fn tunables(&self) -> BeaconTunables {
        *lock(&self.tunables)
    }
}

/// Periodic emitter of liveness markers over one owned connection.
///
/// All methods take `&self`; wrap the beacon in an [`Arc`] to tune or close
/// it from other tasks or threads.
pub struct Beacon<S> {
    shared: Arc<BeaconShared>,
    /// Connection until `run()` moves it into the loop.
    stream: Mutex<Option<S>>,
}

impl<S> Beacon<S>
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    /// Configure a beacon over an already-dialed connection.
    ///
    /// The beacon is not running until [`Beacon::run`] is called.
    pub fn new(name: impl Into<String>, stream: S, config: BeaconConfig) -> Self {
        let name = name.into();
        tracing::debug!(
            name = %name,
            interval = ?config.interval,
            lifetime = ?config.lifetime,
            "beacon configured"
        );
        Self {
            shared: Arc::new(BeaconShared {
                lifecycle: Lifecycle::new(name),
                tunables: Mutex::new(BeaconTunables {
                    interval: config.interval,
                    lifetime: config.lifetime,
                }),
                metrics: Mutex::new(BeaconMetrics::default()),
            }),
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Dial `addr` through `network` and configure a beacon over the result.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Connection`] if the dial fails. The dial is
    /// not retried.
    pub async fn connect<N>(
        network: &N,
        name: impl Into<String>,
        addr: &str,
        config: BeaconConfig,
    ) -> HeartbeatResult<Self>
    where
        N: NetworkProvider<TcpStream = S>,
    {
        let name = name.into();
        let stream = network
            .connect(addr)
            .await
            .map_err(|e| HeartbeatError::connection(&name, e))?;
        tracing::debug!(name = %name, addr = %addr, "beacon connected");
        Ok(Self::new(name, stream, config))
    }

    /// Start the emission loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::AlreadyStarted`] or [`HeartbeatError::Closed`]
    /// if the beacon is not in the configured state, and
    /// [`HeartbeatError::NoRuntime`] when called outside a tokio runtime.
    /// A beacon that failed to start for lack of a runtime stays configured.
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
                // Unreachable in practice: only close() before start takes it.
                self.shared.lifecycle.finish(CloseReason::Shutdown);
                return Err(HeartbeatError::Closed {
                    name: self.name().to_string(),
                });
            }
        };

        tracing::info!(
            name = %self.name(),
            interval = ?self.interval(),
            lifetime = ?self.lifetime(),
            "beacon running"
        );
        runtime.spawn(emission_loop(self.shared.clone(), stream, shutdown_rx));
        Ok(())
    }
}

impl<S> Drop for Beacon<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S> Beacon<S> {
    /// Diagnostic name of this beacon.
    pub fn name(&self) -> &str {
        self.shared.lifecycle.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Current emission interval.
    pub fn interval(&self) -> Duration {
        self.shared.tunables().interval
    }

    /// Change the emission interval. Applies from the next wait on.
    pub fn set_interval(&self, interval: Duration) {
        lock(&self.shared.tunables).interval = interval;
        tracing::debug!(name = %self.name(), interval = ?interval, "beacon interval changed");
    }

    /// Current lifetime bound, measured from the start of `run()`.
    pub fn lifetime(&self) -> Option<Duration> {
        self.shared.tunables().lifetime
    }

    /// Change or remove the lifetime bound.
    pub fn set_lifetime(&self, lifetime: Option<Duration>) {
        lock(&self.shared.tunables).lifetime = lifetime;
        tracing::debug!(name = %self.name(), lifetime = ?lifetime, "beacon lifetime changed");
    }

    /// Snapshot of the emission counters.
    pub fn metrics(&self) -> BeaconMetrics {
        lock(&self.shared.metrics).clone()
    }

    /// Close the beacon and release its connection.
    ///
    /// Safe to call any number of times, from any thread, including while
    /// the loop is closing itself. A running loop is woken up and releases
    /// the connection on its way out. Dropping the beacon closes it too.
    pub fn close(&self) {
        if self.shared.lifecycle.request_close() {
            drop(lock(&self.stream).take());
            self.shared.lifecycle.finish(CloseReason::Shutdown);
        }
    }

    /// Reason the beacon closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lifecycle.close_reason()
    }

    /// Wait until the beacon is closed and its connection released.
    pub async fn closed(&self) -> CloseReason {
        self.shared.lifecycle.closed().await
    }
}

/// Upper bound on the FIN sent after a clean stop.
const FIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Resolves when the lifetime deadline passes, never without one.
async fn lifetime_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn emission_loop<S>(
    shared: Arc<BeaconShared>,
    mut stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let name = shared.lifecycle.name().to_string();
    let started_at = Instant::now();

    // The flag records whether a write was cut short. The stream may then
    // hold unflushed bytes that the peer is not draining.
    let (reason, mid_write) = loop {
        let tunables = shared.tunables();
        let deadline = tunables.lifetime.map(|lifetime| started_at + lifetime);
        tracing::trace!(name = %name, interval = ?tunables.interval, "beacon waiting");

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => break (CloseReason::Shutdown, false),
            _ = lifetime_elapsed(deadline) => break (CloseReason::LifetimeElapsed, false),
            _ = tokio::time::sleep(tunables.interval) => {}
        }

        let beat = async {
            stream.write_all(MARKER).await?;
            stream.flush().await?;
            Ok::<_, io::Error>(())
        };
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => break (CloseReason::Shutdown, true),
            _ = lifetime_elapsed(deadline) => break (CloseReason::LifetimeElapsed, true),
            result = beat => match result {
                Ok(()) => {
                    let beats_sent = {
                        let mut metrics = lock(&shared.metrics);
                        metrics.record_beat(MARKER.len());
                        metrics.beats_sent
                    };
                    tracing::debug!(name = %name, beats_sent, "beacon sent marker");
                }
                Err(e) => break (CloseReason::WriteFailed(e.to_string()), false),
            }
        }
    };

    // Best effort FIN for the peer; the connection is dropped anyway.
    // Shutting down flushes first, which must not outlive a stuck peer.
    if !reason.is_failure() && !mid_write {
        if let Err(_elapsed) = tokio::time::timeout(FIN_TIMEOUT, stream.shutdown()).await {
            tracing::debug!(name = %name, "beacon gave up on clean shutdown");
        }
    }
    drop(stream);
    shared.lifecycle.finish(reason);
}

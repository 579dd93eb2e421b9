//! # Moonpool Heartbeat
//!
//! Liveness monitoring over a persistent stream connection.
//!
//! This crate provides:
//! - **Beacon**: writes a liveness marker every interval, optionally for a
//!   bounded lifetime, and closes itself on the first write failure
//! - **Monitor**: counts consecutive timeout windows without a read and
//!   declares the peer dead once the count exceeds a threshold
//!
//! ```text
//! Beacon                               Monitor
//!   │── "ok" ─────────────────────────►│  read within timeout → misses = 0
//!   │── "ok" ─────────────────────────►│
//!   │                                  │
//!   │    ✗ (beacon gone)               │  timeout → misses = 1
//!   │                                  │  timeout → misses = 2 > threshold
//!   │                                  │  → monitor closes
//! ```
//!
//! Both sides own exactly one connection, expose thread-safe setters for
//! their tunables, and close idempotently. Recovery (re-dial, re-accept)
//! belongs to whoever supervises them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use moonpool_heartbeat::{Beacon, BeaconConfig, TokioNetworkProvider};
//!
//! let network = TokioNetworkProvider::new();
//! let beacon = Beacon::connect(&network, "beacon", "127.0.0.1:4500",
//!     BeaconConfig::local_network()).await?;
//! beacon.run()?;
//! let reason = beacon.closed().await;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Emitting side.
pub mod beacon;

/// Configuration structures.
pub mod config;

/// Error and close-reason types.
pub mod error;

/// Shared lifecycle states.
pub mod lifecycle;

/// Counters exposed by both sides.
pub mod metrics;

/// Receiving side.
pub mod monitor;

/// Dial and accept collaborators.
pub mod network;

/// Liveness marker written by beacons on every tick.
///
/// Monitors accept any bytes, this value is never parsed.
pub const MARKER: &[u8] = b"ok";

pub use beacon::Beacon;
pub use config::{BeaconConfig, MonitorConfig};
pub use error::{CloseReason, HeartbeatError, HeartbeatResult};
pub use lifecycle::LifecycleState;
pub use metrics::{BeaconMetrics, MonitorMetrics};
pub use monitor::Monitor;
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};

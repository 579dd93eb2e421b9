//! Configuration structures for beacons and monitors.
//!
//! Both configs only seed the initial tunables. Every field stays mutable
//! after construction through the instance setters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the emitting side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Delay between two markers.
    pub interval: Duration,

    /// Maximum running time before the beacon closes itself.
    /// None means the beacon runs until closed or the transport breaks.
    pub lifetime: Option<Duration>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            lifetime: None,
        }
    }
}

impl BeaconConfig {
    /// Create a configuration with the given interval and lifetime bound.
    pub fn new(interval: Duration, lifetime: Option<Duration>) -> Self {
        Self { interval, lifetime }
    }

    /// Set the emission interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bound the total running time of the beacon.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            interval: Duration::from_millis(100),
            lifetime: None,
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            interval: Duration::from_secs(2),
            lifetime: None,
        }
    }
}

/// Configuration for the receiving side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Window within which some byte must arrive, else a miss is counted.
    pub timeout: Duration,

    /// Consecutive misses tolerated. The monitor closes once the counter
    /// goes strictly above this value.
    pub threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            threshold: 3,
        }
    }
}

impl MonitorConfig {
    /// Create a configuration with the given window and threshold.
    pub fn new(timeout: Duration, threshold: u32) -> Self {
        Self { timeout, threshold }
    }

    /// Set the timeout window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the miss threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Create a configuration for low-latency local networking.
    ///
    /// Pairs with [`BeaconConfig::local_network`].
    pub fn local_network() -> Self {
        Self {
            timeout: Duration::from_millis(300),
            threshold: 3,
        }
    }

    /// Create a configuration for high-latency WAN networking.
    ///
    /// Pairs with [`BeaconConfig::wan_network`].
    pub fn wan_network() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            threshold: 5,
        }
    }

    /// Whether a beacon with `beacon`'s interval can keep this monitor
    /// from counting misses on a healthy link.
    ///
    /// The window has to be strictly longer than the interval.
    pub fn tolerates(&self, beacon: &BeaconConfig) -> bool {
        self.timeout > beacon.interval
    }
}

//! Metrics snapshots for beacons and monitors.

use tokio::time::Instant;

/// Counters kept by a beacon's emission loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeaconMetrics {
    /// Markers fully written and flushed.
    pub beats_sent: u64,
    /// Bytes written, markers only.
    pub bytes_sent: u64,
    /// When the last marker was flushed.
    pub last_beat_at: Option<Instant>,
}

impl BeaconMetrics {
    pub(crate) fn record_beat(&mut self, bytes: usize) {
        self.beats_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_beat_at = Some(Instant::now());
    }
}

/// Counters kept by a monitor's miss-counting loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorMetrics {
    /// Successful reads. One window can hold several.
    pub heartbeats_received: u64,
    /// Bytes read, whatever their content.
    pub bytes_received: u64,
    /// Windows that elapsed with nothing read, over the whole run.
    pub total_misses: u64,
    /// Current consecutive-miss counter.
    pub consecutive_misses: u32,
    /// When the last read completed.
    pub last_heartbeat_at: Option<Instant>,
}

impl MonitorMetrics {
    pub(crate) fn record_heartbeat(&mut self, bytes: usize) {
        self.heartbeats_received += 1;
        self.bytes_received += bytes as u64;
        self.last_heartbeat_at = Some(Instant::now());
    }

    pub(crate) fn record_miss(&mut self) {
        self.total_misses += 1;
    }
}

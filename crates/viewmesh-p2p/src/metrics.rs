//! Passive bandwidth accounting.
//!
//! Counts bytes written to and read from the wire. An external metrics
//! sink polls [`BandwidthMetrics::snapshot`]; this layer never pushes
//! reports on its own.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters shared between the wire codec and the metrics sink.
#[derive(Debug, Default)]
pub struct BandwidthMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl BandwidthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        BandwidthSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = BandwidthMetrics::new();
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(7);

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.bytes_received, 7);
    }

    #[test]
    fn fresh_metrics_read_zero() {
        let snap = BandwidthMetrics::new().snapshot();
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.bytes_received, 0);
    }
}

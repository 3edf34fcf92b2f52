//! Byte accounting for connections.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts encoded bytes crossing the wire in each direction.
///
/// Only frames that were actually handed to (or received from) the
/// socket are counted; control frames are not.
#[derive(Debug, Default)]
pub struct IoCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl IoCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing frame.
    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an incoming frame.
    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Total bytes sent.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Total bytes received.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = IoCounters::new();
        counters.record_sent(10);
        counters.record_sent(5);
        counters.record_received(7);

        assert_eq!(counters.sent(), 15);
        assert_eq!(counters.received(), 7);
    }
}

//! Handler statistics
//!
//! Atomic counters shared between the event loop, the connection tasks and
//! [`HandlerControl`](super::HandlerControl) consumers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic handler-wide statistics
#[derive(Debug, Default)]
pub struct HandlerStats {
    /// Currently established outbound connections
    outgoing_active: AtomicUsize,
    /// Currently established inbound connections
    incoming_active: AtomicUsize,
    /// Outbound connections established over the handler's lifetime
    total_outgoing: AtomicU64,
    /// Inbound connections admitted over the handler's lifetime
    total_incoming: AtomicU64,
    /// Terminal and retried connect failures
    connect_failures: AtomicU64,
    /// Retries started (each under a fresh connection id)
    retries: AtomicU64,
    /// Total bytes read across all connections
    bytes_read: AtomicU64,
    /// Total bytes written across all connections
    bytes_written: AtomicU64,
    /// Complete messages delivered to the embedder
    messages_received: AtomicU64,
}

impl HandlerStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_outgoing_established(&self) {
        self.outgoing_active.fetch_add(1, Ordering::Relaxed);
        self.total_outgoing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_incoming_established(&self) {
        self.incoming_active.fetch_add(1, Ordering::Relaxed);
        self.total_incoming.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self, outgoing: bool) {
        let gauge = if outgoing {
            &self.outgoing_active
        } else {
            &self.incoming_active
        };
        gauge.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_messages(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Currently established outbound connections
    #[must_use]
    pub fn outgoing_active(&self) -> usize {
        self.outgoing_active.load(Ordering::Relaxed)
    }

    /// Currently established inbound connections
    #[must_use]
    pub fn incoming_active(&self) -> usize {
        self.incoming_active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            outgoing_active: self.outgoing_active(),
            incoming_active: self.incoming_active(),
            total_outgoing: self.total_outgoing.load(Ordering::Relaxed),
            total_incoming: self.total_incoming.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`HandlerStats`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Currently established outbound connections
    pub outgoing_active: usize,
    /// Currently established inbound connections
    pub incoming_active: usize,
    /// Outbound connections established over the handler's lifetime
    pub total_outgoing: u64,
    /// Inbound connections admitted over the handler's lifetime
    pub total_incoming: u64,
    /// Connect failures observed
    pub connect_failures: u64,
    /// Retries started
    pub retries: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Messages delivered to the embedder
    pub messages_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_track_connections() {
        let stats = HandlerStats::new();
        stats.record_outgoing_established();
        stats.record_outgoing_established();
        stats.record_incoming_established();
        assert_eq!(stats.outgoing_active(), 2);
        assert_eq!(stats.incoming_active(), 1);

        stats.record_disconnect(true);
        stats.record_disconnect(false);
        assert_eq!(stats.outgoing_active(), 1);
        assert_eq!(stats.incoming_active(), 0);

        let snap = stats.snapshot();
        assert_eq!(snap.total_outgoing, 2);
        assert_eq!(snap.total_incoming, 1);
    }

    #[test]
    fn test_byte_counters() {
        let stats = HandlerStats::new();
        stats.record_read(100);
        stats.record_written(250);
        stats.record_messages(3);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.bytes_written, 250);
        assert_eq!(snap.messages_received, 3);
    }
}

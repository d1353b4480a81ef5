//! Atomics-based operational counters.
//!
//! Grounded directly on `cognitod/src/metrics.rs`'s `Metrics` struct: one
//! atomic per counter, `Ordering::Relaxed` everywhere (these numbers feed
//! logging/diagnostics, not synchronization), plain `inc_*`/getter pairs.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    ring_overflows: AtomicU64,
    dropped_samples: AtomicU64,
    perf_poll_errors: AtomicU64,
    sender_backpressure_events: AtomicU64,
    kernel_ring_lost_records: AtomicU64,
    annotation_clients_accepted: AtomicU64,
    annotation_clients_dropped: AtomicU64,
    cpu_hotplug_events: AtomicU64,
    frames_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ring_overflows(&self) {
        self.ring_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_samples(&self, n: u64) {
        self.dropped_samples.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_perf_poll_errors(&self) {
        self.perf_poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sender_backpressure(&self) {
        self.sender_backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_kernel_ring_lost(&self, n: u64) {
        self.kernel_ring_lost_records.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_annotation_client_accepted(&self) {
        self.annotation_clients_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_annotation_client_dropped(&self) {
        self.annotation_clients_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cpu_hotplug_events(&self) {
        self.cpu_hotplug_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self, bytes: u64) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_emitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn ring_overflows(&self) -> u64 {
        self.ring_overflows.load(Ordering::Relaxed)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted.load(Ordering::Relaxed)
    }

    pub fn kernel_ring_lost(&self) -> u64 {
        self.kernel_ring_lost_records.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.ring_overflows(), 0);
        assert_eq!(m.frames_emitted(), 0);
    }

    #[test]
    fn frame_recording_accumulates_bytes_and_count() {
        let m = Metrics::new();
        m.record_frame(100);
        m.record_frame(50);
        assert_eq!(m.frames_emitted(), 2);
        assert_eq!(m.bytes_emitted(), 150);
    }

    #[test]
    fn lost_records_accumulate() {
        let m = Metrics::new();
        m.inc_kernel_ring_lost(3);
        m.inc_kernel_ring_lost(4);
        assert_eq!(m.kernel_ring_lost(), 7);
    }
}

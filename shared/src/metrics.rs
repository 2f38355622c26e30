use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct QueueMetrics {
    // Enqueue path
    pub enqueued: AtomicU64,
    pub sent_immediately: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub invalid_rejections: AtomicU64,
    pub fast_path_timeouts: AtomicU64,

    // Consumer loop
    pub sent_from_queue: AtomicU64,
    pub transient_failures: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub cancelled: AtomicU64,
    pub window_resets: AtomicU64,

    pub persistence_failures: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent_immediately: self.sent_immediately.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            invalid_rejections: self.invalid_rejections.load(Ordering::Relaxed),
            fast_path_timeouts: self.fast_path_timeouts.load(Ordering::Relaxed),
            sent_from_queue: self.sent_from_queue.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            window_resets: self.window_resets.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub sent_immediately: u64,
    pub duplicate_rejections: u64,
    pub invalid_rejections: u64,
    pub fast_path_timeouts: u64,
    pub sent_from_queue: u64,
    pub transient_failures: u64,
    pub stale_dropped: u64,
    pub cancelled: u64,
    pub window_resets: u64,
    pub persistence_failures: u64,
}

impl MetricsSnapshot {
    pub fn total_sent(&self) -> u64 {
        self.sent_immediately + self.sent_from_queue
    }
}

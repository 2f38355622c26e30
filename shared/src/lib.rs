// lib.rs - Rate-limited SMS queue engine

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod rate_window;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use model::{
    BusinessKey, BusinessStatus, Destination, PayloadFields, QueueItem, SendRequest, UnixTimeMs,
};
pub use queue::{EnqueueOutcome, QueueDeps, QueueError, QueueManager, QueueStatus};
pub use rate_window::{DelayPolicy, RateWindow};
pub use store::{FileQueueStore, KvQueueStore, QueueState, QueueStore, StoreError};

/// Length of one transport quota window (30 minutes).
pub const DEFAULT_WINDOW_DURATION_MS: u64 = 30 * 60 * 1000;
/// Sends allowed per window when no elevated quota is detected.
pub const DEFAULT_QUOTA_CEILING: u32 = 30;
/// Largest probed ceiling accepted as plausible.
pub const MAX_QUOTA_CEILING: u32 = 10_000;
pub const DEFAULT_FAST_PATH_TIMEOUT_MS: u64 = 5_000;
/// Dequeues between two staleness sweeps.
pub const DEFAULT_CLEANUP_EVERY: u32 = 10;

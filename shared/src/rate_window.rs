use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::UnixTimeMs;

/// Quota accounting for the transport's fixed send window.
///
/// Passive state: `record_send` does not check the ceiling, the owning
/// `QueueManager` does that under its lock before every send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: UnixTimeMs,
    pub sent_count: u32,
    pub quota_ceiling: u32,
    pub window_duration_ms: u64,
}

impl RateWindow {
    pub fn new(now: UnixTimeMs, quota_ceiling: u32, window_duration_ms: u64) -> Self {
        Self {
            window_start: now,
            sent_count: 0,
            quota_ceiling,
            window_duration_ms,
        }
    }

    pub fn record_send(&mut self) {
        self.sent_count = self.sent_count.saturating_add(1);
    }

    /// Start a new window if the current one has run its full duration.
    /// Returns true only on the call that performed the reset.
    pub fn reset_if_expired(&mut self, now: UnixTimeMs) -> bool {
        if now.millis_since(self.window_start) < self.window_duration_ms {
            return false;
        }
        self.window_start = now;
        self.sent_count = 0;
        true
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.quota_ceiling.saturating_sub(self.sent_count)
    }

    pub fn resets_at(&self) -> UnixTimeMs {
        self.window_start.saturating_add_ms(self.window_duration_ms)
    }

    /// Time left until the window boundary, zero once it has passed.
    pub fn until_reset(&self, now: UnixTimeMs) -> Duration {
        Duration::from_millis(self.resets_at().millis_since(now))
    }
}

/// Graduated inter-send delays inside one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayPolicy {
    /// Sends that still count as the opening burst.
    pub burst_threshold: u32,
    pub short_delay_ms: u64,
    pub medium_delay_ms: u64,
    pub throttle_delay_ms: u64,
    /// Share of the ceiling (percent) after which the throttle delay applies.
    pub throttle_percent: u8,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            burst_threshold: 5,
            short_delay_ms: 1_000,
            medium_delay_ms: 3_000,
            throttle_delay_ms: 10_000,
            throttle_percent: 80,
        }
    }
}

impl DelayPolicy {
    /// Delay before the next send given the window state after the last one.
    pub fn calculate_delay(&self, window: &RateWindow, window_just_reset: bool) -> Duration {
        if window_just_reset || window.sent_count == 0 {
            return Duration::ZERO;
        }

        let throttle_from =
            u64::from(window.quota_ceiling) * u64::from(self.throttle_percent) / 100;
        let sent = u64::from(window.sent_count);

        let ms = if sent >= throttle_from {
            self.throttle_delay_ms
        } else if window.sent_count <= self.burst_threshold {
            self.short_delay_ms
        } else {
            self.medium_delay_ms
        };
        Duration::from_millis(ms)
    }
}

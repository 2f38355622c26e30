use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::QueueError;
use crate::rate_window::DelayPolicy;
use crate::store::MAX_PERSISTED_ITEMS;
use crate::{
    DEFAULT_CLEANUP_EVERY, DEFAULT_FAST_PATH_TIMEOUT_MS, DEFAULT_QUOTA_CEILING,
    DEFAULT_WINDOW_DURATION_MS, MAX_QUOTA_CEILING,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub window_duration_ms: u64,
    pub default_quota_ceiling: u32,
    pub max_quota_ceiling: u32,
    pub fast_path_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub max_idle_wait_ms: u64,
    pub cleanup_every: u32,
    pub max_queue_len: usize,
    pub join_timeout_ms: u64,
    pub delay: DelayPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: DEFAULT_WINDOW_DURATION_MS,
            default_quota_ceiling: DEFAULT_QUOTA_CEILING,
            max_quota_ceiling: MAX_QUOTA_CEILING,
            fast_path_timeout_ms: DEFAULT_FAST_PATH_TIMEOUT_MS,
            send_timeout_ms: 60_000,
            retry_delay_ms: 10_000,
            retry_jitter_ms: 1_000,
            max_idle_wait_ms: 60_000,
            cleanup_every: DEFAULT_CLEANUP_EVERY,
            max_queue_len: 10_000,
            join_timeout_ms: 5_000,
            delay: DelayPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.window_duration_ms == 0 {
            return Err(QueueError::Config("window_duration_ms must be > 0".into()));
        }
        if self.default_quota_ceiling == 0 {
            return Err(QueueError::Config("default_quota_ceiling must be > 0".into()));
        }
        if self.default_quota_ceiling > self.max_quota_ceiling {
            return Err(QueueError::Config(format!(
                "default_quota_ceiling {} exceeds max_quota_ceiling {}",
                self.default_quota_ceiling, self.max_quota_ceiling
            )));
        }
        if self.fast_path_timeout_ms == 0 {
            return Err(QueueError::Config("fast_path_timeout_ms must be > 0".into()));
        }
        if self.send_timeout_ms == 0 {
            return Err(QueueError::Config("send_timeout_ms must be > 0".into()));
        }
        if self.max_idle_wait_ms == 0 {
            return Err(QueueError::Config("max_idle_wait_ms must be > 0".into()));
        }
        if self.cleanup_every == 0 {
            return Err(QueueError::Config("cleanup_every must be > 0".into()));
        }
        if self.max_queue_len == 0 {
            return Err(QueueError::Config("max_queue_len must be > 0".into()));
        }
        if self.max_queue_len > MAX_PERSISTED_ITEMS {
            return Err(QueueError::Config(format!(
                "max_queue_len {} exceeds the {} items a persisted state may hold",
                self.max_queue_len, MAX_PERSISTED_ITEMS
            )));
        }
        if !(1..=100).contains(&self.delay.throttle_percent) {
            return Err(QueueError::Config(
                "delay.throttle_percent must be between 1 and 100".into(),
            ));
        }
        Ok(())
    }

    pub fn fast_path_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_path_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn max_idle_wait(&self) -> Duration {
        Duration::from_millis(self.max_idle_wait_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Fixed retry delay plus random jitter.
    pub fn retry_delay(&self) -> Duration {
        use rand::Rng;
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.retry_jitter_ms)
        };
        Duration::from_millis(self.retry_delay_ms.saturating_add(jitter))
    }
}

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::QueueItem;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The transport itself reported that its quota is spent.
    #[error("transport has no capacity")]
    NoCapacity,

    #[error("network unavailable: {0}")]
    Network(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Rejected(_))
    }
}

/// Delivers a fully described message over the rate-limited transport.
///
/// Expected failures (no capacity, no network) come back as `Err`; they are
/// never panics. Building the final text from `payload_fields` is the
/// implementor's job.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// One attempt, no retries. The queue bounds the wait with
    /// `min(immediate_timeout(), fast_path_timeout)`.
    async fn try_send_immediate(&self, item: &QueueItem) -> Result<(), SendError>;

    /// Normal path. May retry internally before giving up.
    async fn send_with_retry(&self, item: &QueueItem) -> Result<(), SendError>;

    /// How long this transport normally needs to confirm one send.
    fn immediate_timeout(&self) -> Duration {
        Duration::from_secs(crate::DEFAULT_FAST_PATH_TIMEOUT_MS / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_final() {
        assert!(SendError::NoCapacity.is_retryable());
        assert!(SendError::Network("offline".into()).is_retryable());
        assert!(SendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!SendError::Rejected("bad number".into()).is_retryable());
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{BusinessKey, BusinessStatus, QueueItem};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("status lookup failed: {0}")]
    Lookup(String),
}

/// Answers whether a queued item's business condition still holds.
///
/// The queue treats `Err` as "still relevant": a failed lookup must never
/// silently drop a real notification.
#[async_trait]
pub trait StatusOracle: Send + Sync {
    async fn is_still_relevant(&self, item: &QueueItem) -> Result<bool, OracleError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRelevant;

#[async_trait]
impl StatusOracle for AlwaysRelevant {
    async fn is_still_relevant(&self, _item: &QueueItem) -> Result<bool, OracleError> {
        Ok(true)
    }
}

/// Latest known business status per key, fed from the tracking cache.
///
/// An item stays relevant while its key is unknown or still reports the
/// status it was enqueued under.
#[derive(Debug, Default)]
pub struct SnapshotOracle {
    statuses: RwLock<HashMap<BusinessKey, BusinessStatus>>,
}

impl SnapshotOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, key: BusinessKey, status: BusinessStatus) {
        self.statuses.write().await.insert(key, status);
    }

    pub async fn replace_all(&self, snapshot: HashMap<BusinessKey, BusinessStatus>) {
        *self.statuses.write().await = snapshot;
    }

    pub async fn forget(&self, key: &BusinessKey) {
        self.statuses.write().await.remove(key);
    }
}

#[async_trait]
impl StatusOracle for SnapshotOracle {
    async fn is_still_relevant(&self, item: &QueueItem) -> Result<bool, OracleError> {
        let statuses = self.statuses.read().await;
        Ok(statuses
            .get(&item.business_key)
            .map_or(true, |current| *current == item.status_at_enqueue))
    }
}

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sms_queue::capabilities::{MemoryKv, MessageSender, SendError, StatusOracle};
use sms_queue::{
    BusinessKey, BusinessStatus, KvQueueStore, ManualClock, QueueConfig, QueueDeps, QueueItem,
    QueueManager, QueueState, QueueStore, RateWindow, UnixTimeMs,
};
use tokio::time::Instant;

pub const WINDOW_MS: u64 = 30 * 60 * 1000;
pub const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);
pub const IN_TRANSIT: BusinessStatus = BusinessStatus(3);
pub const DELIVERED: BusinessStatus = BusinessStatus(7);

pub type MemStore = KvQueueStore<MemoryKv>;

/// Scriptable transport that records every successful delivery.
#[derive(Default)]
pub struct FakeSender {
    pub fail_immediate: AtomicBool,
    pub fail_normal: AtomicBool,
    pub stall_normal: AtomicBool,
    pub immediate_calls: AtomicU32,
    pub normal_calls: AtomicU32,
    deliveries: Mutex<Vec<(String, Instant)>>,
}

impl FakeSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn delivery_times(&self) -> Vec<Instant> {
        self.deliveries.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    fn record(&self, item: &QueueItem) {
        self.deliveries
            .lock()
            .unwrap()
            .push((item.business_key.to_string(), Instant::now()));
    }
}

#[async_trait]
impl MessageSender for FakeSender {
    async fn try_send_immediate(&self, item: &QueueItem) -> Result<(), SendError> {
        self.immediate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_immediate.load(Ordering::SeqCst) {
            return Err(SendError::NoCapacity);
        }
        self.record(item);
        Ok(())
    }

    async fn send_with_retry(&self, item: &QueueItem) -> Result<(), SendError> {
        self.normal_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_normal.load(Ordering::SeqCst) {
            return std::future::pending::<Result<(), SendError>>().await;
        }
        if self.fail_normal.load(Ordering::SeqCst) {
            return Err(SendError::Network("modem offline".into()));
        }
        self.record(item);
        Ok(())
    }
}

pub fn item(key: &str) -> QueueItem {
    QueueItem::new(key, "+38970000000", IN_TRANSIT, START).unwrap()
}

pub fn key(k: &str) -> BusinessKey {
    BusinessKey::new(k).unwrap()
}

pub fn config() -> QueueConfig {
    QueueConfig {
        retry_jitter_ms: 0,
        ..QueueConfig::default()
    }
}

pub fn mem_store() -> Arc<MemStore> {
    Arc::new(KvQueueStore::new(MemoryKv::new()).unwrap())
}

/// Persist a window that started at `START` with `sent_count` sends used.
pub async fn seed_window(store: &dyn QueueStore, sent_count: u32, items: &[&str]) {
    let mut window = RateWindow::new(START, 30, WINDOW_MS);
    window.sent_count = sent_count;
    let mut state = QueueState::new(window);
    state.items = items.iter().map(|k| item(k)).collect();
    store.save_state(&state).await.unwrap();
}

pub async fn manager(
    store: Arc<dyn QueueStore>,
    sender: Arc<FakeSender>,
    oracle: Arc<dyn StatusOracle>,
    clock: &ManualClock,
) -> QueueManager {
    let deps = QueueDeps::new(store, sender)
        .with_oracle(oracle)
        .with_clock(Arc::new(clock.clone()));
    QueueManager::new(config(), deps).await.unwrap()
}

/// Sleep on paused time long enough for any pending consumer step to run.
pub async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

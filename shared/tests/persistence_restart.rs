mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use sms_queue::capabilities::{
    AlwaysRelevant, KeyValueStore, KvError, KvKey, MemoryKv, StorageErrorCode,
};
use sms_queue::{
    EnqueueOutcome, FileQueueStore, KvQueueStore, ManualClock, QueueDeps, QueueError, QueueManager,
    QueueStore,
};

/// Memory backend whose next read fails as if the database were locked.
#[derive(Default)]
struct FlakyKv {
    inner: MemoryKv,
    fail_next_get: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyKv {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        if self.fail_next_get.swap(false, Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::Busy, "database is locked"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        self.inner.delete(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn restart_keeps_queue_and_window() {
    let store = mem_store();
    seed_window(&*store, 30, &[]).await;
    let clock = ManualClock::new(START);

    let first = manager(store.clone(), FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;
    assert_eq!(first.enqueue(item("T1")).await.unwrap(), EnqueueOutcome::Queued);
    assert_eq!(first.enqueue(item("T2")).await.unwrap(), EnqueueOutcome::Queued);
    first.shutdown().await;
    drop(first);

    let sender = FakeSender::new();
    let second = manager(store.clone(), sender.clone(), Arc::new(AlwaysRelevant), &clock).await;

    let status = second.status().await;
    assert_eq!(status.queued, 2);
    assert_eq!(status.sent_count, 30);
    assert!(status.worker_running);
    assert_eq!(
        second.enqueue(item("T1")).await.unwrap(),
        EnqueueOutcome::AlreadyQueued
    );

    clock.advance_ms(WINDOW_MS);
    settle(120).await;

    assert_eq!(sender.delivered(), vec!["T1", "T2"]);
    assert_eq!(second.status().await.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_keys_collapse_on_load() {
    let store = mem_store();
    seed_window(&*store, 30, &["T1", "T2", "T1", "T3", "T2"]).await;
    let clock = ManualClock::new(START);

    let m = manager(store.clone(), FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;

    assert_eq!(m.queued_keys().await, vec![key("T1"), key("T2"), key("T3")]);
    let persisted = store.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.items.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn interrupted_send_is_delivered_once_after_restart() {
    let store = mem_store();
    let clock = ManualClock::new(START);

    let stuck = FakeSender::new();
    stuck.fail_immediate.store(true, Ordering::SeqCst);
    stuck.stall_normal.store(true, Ordering::SeqCst);
    let first = manager(store.clone(), stuck.clone(), Arc::new(AlwaysRelevant), &clock).await;
    first.enqueue(item("T1")).await.unwrap();
    settle(1).await;
    first.shutdown().await;
    drop(first);
    assert!(stuck.delivered().is_empty());

    let healthy = FakeSender::new();
    let second = manager(store.clone(), healthy.clone(), Arc::new(AlwaysRelevant), &clock).await;
    settle(10).await;

    assert_eq!(healthy.delivered(), vec!["T1"]);
    assert_eq!(second.status().await.sent_count, 1);
    assert!(store.load_state().await.unwrap().unwrap().items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_startup_read_leaves_state_untouched() {
    let store = Arc::new(KvQueueStore::new(FlakyKv::default()).unwrap());
    seed_window(&*store, 30, &["T1", "T2"]).await;
    store.kv().fail_next_get.store(true, Ordering::SeqCst);
    let clock = ManualClock::new(START);

    let deps = QueueDeps::new(store.clone(), FakeSender::new())
        .with_clock(Arc::new(clock.clone()));
    let result = QueueManager::new(config(), deps).await;
    assert!(matches!(result, Err(QueueError::Storage(e)) if e.is_retryable()));

    let persisted = store.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.items.len(), 2);
    assert_eq!(persisted.window.sent_count, 30);

    let m = manager(store.clone(), FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;
    let status = m.status().await;
    assert_eq!(status.queued, 2);
    assert_eq!(status.sent_count, 30);
    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sms_queue.bin");
    let clock = ManualClock::new(START);

    let store = Arc::new(FileQueueStore::new(&path));
    seed_window(&*store, 30, &[]).await;
    let first = manager(store, FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;
    first.enqueue(item("T1")).await.unwrap();
    first.shutdown().await;
    drop(first);

    let reopened = Arc::new(FileQueueStore::new(&path));
    let second = manager(reopened, FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;

    assert_eq!(second.queued_keys().await, vec![key("T1")]);
    assert_eq!(second.status().await.sent_count, 30);
    second.shutdown().await;
}

#[cfg(feature = "sqlite")]
#[tokio::test(start_paused = true)]
async fn sqlite_store_survives_restart() {
    use sms_queue::capabilities::SqliteKv;
    use sms_queue::KvQueueStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.sqlite");
    let clock = ManualClock::new(START);

    {
        let store = Arc::new(KvQueueStore::new(SqliteKv::open(&path).unwrap()).unwrap());
        seed_window(&*store, 30, &[]).await;
        let m = manager(store, FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;
        m.enqueue(item("T1")).await.unwrap();
        m.enqueue(item("T2")).await.unwrap();
        m.shutdown().await;
    }

    let store = Arc::new(KvQueueStore::new(SqliteKv::open(&path).unwrap()).unwrap());
    let m = manager(store, FakeSender::new(), Arc::new(AlwaysRelevant), &clock).await;

    assert_eq!(m.queued_keys().await, vec![key("T1"), key("T2")]);
    m.shutdown().await;
}

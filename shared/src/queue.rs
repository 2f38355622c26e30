//! Rate-limited outbound SMS queue.
//!
//! `QueueManager` owns the pending items and the quota window behind one
//! lock. Callers get a synchronous answer from [`QueueManager::enqueue`]:
//! either the message went out on the fast path, or it now sits in the
//! durable queue and a single background consumer drains it while the
//! window allows.
//!
//! The lock is only held to read and mutate state. Every mutation takes a
//! numbered checkpoint under the lock; the checkpoint is written after the
//! lock is released, and a checkpoint older than one already written is
//! skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::capabilities::{
    resolve_quota_ceiling, AlwaysRelevant, CapacityProbe, MessageSender, NoProbe, SendError,
    StatusOracle,
};
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::model::{BusinessKey, QueueItem, SendRequest, UnixTimeMs};
use crate::rate_window::RateWindow;
use crate::store::{QueueState, QueueStore, StoreError};

/// How often the consumer re-checks while every free unit of quota is
/// reserved by a fast-path send in progress.
const RESERVATION_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("queue is full ({0} items)")]
    Full(usize),

    #[error("queue manager is shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Delivered on the fast path; never entered the durable queue.
    SentImmediately,
    /// Appended to the durable queue; the consumer will deliver it.
    Queued,
    /// The key is already queued or being sent. Nothing changed.
    AlreadyQueued,
    /// `remove_from_queue` ran while the fast-path send was pending and that
    /// send failed, so the item was dropped instead of queued.
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub in_flight: usize,
    pub sent_count: u32,
    pub quota_ceiling: u32,
    pub remaining_capacity: u32,
    pub window_resets_at: UnixTimeMs,
    pub worker_running: bool,
}

/// Collaborators the manager is built from.
pub struct QueueDeps {
    pub store: Arc<dyn QueueStore>,
    pub sender: Arc<dyn MessageSender>,
    pub oracle: Arc<dyn StatusOracle>,
    pub probe: Box<dyn CapacityProbe>,
    pub clock: Arc<dyn Clock>,
}

impl QueueDeps {
    pub fn new(store: Arc<dyn QueueStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            store,
            sender,
            oracle: Arc::new(AlwaysRelevant),
            probe: Box::new(NoProbe),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn StatusOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn CapacityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ============================================================================
// Locked State
// ============================================================================

struct QueueInner {
    items: VecDeque<QueueItem>,
    window: RateWindow,
    /// Keys with a delivery attempt in progress, fast path or consumer.
    in_flight: HashSet<BusinessKey>,
    /// In-flight keys removed by the caller; dropped instead of re-queued.
    cancelled: HashSet<BusinessKey>,
    /// Quota units held by in-flight attempts.
    reserved: u32,
    /// The item the consumer is currently delivering.
    worker_item: Option<QueueItem>,
    dequeues_since_cleanup: u32,
    worker: Option<JoinHandle<()>>,
    shut_down: bool,
    checkpoint_seq: u64,
}

/// State captured under the lock, persisted after it is released.
struct Checkpoint {
    seq: u64,
    state: QueueState,
}

impl QueueInner {
    fn contains(&self, key: &BusinessKey) -> bool {
        self.in_flight.contains(key) || self.items.iter().any(|i| i.key() == key)
    }

    fn available(&self) -> u32 {
        self.window.remaining_capacity().saturating_sub(self.reserved)
    }

    fn reserve(&mut self, key: BusinessKey) {
        self.in_flight.insert(key);
        self.reserved = self.reserved.saturating_add(1);
    }

    /// Returns true if the key was cancelled while in flight.
    fn release(&mut self, key: &BusinessKey) -> bool {
        self.in_flight.remove(key);
        self.reserved = self.reserved.saturating_sub(1);
        if self.worker_item.as_ref().is_some_and(|i| i.key() == key) {
            self.worker_item = None;
        }
        self.cancelled.remove(key)
    }

    fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn checkpoint(&mut self) -> Checkpoint {
        self.checkpoint_seq += 1;
        Checkpoint {
            seq: self.checkpoint_seq,
            state: QueueState {
                items: self.items.clone(),
                window: self.window.clone(),
            },
        }
    }
}

enum Step {
    Exit,
    Cleanup,
    Wait(Duration),
    Send { item: QueueItem, burst: bool },
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueInner>,
    /// Sequence number of the last checkpoint handed to the store.
    last_saved: Mutex<u64>,
    store: Arc<dyn QueueStore>,
    sender: Arc<dyn MessageSender>,
    oracle: Arc<dyn StatusOracle>,
    clock: Arc<dyn Clock>,
    metrics: QueueMetrics,
    cancel: CancellationToken,
}

impl Shared {
    /// Never called with the state lock held.
    async fn persist(&self, checkpoint: Checkpoint) {
        let mut last_saved = self.last_saved.lock().await;
        if checkpoint.seq <= *last_saved {
            debug!(seq = checkpoint.seq, "Skipping superseded checkpoint");
            return;
        }
        *last_saved = checkpoint.seq;

        if let Err(e) = self.store.save_state(&checkpoint.state).await {
            QueueMetrics::incr(&self.metrics.persistence_failures);
            error!(
                error = %e,
                retryable = e.is_retryable(),
                queued = checkpoint.state.items.len(),
                "Failed to persist queue state"
            );
        }
    }

    fn reset_window_if_expired(&self, inner: &mut QueueInner) -> bool {
        let reset = inner.window.reset_if_expired(self.clock.now());
        if reset {
            QueueMetrics::incr(&self.metrics.window_resets);
            info!(
                quota_ceiling = inner.window.quota_ceiling,
                queued = inner.items.len(),
                "Quota window reset"
            );
        }
        reset
    }

    fn ensure_worker(self: &Arc<Self>, inner: &mut QueueInner) {
        if inner.shut_down || inner.items.is_empty() || inner.worker_running() {
            return;
        }
        debug!(queued = inner.items.len(), "Starting queue consumer");
        inner.worker = Some(tokio::spawn(run_consumer(Arc::clone(self))));
    }

    /// Append to the tail, start the consumer and persist.
    async fn append(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, QueueInner>,
        item: QueueItem,
    ) -> Result<EnqueueOutcome, QueueError> {
        if inner.items.len() >= self.config.max_queue_len {
            warn!(max = self.config.max_queue_len, "Queue full, rejecting item");
            return Err(QueueError::Full(self.config.max_queue_len));
        }

        inner.items.push_back(item);
        QueueMetrics::incr(&self.metrics.enqueued);
        self.ensure_worker(&mut inner);
        let queued = inner.items.len();
        let checkpoint = inner.checkpoint();
        drop(inner);

        self.persist(checkpoint).await;
        info!(queued, "Queued for later delivery");
        Ok(EnqueueOutcome::Queued)
    }

    /// Runs on its own task so the reservation taken by `enqueue` is always
    /// settled, even when the caller stops waiting.
    async fn finish_immediate(
        self: Arc<Self>,
        item: QueueItem,
    ) -> Result<EnqueueOutcome, QueueError> {
        let key = item.key().clone();
        let attempt = self.send_immediate(&item).await;
        if let Err(SendError::Timeout(bound)) = &attempt {
            QueueMetrics::incr(&self.metrics.fast_path_timeouts);
            debug!(bound_ms = bound.as_millis() as u64, "Immediate send timed out");
        }

        let mut inner = self.state.lock().await;
        let cancelled = inner.release(&key);

        match attempt {
            Ok(()) => {
                inner.window.record_send();
                QueueMetrics::incr(&self.metrics.sent_immediately);
                let sent_count = inner.window.sent_count;
                let checkpoint = inner.checkpoint();
                drop(inner);

                self.persist(checkpoint).await;
                info!(sent_count, "Sent immediately");
                Ok(EnqueueOutcome::SentImmediately)
            }
            Err(e) if cancelled => {
                QueueMetrics::incr(&self.metrics.cancelled);
                info!(error = %e, "Removed during immediate send, not queueing");
                Ok(EnqueueOutcome::Cancelled)
            }
            Err(e) => {
                debug!(error = %e, "Immediate send failed, queueing");
                self.append(inner, item).await
            }
        }
    }

    async fn is_relevant(&self, item: &QueueItem) -> bool {
        match self.oracle.is_still_relevant(item).await {
            Ok(relevant) => relevant,
            Err(e) => {
                warn!(
                    business_key = %item.business_key,
                    error = %e,
                    "Status lookup failed, keeping item"
                );
                true
            }
        }
    }

    async fn send_immediate(&self, item: &QueueItem) -> Result<(), SendError> {
        let bound = self
            .sender
            .immediate_timeout()
            .min(self.config.fast_path_timeout());
        tokio::time::timeout(bound, self.sender.try_send_immediate(item))
            .await
            .unwrap_or(Err(SendError::Timeout(bound)))
    }

    async fn send_normal(&self, item: &QueueItem) -> Result<(), SendError> {
        let bound = self.config.send_timeout();
        tokio::time::timeout(bound, self.sender.send_with_retry(item))
            .await
            .unwrap_or(Err(SendError::Timeout(bound)))
    }

    async fn next_step(&self) -> Step {
        let (step, checkpoint) = {
            let mut inner = self.state.lock().await;
            let reset = self.reset_window_if_expired(&mut inner);
            let step = self.plan_step(&mut inner);
            let dirty = reset || matches!(step, Step::Send { .. });
            (step, dirty.then(|| inner.checkpoint()))
        };

        if let Some(checkpoint) = checkpoint {
            self.persist(checkpoint).await;
        }
        step
    }

    fn plan_step(&self, inner: &mut QueueInner) -> Step {
        if inner.items.is_empty() {
            inner.worker = None;
            return Step::Exit;
        }

        if inner.dequeues_since_cleanup >= self.config.cleanup_every {
            inner.dequeues_since_cleanup = 0;
            return Step::Cleanup;
        }

        if inner.available() == 0 {
            let wait = if inner.window.remaining_capacity() == 0 {
                inner.window.until_reset(self.clock.now())
            } else {
                RESERVATION_POLL
            };
            return Step::Wait(wait.min(self.config.max_idle_wait()));
        }

        let Some(item) = inner.items.pop_front() else {
            return Step::Exit;
        };
        inner.dequeues_since_cleanup = inner.dequeues_since_cleanup.saturating_add(1);
        let burst = inner.window.sent_count == 0;
        inner.reserve(item.key().clone());
        inner.worker_item = Some(item.clone());

        Step::Send { item, burst }
    }

    /// Deliver one dequeued item and return the pause before the next step.
    async fn deliver(&self, item: QueueItem, burst: bool) -> Duration {
        let key = item.key().clone();

        if !self.is_relevant(&item).await {
            let mut inner = self.state.lock().await;
            inner.release(&key);
            QueueMetrics::incr(&self.metrics.stale_dropped);
            info!(business_key = %key, "Dropped stale item without sending");
            return Duration::ZERO;
        }

        let sent_immediately = burst && self.send_immediate(&item).await.is_ok();
        let result = if sent_immediately {
            Ok(())
        } else {
            self.send_normal(&item).await
        };

        let (pause, checkpoint) = {
            let mut inner = self.state.lock().await;
            let cancelled = inner.release(&key);

            match result {
                Ok(()) => {
                    inner.window.record_send();
                    QueueMetrics::incr(&self.metrics.sent_from_queue);
                    info!(
                        business_key = %key,
                        sent_count = inner.window.sent_count,
                        queued = inner.items.len(),
                        "Sent queued message"
                    );
                    let pause = self.config.delay.calculate_delay(&inner.window, burst);
                    (pause, Some(inner.checkpoint()))
                }
                Err(e) if cancelled => {
                    QueueMetrics::incr(&self.metrics.cancelled);
                    info!(
                        business_key = %key,
                        error = %e,
                        "Dropped cancelled item after failed send"
                    );
                    (Duration::ZERO, None)
                }
                Err(e) => {
                    QueueMetrics::incr(&self.metrics.transient_failures);
                    warn!(
                        business_key = %key,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Send failed, re-queued at tail"
                    );
                    inner.items.push_back(item);
                    (self.config.retry_delay(), Some(inner.checkpoint()))
                }
            }
        };

        if let Some(checkpoint) = checkpoint {
            self.persist(checkpoint).await;
        }
        pause
    }

    async fn cleanup_pass(&self) -> usize {
        let snapshot: Vec<QueueItem> = self.state.lock().await.items.iter().cloned().collect();

        let mut stale = Vec::new();
        for item in snapshot {
            if !self.is_relevant(&item).await {
                stale.push(item);
            }
        }
        if stale.is_empty() {
            return 0;
        }

        let (removed, checkpoint) = {
            let mut inner = self.state.lock().await;
            let before = inner.items.len();
            inner.items.retain(|i| !stale.contains(i));
            (before - inner.items.len(), inner.checkpoint())
        };

        for item in &stale {
            info!(business_key = %item.business_key, "Removed stale item during cleanup");
        }
        QueueMetrics::add(&self.metrics.stale_dropped, removed as u64);
        self.persist(checkpoint).await;
        removed
    }
}

async fn run_consumer(shared: Arc<Shared>) {
    info!("Queue consumer running");
    loop {
        if shared.cancel.is_cancelled() {
            debug!("Queue consumer cancelled");
            break;
        }

        let pause = match shared.next_step().await {
            Step::Exit => {
                info!("Queue drained, consumer stopping");
                break;
            }
            Step::Cleanup => {
                shared.cleanup_pass().await;
                Duration::ZERO
            }
            Step::Wait(wait) => {
                debug!(wait_ms = wait.as_millis() as u64, "Quota exhausted, waiting");
                wait
            }
            Step::Send { item, burst } => shared.deliver(item, burst).await,
        };

        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("Queue consumer cancelled while sleeping");
                break;
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

// ============================================================================
// Public Manager
// ============================================================================

pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    /// Load persisted state, probe the quota ceiling and start draining any
    /// leftover items. Must run inside a Tokio runtime.
    ///
    /// A stored state that cannot be decoded is discarded. A store that
    /// cannot be read at all fails construction with `QueueError::Storage`
    /// and the stored state is left untouched.
    #[instrument(skip(config, deps))]
    pub async fn new(config: QueueConfig, deps: QueueDeps) -> Result<Self, QueueError> {
        config.validate()?;

        let now = deps.clock.now();
        let ceiling = resolve_quota_ceiling(
            deps.probe.as_ref(),
            config.default_quota_ceiling,
            config.max_quota_ceiling,
        );

        let loaded = match deps.store.load_state().await {
            Ok(state) => state,
            Err(e) if e.is_unreadable_state() => {
                error!(error = %e, "Persisted queue is unreadable, starting empty");
                None
            }
            Err(e) => {
                error!(
                    error = %e,
                    retryable = e.is_retryable(),
                    "Failed to read persisted queue"
                );
                return Err(QueueError::Storage(e));
            }
        };

        let (items, mut window) = match loaded {
            Some(state) => (dedup_items(state.items), state.window),
            None => (
                VecDeque::new(),
                RateWindow::new(now, ceiling, config.window_duration_ms),
            ),
        };
        window.quota_ceiling = ceiling;
        window.window_duration_ms = config.window_duration_ms;

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueInner {
                items,
                window,
                in_flight: HashSet::new(),
                cancelled: HashSet::new(),
                reserved: 0,
                worker_item: None,
                dequeues_since_cleanup: 0,
                worker: None,
                shut_down: false,
                checkpoint_seq: 0,
            }),
            last_saved: Mutex::new(0),
            store: deps.store,
            sender: deps.sender,
            oracle: deps.oracle,
            clock: deps.clock,
            metrics: QueueMetrics::new(),
            cancel: CancellationToken::new(),
        });

        let checkpoint = {
            let mut inner = shared.state.lock().await;
            info!(
                queued = inner.items.len(),
                sent_count = inner.window.sent_count,
                quota_ceiling = inner.window.quota_ceiling,
                "Queue manager initialized"
            );
            shared.ensure_worker(&mut inner);
            inner.checkpoint()
        };
        shared.persist(checkpoint).await;

        Ok(Self { shared })
    }

    /// Send now if the window has room, otherwise queue.
    ///
    /// Only one of "sent immediately" and "queued" ever happens for a call.
    /// The immediate attempt runs on a separate task, bounded by the
    /// fast-path timeout, while its key and one unit of quota stay reserved.
    /// Dropping the returned future does not abandon the attempt: it still
    /// ends either sent or queued.
    #[instrument(skip(self, item), fields(business_key = %item.business_key))]
    pub async fn enqueue(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError> {
        let shared = &self.shared;
        let key = item.key().clone();

        let mut inner = shared.state.lock().await;
        if inner.shut_down {
            return Err(QueueError::ShutDown);
        }
        if inner.contains(&key) {
            QueueMetrics::incr(&shared.metrics.duplicate_rejections);
            debug!("Key already queued");
            return Ok(EnqueueOutcome::AlreadyQueued);
        }

        shared.reset_window_if_expired(&mut inner);

        if inner.available() == 0 {
            return shared.append(inner, item).await;
        }

        inner.reserve(key);
        let attempt = tokio::spawn(Arc::clone(shared).finish_immediate(item).in_current_span());
        drop(inner);

        match attempt.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!(error = %e, "Immediate send task cancelled");
                Err(QueueError::ShutDown)
            }
        }
    }

    /// Validate a raw request and enqueue it.
    pub async fn enqueue_request(
        &self,
        request: SendRequest,
    ) -> Result<EnqueueOutcome, QueueError> {
        match QueueItem::from_request(request, self.shared.clock.now()) {
            Ok(item) => self.enqueue(item).await,
            Err(e) => {
                QueueMetrics::incr(&self.shared.metrics.invalid_rejections);
                warn!(error = %e, "Rejected invalid send request");
                Err(e)
            }
        }
    }

    /// Drop a pending send whose business condition no longer applies.
    ///
    /// An item the consumer is sending right now is marked instead: if that
    /// send fails it is dropped rather than re-queued. Returns false when the
    /// key is unknown.
    #[instrument(skip(self, key), fields(business_key = %key))]
    pub async fn remove_from_queue(&self, key: &BusinessKey) -> bool {
        let shared = &self.shared;
        let mut inner = shared.state.lock().await;

        if let Some(pos) = inner.items.iter().position(|i| i.key() == key) {
            inner.items.remove(pos);
            QueueMetrics::incr(&shared.metrics.cancelled);
            let queued = inner.items.len();
            let checkpoint = inner.checkpoint();
            drop(inner);

            shared.persist(checkpoint).await;
            info!(queued, "Removed from queue");
            return true;
        }

        if inner.in_flight.contains(key) {
            inner.cancelled.insert(key.clone());
            info!("Marked in-flight item as cancelled");
            return true;
        }

        false
    }

    /// Run the staleness sweep now. Returns how many items were dropped.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> usize {
        self.shared.cleanup_pass().await
    }

    pub async fn status(&self) -> QueueStatus {
        let inner = self.shared.state.lock().await;
        QueueStatus {
            queued: inner.items.len(),
            in_flight: inner.in_flight.len(),
            sent_count: inner.window.sent_count,
            quota_ceiling: inner.window.quota_ceiling,
            remaining_capacity: inner.window.remaining_capacity(),
            window_resets_at: inner.window.resets_at(),
            worker_running: inner.worker_running(),
        }
    }

    pub async fn contains(&self, key: &BusinessKey) -> bool {
        self.shared.state.lock().await.contains(key)
    }

    /// Queued keys in delivery order. In-flight items are not included.
    pub async fn queued_keys(&self) -> Vec<BusinessKey> {
        let inner = self.shared.state.lock().await;
        inner.items.iter().map(|i| i.key().clone()).collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop the consumer: signal it, wait up to `join_timeout`, then abort.
    /// An item the consumer was holding goes back to the head of the queue,
    /// and the final state is persisted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let handle = {
            let mut inner = shared.state.lock().await;
            inner.shut_down = true;
            inner.worker.take()
        };
        shared.cancel.cancel();

        if let Some(mut handle) = handle {
            match tokio::time::timeout(shared.config.join_timeout(), &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Queue consumer task failed"),
                Err(_) => {
                    warn!("Queue consumer did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        let (queued, checkpoint) = {
            let mut inner = shared.state.lock().await;
            if let Some(item) = inner.worker_item.take() {
                let key = item.key().clone();
                inner.release(&key);
                inner.items.push_front(item);
                info!(business_key = %key, "Restored interrupted item to queue head");
            }
            (inner.items.len(), inner.checkpoint())
        };
        shared.persist(checkpoint).await;
        info!(queued, "Queue manager stopped");
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Collapse duplicate keys from an older or damaged state; first wins.
fn dedup_items(items: VecDeque<QueueItem>) -> VecDeque<QueueItem> {
    let mut seen = HashSet::new();
    let before = items.len();
    let unique: VecDeque<QueueItem> = items
        .into_iter()
        .filter(|i| seen.insert(i.key().clone()))
        .collect();
    if unique.len() != before {
        warn!(
            dropped = before - unique.len(),
            "Dropped duplicate keys from persisted queue"
        );
    }
    unique
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relay_config::QueueConfig;

/// Message priority band.  Strict priority across bands, FIFO within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// All bands, highest priority first; the dequeue scan order.
    pub const DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    fn band(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// One queued message with retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub content: Value,
    pub priority: MessagePriority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub processed: bool,
    pub last_error: Option<String>,
}

/// Async handler invoked for each dequeued message.  Handlers run in
/// registration order; the first error fails the message and triggers retry.
pub type MessageHandler =
    Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub queued: usize,
    pub running: bool,
    pub handlers: usize,
}

struct Inner {
    cfg: QueueConfig,
    bands: Mutex<[VecDeque<QueueMessage>; 4]>,
    handlers: Mutex<Vec<MessageHandler>>,
    counters: Mutex<Counters>,
    notify: Notify,
    running: AtomicBool,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    processed: u64,
    failed: u64,
    retried: u64,
}

/// Multi-band priority message queue with backpressure, batched drain, retry
/// and an optional background worker.
///
/// Producers may be concurrent; the background worker is the single built-in
/// consumer, though callers can also drain manually with [`dequeue`] /
/// [`dequeue_batch`].
///
/// [`dequeue`]: MessageQueue::dequeue
/// [`dequeue_batch`]: MessageQueue::dequeue_batch
pub struct MessageQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                bands: Mutex::new(Default::default()),
                handlers: Mutex::new(Vec::new()),
                counters: Mutex::new(Counters::default()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a message.  Returns `false`, without mutating anything,
    /// when the target band is already at capacity.
    pub fn enqueue(&self, content: Value, priority: MessagePriority, id: Option<String>) -> bool {
        self.inner.enqueue_message(content, priority, id)
    }

    /// Pop the head of the highest-priority non-empty band.
    ///
    /// With no timeout an empty queue returns `None` immediately; with a
    /// timeout the call waits until a message arrives or the deadline
    /// elapses (expiry returns `None`, not an error).
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<QueueMessage> {
        self.inner.dequeue_message(timeout).await
    }

    /// Drain up to `max` messages or until the deadline elapses.  The
    /// deadline is computed once at call start; each inner wait uses the
    /// remaining slice.
    pub async fn dequeue_batch(
        &self,
        max: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<QueueMessage> {
        self.inner.dequeue_batch(max, timeout).await
    }

    /// Append a handler; handlers run in registration order per message.
    pub fn register_handler(&self, handler: MessageHandler) {
        self.inner.handlers.lock().expect("handler lock").push(handler);
    }

    /// Start the background worker: drain a batch, run handlers on the batch
    /// concurrently, sleep briefly when the queue is empty.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("message queue already running");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            info!("message queue worker started");
            while inner.running.load(Ordering::SeqCst) {
                let batch = inner.dequeue_batch(None, None).await;
                if batch.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                let jobs: Vec<_> = batch
                    .into_iter()
                    .map(|msg| inner.process_message(msg))
                    .collect();
                futures::future::join_all(jobs).await;
            }
            info!("message queue worker stopped");
        });
        *self.worker.lock().expect("worker lock") = Some(handle);
    }

    /// Signal the worker to stop and await its termination.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_full(&self) -> bool {
        let bands = self.inner.bands.lock().expect("band lock");
        bands.iter().any(|b| b.len() >= self.inner.cfg.max_size)
    }

    /// Queued message count per band, indexed highest priority first.
    pub fn band_sizes(&self) -> [(MessagePriority, usize); 4] {
        let bands = self.inner.bands.lock().expect("band lock");
        MessagePriority::DESCENDING.map(|p| (p, bands[p.band()].len()))
    }

    pub fn is_empty(&self) -> bool {
        let bands = self.inner.bands.lock().expect("band lock");
        bands.iter().all(|b| b.is_empty())
    }

    /// Drop all queued messages.
    pub fn clear(&self) {
        let mut bands = self.inner.bands.lock().expect("band lock");
        for band in bands.iter_mut() {
            band.clear();
        }
    }

    pub fn stats(&self) -> QueueStats {
        let queued = {
            let bands = self.inner.bands.lock().expect("band lock");
            bands.iter().map(|b| b.len()).sum()
        };
        let c = self.inner.counters.lock().expect("counter lock");
        QueueStats {
            enqueued: c.enqueued,
            dequeued: c.dequeued,
            processed: c.processed,
            failed: c.failed,
            retried: c.retried,
            queued,
            running: self.inner.running.load(Ordering::SeqCst),
            handlers: self.inner.handlers.lock().expect("handler lock").len(),
        }
    }
}

impl Inner {
    fn enqueue_message(
        &self,
        content: Value,
        priority: MessagePriority,
        id: Option<String>,
    ) -> bool {
        let message = {
            let mut bands = self.bands.lock().expect("band lock");
            let band = &mut bands[priority.band()];
            if band.len() >= self.cfg.max_size {
                warn!(?priority, "queue band full, rejecting message");
                return false;
            }
            let mut counters = self.counters.lock().expect("counter lock");
            let message = QueueMessage {
                id: id.unwrap_or_else(|| format!("msg_{}", counters.enqueued)),
                content,
                priority,
                created_at: Utc::now(),
                retry_count: 0,
                max_retries: self.cfg.max_retries,
                processed: false,
                last_error: None,
            };
            counters.enqueued += 1;
            band.push_back(message.clone());
            message
        };
        debug!(id = %message.id, ?priority, "message enqueued");
        self.notify.notify_waiters();
        true
    }

    /// Re-enqueue a failed message preserving its retry bookkeeping.
    fn requeue(&self, message: QueueMessage) -> bool {
        let accepted = {
            let mut bands = self.bands.lock().expect("band lock");
            let band = &mut bands[message.priority.band()];
            if band.len() >= self.cfg.max_size {
                false
            } else {
                band.push_back(message);
                true
            }
        };
        if accepted {
            self.notify.notify_waiters();
        }
        accepted
    }

    fn try_pop(&self) -> Option<QueueMessage> {
        let mut bands = self.bands.lock().expect("band lock");
        for priority in MessagePriority::DESCENDING {
            if let Some(msg) = bands[priority.band()].pop_front() {
                self.counters.lock().expect("counter lock").dequeued += 1;
                return Some(msg);
            }
        }
        None
    }

    async fn dequeue_message(&self, timeout: Option<Duration>) -> Option<QueueMessage> {
        if let Some(msg) = self.try_pop() {
            return Some(msg);
        }
        let deadline = timeout.map(|t| Instant::now() + t)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // A short poll interval bounds the window in which a
            // notify_waiters fired between try_pop and notified() would
            // otherwise be missed.
            let wait = remaining.min(Duration::from_millis(20));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }
        }
    }

    async fn dequeue_batch(
        &self,
        max: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<QueueMessage> {
        let batch_size = max.unwrap_or(self.cfg.batch_size);
        let budget = timeout.unwrap_or(Duration::from_millis(self.cfg.batch_timeout_ms));
        let deadline = Instant::now() + budget;

        let mut batch = Vec::new();
        while batch.len() < batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.dequeue_message(Some(remaining)).await {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "batch dequeued");
        }
        batch
    }

    async fn process_message(&self, mut message: QueueMessage) {
        let handlers: Vec<MessageHandler> = self.handlers.lock().expect("handler lock").clone();

        let mut failure: Option<String> = None;
        for handler in &handlers {
            if let Err(e) = handler(message.clone()).await {
                failure = Some(e.to_string());
                break;
            }
        }

        match failure {
            None => {
                message.processed = true;
                self.counters.lock().expect("counter lock").processed += 1;
            }
            Some(err) => {
                error!(id = %message.id, error = %err, "message handler failed");
                message.last_error = Some(err);
                message.retry_count += 1;
                if message.retry_count < message.max_retries {
                    info!(
                        id = %message.id,
                        attempt = message.retry_count,
                        max = message.max_retries,
                        "re-enqueueing message for retry"
                    );
                    if self.requeue(message) {
                        self.counters.lock().expect("counter lock").retried += 1;
                    } else {
                        self.counters.lock().expect("counter lock").failed += 1;
                    }
                } else {
                    error!(id = %message.id, "message exhausted retries, dropping");
                    self.counters.lock().expect("counter lock").failed += 1;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn queue_with_capacity(max_size: usize) -> MessageQueue {
        MessageQueue::new(QueueConfig {
            max_size,
            ..QueueConfig::default()
        })
    }

    // ── Enqueue bounds ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn enqueue_returns_true_until_band_full() {
        let q = queue_with_capacity(2);
        assert!(q.enqueue(json!(1), MessagePriority::Normal, None));
        assert!(q.enqueue(json!(2), MessagePriority::Normal, None));
        assert!(!q.enqueue(json!(3), MessagePriority::Normal, None));
    }

    #[tokio::test]
    async fn full_band_rejection_does_not_mutate_state() {
        let q = queue_with_capacity(1);
        assert!(q.enqueue(json!(1), MessagePriority::Normal, None));
        assert!(!q.enqueue(json!(2), MessagePriority::Normal, None));
        assert_eq!(q.stats().queued, 1);
        assert_eq!(q.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn bands_fill_independently() {
        let q = queue_with_capacity(1);
        assert!(q.enqueue(json!(1), MessagePriority::Normal, None));
        // Other bands still have room.
        assert!(q.enqueue(json!(2), MessagePriority::High, None));
    }

    // ── Priority & FIFO order ─────────────────────────────────────────────────

    #[tokio::test]
    async fn dequeue_prefers_higher_band() {
        let q = queue_with_capacity(10);
        q.enqueue(json!("low"), MessagePriority::Low, None);
        q.enqueue(json!("critical"), MessagePriority::Critical, None);
        q.enqueue(json!("normal"), MessagePriority::Normal, None);

        let first = q.dequeue(None).await.unwrap();
        assert_eq!(first.content, json!("critical"));
        let second = q.dequeue(None).await.unwrap();
        assert_eq!(second.content, json!("normal"));
        let third = q.dequeue(None).await.unwrap();
        assert_eq!(third.content, json!("low"));
    }

    #[tokio::test]
    async fn fifo_within_one_band() {
        let q = queue_with_capacity(10);
        for i in 0..5 {
            q.enqueue(json!(i), MessagePriority::Normal, None);
        }
        for i in 0..5 {
            assert_eq!(q.dequeue(None).await.unwrap().content, json!(i));
        }
    }

    // ── Timeouts ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn dequeue_empty_without_timeout_returns_none_immediately() {
        let q = queue_with_capacity(10);
        assert!(q.dequeue(None).await.is_none());
    }

    #[tokio::test]
    async fn dequeue_timeout_expiry_returns_none() {
        let q = queue_with_capacity(10);
        let start = std::time::Instant::now();
        let out = q.dequeue(Some(Duration::from_millis(50))).await;
        assert!(out.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn dequeue_wakes_for_message_enqueued_while_waiting() {
        let q = Arc::new(queue_with_capacity(10));
        let q2 = Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            q2.enqueue(json!("late"), MessagePriority::Normal, None);
        });
        let msg = q.dequeue(Some(Duration::from_millis(500))).await;
        assert_eq!(msg.unwrap().content, json!("late"));
    }

    #[tokio::test]
    async fn dequeue_batch_respects_max() {
        let q = queue_with_capacity(10);
        for i in 0..7 {
            q.enqueue(json!(i), MessagePriority::Normal, None);
        }
        let batch = q
            .dequeue_batch(Some(3), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(batch.len(), 3);
        assert_eq!(q.stats().queued, 4);
    }

    #[tokio::test]
    async fn dequeue_batch_stops_at_deadline() {
        let q = queue_with_capacity(10);
        q.enqueue(json!(0), MessagePriority::Normal, None);
        let start = std::time::Instant::now();
        let batch = q
            .dequeue_batch(Some(10), Some(Duration::from_millis(60)))
            .await;
        assert_eq!(batch.len(), 1);
        // Waited out the remaining deadline looking for more, then stopped.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    // ── Worker & retry ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn worker_processes_messages_through_handlers() {
        let q = queue_with_capacity(10);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        q.register_handler(Arc::new(move |_msg| {
            let seen = Arc::clone(&seen2);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        q.start().await;
        for i in 0..4 {
            q.enqueue(json!(i), MessagePriority::Normal, None);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        q.stop().await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(q.stats().processed, 4);
    }

    #[tokio::test]
    async fn failing_handler_retries_then_drops() {
        let q = MessageQueue::new(QueueConfig {
            max_size: 10,
            max_retries: 3,
            ..QueueConfig::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = Arc::clone(&attempts);
        q.register_handler(Arc::new(move |_msg| {
            let attempts = Arc::clone(&attempts2);
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("handler always fails")
            })
        }));
        q.start().await;
        q.enqueue(json!("doomed"), MessagePriority::Normal, None);
        tokio::time::sleep(Duration::from_millis(600)).await;
        q.stop().await;
        // Initial attempt + retries up to max_retries, then dropped.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(q.stats().failed, 1);
        assert_eq!(q.stats().retried, 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn retry_preserves_priority() {
        let q = queue_with_capacity(10);
        let fail_once = Arc::new(AtomicUsize::new(0));
        let fail2 = Arc::clone(&fail_once);
        q.register_handler(Arc::new(move |msg| {
            let fails = Arc::clone(&fail2);
            Box::pin(async move {
                assert_eq!(msg.priority, MessagePriority::High);
                if fails.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first attempt fails")
                }
                Ok(())
            })
        }));
        q.start().await;
        q.enqueue(json!("x"), MessagePriority::High, None);
        tokio::time::sleep(Duration::from_millis(400)).await;
        q.stop().await;
        assert_eq!(q.stats().processed, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let q = queue_with_capacity(10);
        q.start().await;
        q.stop().await;
        q.stop().await;
        assert!(!q.stats().running);
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_empties_all_bands() {
        let q = queue_with_capacity(10);
        q.enqueue(json!(1), MessagePriority::Low, None);
        q.enqueue(json!(2), MessagePriority::Critical, None);
        q.clear();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn band_sizes_report_per_priority_counts() {
        let q = queue_with_capacity(10);
        q.enqueue(json!(1), MessagePriority::High, None);
        q.enqueue(json!(2), MessagePriority::High, None);
        q.enqueue(json!(3), MessagePriority::Low, None);
        let sizes = q.band_sizes();
        assert_eq!(sizes[0], (MessagePriority::Critical, 0));
        assert_eq!(sizes[1], (MessagePriority::High, 2));
        assert_eq!(sizes[3], (MessagePriority::Low, 1));
    }

    #[tokio::test]
    async fn explicit_ids_are_preserved() {
        let q = queue_with_capacity(10);
        q.enqueue(json!(1), MessagePriority::Normal, Some("my-id".into()));
        assert_eq!(q.dequeue(None).await.unwrap().id, "my-id");
    }
}

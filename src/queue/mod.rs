//! Notification queue: duplicate detection plus a pluggable backend,
//! with reactive scheduler triggers when a user's partition crosses the
//! adaptive batch threshold or its oldest item has waited too long.

mod backend;
mod memory_backend;

pub use backend::{QueueBackend, QueueStats};
pub use memory_backend::{MemoryQueueBackend, MemoryQueueConfig};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::batch::BatchComposer;
use crate::dedup::Deduplicator;
use crate::error::EngineError;
use crate::metrics;
use crate::notification::QueueItem;

pub struct NotificationQueue {
    backend: Arc<dyn QueueBackend>,
    dedup: Deduplicator,
    /// Filled in when the scheduler starts; enqueues then nudge it
    trigger_tx: std::sync::RwLock<Option<mpsc::Sender<String>>>,
    /// Shared with the dispatcher so the trigger threshold tracks the
    /// same adaptive batch size the drain passes use
    composer: Arc<BatchComposer>,
    max_wait: Duration,
}

impl NotificationQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        dedup: Deduplicator,
        composer: Arc<BatchComposer>,
        max_wait: Duration,
    ) -> Self {
        Self {
            backend,
            dedup,
            trigger_tx: std::sync::RwLock::new(None),
            composer,
            max_wait,
        }
    }

    pub fn attach_trigger(&self, tx: mpsc::Sender<String>) {
        if let Ok(mut guard) = self.trigger_tx.write() {
            *guard = Some(tx);
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Run a new item's dedup check, registering its key as the winner
    /// when the slot is free. Returns the earlier item's id when this
    /// one collapses onto it; items without a key never collapse.
    pub async fn check_duplicate(&self, item: &QueueItem) -> Result<Option<Uuid>, EngineError> {
        let Some(dedup_key) = item.request.dedup_key.as_deref() else {
            return Ok(None);
        };
        let outcome = self.dedup.check_and_register(dedup_key, item.id).await?;
        Ok(outcome.is_duplicate.then_some(outcome.effective_id))
    }

    /// Put an admitted item in the queue. Dedup is not re-run here so a
    /// retry never collapses onto itself.
    pub async fn enqueue_item(&self, item: QueueItem) -> Result<Uuid, EngineError> {
        let user_id = item.user_id().to_string();
        let id = self.backend.enqueue(item).await?;
        metrics::NOTIFICATIONS_QUEUED.inc();
        self.maybe_trigger(&user_id).await;
        Ok(id)
    }

    async fn maybe_trigger(&self, user_id: &str) {
        let tx = match self.trigger_tx.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else { return };

        let threshold = self.composer.adaptive_batch_size(self.backend.depth().await);
        let depth = self.backend.user_depth(user_id).await;
        let overdue = self
            .backend
            .oldest_age(user_id)
            .await
            .is_some_and(|age| age > self.max_wait);

        if depth >= threshold || overdue {
            // A full channel just means a sweep is already coming.
            let _ = tx.try_send(user_id.to_string());
        }
    }

    pub async fn dequeue_due(&self, user_id: Option<&str>, max: usize) -> Vec<QueueItem> {
        self.backend.dequeue_due(user_id, max).await
    }

    pub async fn dequeue_critical(&self, max: usize) -> Vec<QueueItem> {
        self.backend.dequeue_critical(max).await
    }

    pub async fn depth(&self) -> usize {
        self.backend.depth().await
    }

    pub async fn users_with_pending(&self) -> Vec<String> {
        self.backend.users_with_pending().await
    }

    pub async fn record_failed(&self, item: QueueItem) {
        self.backend.record_failed(item).await;
    }

    pub async fn stats(&self) -> QueueStats {
        self.backend.stats().await
    }
}

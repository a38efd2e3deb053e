//! In-memory queue backend.
//!
//! Items live in per-user partitions (DashMap of deques) until a user's
//! partition crosses the spill threshold, after which that user's new
//! items land in a shared global partition. Critical items bypass both
//! and sit in a dedicated lane.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backend::{QueueBackend, QueueStats};
use crate::error::EngineError;
use crate::metrics;
use crate::notification::{Priority, QueueItem};

#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub max_queue_size: usize,
    pub spill_threshold: usize,
    pub failed_retention: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            spill_threshold: 100,
            failed_retention: 100,
        }
    }
}

pub struct MemoryQueueBackend {
    partitions: DashMap<String, VecDeque<QueueItem>>,
    global: Mutex<VecDeque<QueueItem>>,
    critical: Mutex<VecDeque<QueueItem>>,
    failed: Mutex<VecDeque<QueueItem>>,
    /// Pending items across all partitions and lanes
    total: AtomicUsize,
    config: MemoryQueueConfig,
}

impl MemoryQueueBackend {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
            critical: Mutex::new(VecDeque::new()),
            failed: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            config,
        }
    }

    fn update_depth_gauge(&self) {
        metrics::QUEUE_DEPTH.set(self.total.load(Ordering::Relaxed) as i64);
    }

    /// Pull due items out of a deque, highest priority first and FIFO
    /// within one priority. Items past `max` stay queued.
    fn claim_due(deque: &mut VecDeque<QueueItem>, max: usize) -> Vec<QueueItem> {
        let now = Utc::now();
        let mut due = Vec::new();
        let mut rest = VecDeque::with_capacity(deque.len());
        while let Some(item) = deque.pop_front() {
            if item.is_due(now) {
                due.push(item);
            } else {
                rest.push_back(item);
            }
        }

        // Stable sort keeps arrival order within one priority.
        due.sort_by(|a, b| b.priority().cmp(&a.priority()));

        if due.len() > max {
            let overflow = due.split_off(max);
            for item in overflow.into_iter().rev() {
                rest.push_front(item);
            }
        }
        *deque = rest;
        due
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn enqueue(&self, item: QueueItem) -> Result<Uuid, EngineError> {
        let depth = self.total.load(Ordering::Acquire);
        if depth >= self.config.max_queue_size {
            metrics::QUEUE_FULL_TOTAL.inc();
            tracing::warn!(depth = depth, "Queue at capacity, rejecting enqueue");
            return Err(EngineError::QueueFull { depth });
        }

        let id = item.id;
        if item.priority() == Priority::Critical {
            self.critical.lock().await.push_back(item);
        } else {
            let user_id = item.user_id().to_string();
            let mut partition = self.partitions.entry(user_id).or_default();
            if partition.len() >= self.config.spill_threshold {
                drop(partition);
                self.global.lock().await.push_back(item);
            } else {
                partition.push_back(item);
            }
        }

        self.total.fetch_add(1, Ordering::AcqRel);
        self.update_depth_gauge();
        Ok(id)
    }

    async fn dequeue_due(&self, user_id: Option<&str>, max: usize) -> Vec<QueueItem> {
        let claimed = match user_id {
            Some(user) => match self.partitions.get_mut(user) {
                Some(mut partition) => Self::claim_due(&mut partition, max),
                None => Vec::new(),
            },
            None => {
                let mut global = self.global.lock().await;
                Self::claim_due(&mut global, max)
            }
        };

        if !claimed.is_empty() {
            self.total.fetch_sub(claimed.len(), Ordering::AcqRel);
            self.update_depth_gauge();
        }
        claimed
    }

    async fn dequeue_critical(&self, max: usize) -> Vec<QueueItem> {
        let claimed = {
            let mut critical = self.critical.lock().await;
            Self::claim_due(&mut critical, max)
        };
        if !claimed.is_empty() {
            self.total.fetch_sub(claimed.len(), Ordering::AcqRel);
            self.update_depth_gauge();
        }
        claimed
    }

    async fn depth(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    async fn user_depth(&self, user_id: &str) -> usize {
        self.partitions
            .get(user_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    async fn oldest_age(&self, user_id: &str) -> Option<Duration> {
        let partition = self.partitions.get(user_id)?;
        let oldest = partition.iter().map(|item| item.created_at).min()?;
        (Utc::now() - oldest).to_std().ok()
    }

    async fn users_with_pending(&self) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn record_failed(&self, mut item: QueueItem) {
        item.mark_failed();
        let mut failed = self.failed.lock().await;
        if failed.len() >= self.config.failed_retention {
            failed.pop_front();
        }
        failed.push_back(item);
        metrics::FAILED_ITEMS.set(failed.len() as i64);
    }

    async fn failed_count(&self) -> usize {
        self.failed.lock().await.len()
    }

    async fn stats(&self) -> QueueStats {
        QueueStats {
            total_depth: self.total.load(Ordering::Acquire),
            user_partitions: self
                .partitions
                .iter()
                .filter(|e| !e.value().is_empty())
                .count(),
            global_depth: self.global.lock().await.len(),
            critical_depth: self.critical.lock().await.len(),
            failed_retained: self.failed.lock().await.len(),
        }
    }
}

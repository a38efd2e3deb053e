use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::notification::QueueItem;

/// Snapshot of queue occupancy for health and stats reporting
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_depth: usize,
    pub user_partitions: usize,
    pub global_depth: usize,
    pub critical_depth: usize,
    pub failed_retained: usize,
}

/// Storage behind the notification queue.
///
/// Dequeue operations claim items atomically: an item returned by one
/// call is never returned by another.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add an item. Fails fast with `EngineError::QueueFull` at capacity.
    async fn enqueue(&self, item: QueueItem) -> Result<Uuid, EngineError>;

    /// Claim up to `max` due items. With a user, drains that user's
    /// partition; without one, drains the global spill partition.
    /// Items come back highest priority first, FIFO within a priority.
    async fn dequeue_due(&self, user_id: Option<&str>, max: usize) -> Vec<QueueItem>;

    /// Claim up to `max` due items from the critical lane
    async fn dequeue_critical(&self, max: usize) -> Vec<QueueItem>;

    async fn depth(&self) -> usize;

    async fn user_depth(&self, user_id: &str) -> usize;

    /// Age of the oldest item in a user's partition
    async fn oldest_age(&self, user_id: &str) -> Option<Duration>;

    /// Users that currently have items waiting in their partitions
    async fn users_with_pending(&self) -> Vec<String>;

    /// Retain an item that exhausted its retries, for inspection
    async fn record_failed(&self, item: QueueItem);

    async fn failed_count(&self) -> usize;

    async fn stats(&self) -> QueueStats;
}

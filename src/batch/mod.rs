//! Batch composition: grouping queued items into summarised batches.
//!
//! Items group by (user, kind, priority, time bucket). A group becomes
//! one summarised batch only when it has at least two members, every
//! member is batchable, none is Critical, and their scheduled times sit
//! within the allowed spread. Anything else ships as singleton batches.

mod summarize;

pub use summarize::summarize;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::metrics;
use crate::notification::{Batch, Priority, QueueItem};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub base_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub high_water_mark: usize,
    pub bucket: Duration,
    pub max_spread: Duration,
    pub memory_pressure_bytes: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            base_size: 10,
            min_size: 5,
            max_size: 30,
            high_water_mark: 1_000,
            bucket: Duration::from_secs(900),
            max_spread: Duration::from_secs(300),
            memory_pressure_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    user_id: String,
    kind: String,
    priority: Priority,
    bucket: i64,
}

pub struct BatchComposer {
    config: BatchConfig,
}

impl BatchComposer {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Fold claimed items into batches. Every input item appears in
    /// exactly one output batch.
    pub fn compose(&self, items: Vec<QueueItem>) -> Vec<Batch> {
        let mut groups: HashMap<GroupKey, Vec<QueueItem>> = HashMap::new();
        let mut order: Vec<GroupKey> = Vec::new();
        let bucket_secs = self.config.bucket.as_secs() as i64;

        for item in items {
            let key = GroupKey {
                user_id: item.user_id().to_string(),
                kind: item.request.payload.kind.clone(),
                priority: item.priority(),
                bucket: item.request.scheduled_for.timestamp() / bucket_secs.max(1),
            };
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(item);
        }

        let mut batches = Vec::new();
        for key in order {
            let Some(group) = groups.remove(&key) else { continue };
            if self.qualifies(&group) {
                // Oversized groups split so no batch exceeds the cap.
                for chunk in chunked(group, self.config.max_size) {
                    batches.push(self.summarised_batch(&key, chunk));
                }
            } else {
                for item in group {
                    batches.push(singleton_batch(item));
                }
            }
        }

        for batch in &batches {
            metrics::BATCH_SIZE.observe(batch.size() as f64);
        }
        batches
    }

    fn qualifies(&self, group: &[QueueItem]) -> bool {
        if group.len() < 2 {
            return false;
        }
        if group
            .iter()
            .any(|i| !i.request.batchable || i.priority() == Priority::Critical)
        {
            return false;
        }

        let earliest = group.iter().map(|i| i.request.scheduled_for).min();
        let latest = group.iter().map(|i| i.request.scheduled_for).max();
        match (earliest, latest) {
            (Some(earliest), Some(latest)) => {
                let spread = (latest - earliest)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                spread <= self.config.max_spread
            }
            _ => false,
        }
    }

    fn summarised_batch(&self, key: &GroupKey, items: Vec<QueueItem>) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            user_id: key.user_id.clone(),
            kind: key.kind.clone(),
            priority: key.priority,
            payload: summarize(&key.kind, &items),
            items,
            created_at: Utc::now(),
        }
    }

    /// Target items per dispatch pass: doubled when the queue runs deep,
    /// halved under memory pressure, clamped to the configured bounds.
    pub fn adaptive_batch_size(&self, queue_depth: usize) -> usize {
        let mut size = self.config.base_size;
        if queue_depth > self.config.high_water_mark {
            size *= 2;
        }
        if let Some(rss) = metrics::update_process_memory() {
            if rss > self.config.memory_pressure_bytes {
                size /= 2;
            }
        }
        size.clamp(self.config.min_size, self.config.max_size)
    }
}

fn singleton_batch(item: QueueItem) -> Batch {
    Batch {
        id: Uuid::new_v4(),
        user_id: item.user_id().to_string(),
        kind: item.request.payload.kind.clone(),
        priority: item.priority(),
        payload: item.request.payload.clone(),
        items: vec![item],
        created_at: Utc::now(),
    }
}

fn chunked(items: Vec<QueueItem>, chunk_size: usize) -> Vec<Vec<QueueItem>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for item in items {
        current.push(item);
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationPayload, NotificationRequest};
    use chrono::{DateTime, Utc};

    fn item_at(
        user: &str,
        kind: &str,
        priority: Priority,
        batchable: bool,
        at: DateTime<Utc>,
    ) -> QueueItem {
        let payload = NotificationPayload::new(kind, format!("{} item", kind), "body");
        let request = NotificationRequest::builder(user, payload)
            .priority(priority)
            .batchable(batchable)
            .scheduled_for(at)
            .build();
        QueueItem::new(request)
    }

    fn composer() -> BatchComposer {
        BatchComposer::new(BatchConfig::default())
    }

    #[test]
    fn test_group_of_three_summarised() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].size(), 3);
        assert!(batches[0].payload.body.contains("+1 other"));
    }

    #[test]
    fn test_single_item_stays_singleton() {
        let items = vec![item_at(
            "u1",
            "TASK_DEADLINE",
            Priority::Normal,
            true,
            Utc::now(),
        )];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].size(), 1);
        assert_eq!(batches[0].payload.title, "TASK_DEADLINE item");
    }

    #[test]
    fn test_kinds_never_mix() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "HABIT_REMINDER", Priority::Normal, true, now),
            item_at("u1", "HABIT_REMINDER", Priority::Normal, true, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b
            .items
            .iter()
            .all(|i| i.request.payload.kind == b.kind)));
    }

    #[test]
    fn test_priorities_never_mix() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "TASK_DEADLINE", Priority::High, true, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.size() == 1));
    }

    #[test]
    fn test_critical_never_batched() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "SECURITY_ALERT", Priority::Critical, true, now),
            item_at("u1", "SECURITY_ALERT", Priority::Critical, true, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.size() == 1));
    }

    #[test]
    fn test_unbatchable_member_degrades_group() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u1", "TASK_DEADLINE", Priority::Normal, false, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_wide_spread_degrades_group() {
        let now = Utc::now();
        // Same 15-minute bucket is possible with >5 min spread.
        let base = DateTime::from_timestamp(now.timestamp() / 900 * 900, 0).unwrap();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, base),
            item_at(
                "u1",
                "TASK_DEADLINE",
                Priority::Normal,
                true,
                base + chrono::Duration::seconds(600),
            ),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_users_never_mix() {
        let now = Utc::now();
        let items = vec![
            item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now),
            item_at("u2", "TASK_DEADLINE", Priority::Normal, true, now),
        ];
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_oversized_group_chunked() {
        let now = Utc::now();
        let items: Vec<_> = (0..35)
            .map(|_| item_at("u1", "TASK_DEADLINE", Priority::Normal, true, now))
            .collect();
        let batches = composer().compose(items);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].size(), 30);
        assert_eq!(batches[1].size(), 5);
    }

    #[test]
    fn test_adaptive_size_doubles_at_high_water() {
        let composer = BatchComposer::new(BatchConfig {
            memory_pressure_bytes: u64::MAX,
            ..BatchConfig::default()
        });
        assert_eq!(composer.adaptive_batch_size(10), 10);
        assert_eq!(composer.adaptive_batch_size(5_000), 20);
    }

    #[test]
    fn test_adaptive_size_halves_under_memory_pressure() {
        let composer = BatchComposer::new(BatchConfig {
            memory_pressure_bytes: 1, // any RSS counts as pressure
            ..BatchConfig::default()
        });
        let size = composer.adaptive_batch_size(10);
        assert_eq!(size, 5);
    }

    #[test]
    fn test_adaptive_size_clamped() {
        let composer = BatchComposer::new(BatchConfig {
            base_size: 100,
            memory_pressure_bytes: u64::MAX,
            ..BatchConfig::default()
        });
        assert_eq!(composer.adaptive_batch_size(0), 30);
    }
}

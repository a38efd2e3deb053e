//! Sliding-window deduplication over the shared store.
//!
//! The first send with a given key wins and registers its item id.
//! Subsequent sends within the TTL return the original id, and the TTL
//! slides forward on every check.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::metrics;
use crate::store::{KeyValueStore, SetOutcome, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    /// Id of the winning item (the new one, or the earlier registrant's)
    pub effective_id: Uuid,
}

pub struct Deduplicator {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Check the key and register `new_id` if it is absent.
    ///
    /// An empty key disables deduplication for the request.
    pub async fn check_and_register(
        &self,
        dedup_key: &str,
        new_id: Uuid,
    ) -> Result<DedupOutcome, StoreError> {
        if dedup_key.is_empty() {
            return Ok(DedupOutcome {
                is_duplicate: false,
                effective_id: new_id,
            });
        }

        let key = format!("dedup:{}", dedup_key);
        match self
            .store
            .set_nx_ex(&key, &new_id.to_string(), self.ttl)
            .await?
        {
            SetOutcome::Inserted => Ok(DedupOutcome {
                is_duplicate: false,
                effective_id: new_id,
            }),
            SetOutcome::Exists(held) => {
                metrics::DEDUP_HITS.inc();
                // A malformed stored id falls back to the new id rather
                // than failing the whole send.
                let effective_id = held.parse::<Uuid>().unwrap_or(new_id);
                tracing::debug!(
                    dedup_key = %dedup_key,
                    effective_id = %effective_id,
                    "Duplicate notification collapsed"
                );
                Ok(DedupOutcome {
                    is_duplicate: true,
                    effective_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn dedup() -> Deduplicator {
        Deduplicator::new(Arc::new(MemoryStore::new()), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_first_send_wins() {
        let dedup = dedup();
        let id = Uuid::new_v4();
        let outcome = dedup.check_and_register("task-42", id).await.unwrap();
        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.effective_id, id);
    }

    #[tokio::test]
    async fn test_second_send_is_duplicate() {
        let dedup = dedup();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        dedup.check_and_register("task-42", first).await.unwrap();
        let outcome = dedup.check_and_register("task-42", second).await.unwrap();
        assert!(outcome.is_duplicate);
        assert_eq!(outcome.effective_id, first);
    }

    #[tokio::test]
    async fn test_empty_key_never_duplicates() {
        let dedup = dedup();
        for _ in 0..3 {
            let id = Uuid::new_v4();
            let outcome = dedup.check_and_register("", id).await.unwrap();
            assert!(!outcome.is_duplicate);
            assert_eq!(outcome.effective_id, id);
        }
    }

    #[tokio::test]
    async fn test_window_slides_on_check() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(store.clone(), Duration::from_millis(80));
        let first = Uuid::new_v4();
        dedup.check_and_register("k", first).await.unwrap();

        // Each duplicate check lands inside the window and refreshes it,
        // so the entry outlives the original TTL.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let outcome = dedup
                .check_and_register("k", Uuid::new_v4())
                .await
                .unwrap();
            assert!(outcome.is_duplicate);
            assert_eq!(outcome.effective_id, first);
        }
    }

    #[tokio::test]
    async fn test_expired_key_wins_again() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()), Duration::from_millis(0));
        dedup.check_and_register("k", Uuid::new_v4()).await.unwrap();
        let id = Uuid::new_v4();
        let outcome = dedup.check_and_register("k", id).await.unwrap();
        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.effective_id, id);
    }
}

//! In-memory key-value store backend using DashMap.
//!
//! Entries carry an expiry deadline and are evicted lazily on access.
//! State is lost on restart; use the Redis backend when counters must
//! be shared across instances.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KeyValueStore, SetOutcome, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory store backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Called opportunistically; correctness does
    /// not depend on it since reads check expiry themselves.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    /// Number of stored (possibly expired but not yet evicted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        // The read guard must be released before remove_if takes the
        // shard's write lock.
        let live = self
            .entries
            .get(key)
            .and_then(|entry| (!entry.is_expired()).then(|| entry.value.clone()));
        if live.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(live)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, StoreError> {
        // The entry API serializes concurrent callers on the same key,
        // so exactly one of them observes the vacant slot.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(value.to_string(), ttl));

        if entry.is_expired() {
            *entry = Entry::new(value.to_string(), ttl);
            return Ok(SetOutcome::Inserted);
        }

        if entry.value == value {
            entry.expires_at = Instant::now() + ttl;
            return Ok(SetOutcome::Inserted);
        }

        entry.expires_at = Instant::now() + ttl;
        Ok(SetOutcome::Exists(entry.value.clone()))
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new("0".to_string(), ttl));

        if entry.is_expired() {
            *entry = Entry::new("0".to_string(), ttl);
        }

        let count = entry
            .value
            .parse::<i64>()
            .map_err(|e| StoreError::Backend(format!("non-numeric counter value: {}", e)))?
            + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_single_winner() {
        let store = MemoryStore::new();
        let first = store
            .set_nx_ex("k", "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.was_inserted());

        let second = store
            .set_nx_ex("k", "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second, SetOutcome::Exists("a".to_string()));
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let store = MemoryStore::new();
        store
            .set_nx_ex("k", "a", Duration::from_millis(0))
            .await
            .unwrap();
        let second = store
            .set_nx_ex("k", "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.was_inserted());
    }

    #[tokio::test]
    async fn test_incr_counts_up() {
        let store = MemoryStore::new();
        for expected in 1..=5 {
            let count = store.incr_ex("c", Duration::from_secs(60)).await.unwrap();
            assert_eq!(count, expected);
        }
    }

    #[tokio::test]
    async fn test_incr_resets_after_expiry() {
        let store = MemoryStore::new();
        store.incr_ex("c", Duration::from_millis(0)).await.unwrap();
        let count = store.incr_ex("c", Duration::from_secs(60)).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryStore::new();
        store
            .set_ex("dead", "v", Duration::from_millis(0))
            .await
            .unwrap();
        store
            .set_ex("live", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_set_nx_one_winner() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_nx_ex("race", &format!("v{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().was_inserted() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}

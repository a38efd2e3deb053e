//! Shared key-value store abstraction.
//!
//! All cross-worker mutable state (dedup entries, rate-limit counters)
//! goes through this trait so the engine core never does read-then-write
//! from application code. The memory backend serves tests and single-node
//! deployments; the Redis backend serves multi-instance deployments.

mod memory;
mod redis_backend;

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Outcome of an atomic set-if-absent operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was absent and our value was stored
    Inserted,
    /// The key already held a value; it is returned and its TTL refreshed
    Exists(String),
}

impl SetOutcome {
    pub fn was_inserted(&self) -> bool {
        matches!(self, SetOutcome::Inserted)
    }
}

/// Atomic key-value operations required by the engine.
///
/// Implementations must guarantee that `set_nx_ex` and `incr_ex` are
/// atomic with respect to concurrent callers: no two winners for the
/// same key, no lost counter updates.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value for a key, if present and not expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with a TTL, overwriting any existing entry
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically set the value if the key is absent.
    ///
    /// On a losing race the existing value is returned and its TTL is
    /// refreshed (sliding window semantics).
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, StoreError>;

    /// Atomically increment a counter, applying the TTL when the key is
    /// first created. Returns the new count.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Check backend reachability (for health reporting)
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for health/stats output
    fn backend_type(&self) -> &'static str;
}

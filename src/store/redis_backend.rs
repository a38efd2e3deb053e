//! Redis store backend for multi-instance deployments.
//!
//! Uses Lua scripts so set-if-absent and counter bumps stay atomic on
//! the server side. All keys are namespaced with a configurable prefix.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::Mutex;

use super::{KeyValueStore, SetOutcome, StoreError};

/// GET the key; if it exists refresh its TTL and return the held value,
/// otherwise SET with TTL and return nil.
const SET_NX_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return existing
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return nil
"#;

/// INCR the key, applying the TTL only when the counter is created.
const INCR_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Redis-backed store using a managed connection
pub struct RedisStore {
    connection: Mutex<ConnectionManager>,
    prefix: String,
    set_nx_script: Script,
    incr_script: Script,
}

impl RedisStore {
    /// Connect to Redis and prepare the scripts.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        tracing::info!(prefix = %prefix, "Connected to Redis store");

        Ok(Self {
            connection: Mutex::new(connection),
            prefix: prefix.to_string(),
            set_nx_script: Script::new(SET_NX_SCRIPT),
            incr_script: Script::new(INCR_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.lock().await;
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, StoreError> {
        let mut conn = self.connection.lock().await;
        let existing: Option<String> = self
            .set_nx_script
            .key(self.full_key(key))
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(match existing {
            Some(held) => SetOutcome::Exists(held),
            None => SetOutcome::Inserted,
        })
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection.lock().await;
        let count: i64 = self
            .incr_script
            .key(self.full_key(key))
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.lock().await;
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.lock().await;
        let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("unexpected PING reply: {}", pong)))
        }
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

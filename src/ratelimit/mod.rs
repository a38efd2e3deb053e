//! Fixed-window rate limiting with exponential backoff on repeat breaches.
//!
//! Counters live in the shared store under bucketed keys, so limits hold
//! across instances when the Redis backend is configured. Checks only
//! read; `increment` is called once per admitted notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::metrics;
use crate::store::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub burst_limit: u32,
    pub burst_window_secs: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    pub breach_decay_secs: u64,
    pub global_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 10,
            per_hour: 100,
            per_day: 500,
            burst_limit: 3,
            burst_window_secs: 10,
            backoff_multiplier: 2.0,
            max_backoff_secs: 3_600,
            breach_decay_secs: 600,
            global_per_minute: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// How long the caller should wait before retrying a denied send
    pub retry_after: Duration,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    name: &'static str,
    secs: u64,
    limit: u32,
}

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn user_windows(&self) -> [Window; 4] {
        [
            Window {
                name: "burst",
                secs: self.config.burst_window_secs,
                limit: self.config.burst_limit,
            },
            Window {
                name: "minute",
                secs: 60,
                limit: self.config.per_minute,
            },
            Window {
                name: "hour",
                secs: 3_600,
                limit: self.config.per_hour,
            },
            Window {
                name: "day",
                secs: 86_400,
                limit: self.config.per_day,
            },
        ]
    }

    fn counter_key(subject: &str, window: &Window, now_secs: i64) -> String {
        let bucket = now_secs / window.secs as i64;
        format!("rl:{}:{}:{}", subject, window.name, bucket)
    }

    fn breach_key(subject: &str) -> String {
        format!("rl:breach:{}", subject)
    }

    fn block_key(subject: &str) -> String {
        format!("rl:block:{}", subject)
    }

    async fn check_subject(
        &self,
        scope: &'static str,
        subject: &str,
        windows: &[Window],
    ) -> Result<RateLimitDecision, StoreError> {
        if !self.config.enabled {
            return Ok(RateLimitDecision::allow());
        }

        let now_secs = Utc::now().timestamp();
        let mut nearest_reset: Option<u64> = None;

        for window in windows {
            let key = Self::counter_key(subject, window, now_secs);
            let count = self
                .store
                .get(&key)
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);

            if count >= window.limit as i64 {
                // Seconds until this window's bucket rolls over.
                let window_secs = window.secs as i64;
                let reset = (window_secs - (now_secs % window_secs)) as u64;
                nearest_reset = Some(match nearest_reset {
                    Some(current) => current.min(reset),
                    None => reset,
                });
            }
        }

        // An earlier denial leaves a block entry holding its unblock
        // time; it keeps denying even after the counter bucket rolls
        // over, so retry_after is never cut short.
        let blocked_until = self
            .store
            .get(&Self::block_key(subject))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|until| *until > now_secs);

        if nearest_reset.is_none() && blocked_until.is_none() {
            metrics::RATE_LIMIT_DECISIONS
                .with_label_values(&[scope, "allowed"])
                .inc();
            return Ok(RateLimitDecision::allow());
        }

        // Repeat offenders wait longer: the base wait is scaled by
        // multiplier^breaches, capped, with the breach count decaying
        // after breach_decay_secs of good behaviour.
        let breaches = self
            .store
            .incr_ex(
                &Self::breach_key(subject),
                Duration::from_secs(self.config.breach_decay_secs),
            )
            .await?;
        let remaining = blocked_until.map(|until| (until - now_secs) as u64);
        let base = nearest_reset.or(remaining).unwrap_or(1).max(1);
        let exponent = (breaches - 1).clamp(0, 16) as i32;
        let scaled = (base as f64 * self.config.backoff_multiplier.powi(exponent))
            .min(self.config.max_backoff_secs as f64);
        let mut retry_after = Duration::from_secs(scaled.max(1.0) as u64);
        if let Some(remaining) = remaining {
            retry_after = retry_after.max(Duration::from_secs(remaining));
        }

        let until = now_secs + retry_after.as_secs() as i64;
        self.store
            .set_ex(&Self::block_key(subject), &until.to_string(), retry_after)
            .await?;

        metrics::RATE_LIMIT_DECISIONS
            .with_label_values(&[scope, "denied"])
            .inc();
        tracing::debug!(
            subject = %subject,
            breaches = breaches,
            retry_after_secs = retry_after.as_secs(),
            "Rate limit exceeded"
        );

        Ok(RateLimitDecision {
            allowed: false,
            retry_after,
        })
    }

    /// Check a user's ceilings without consuming quota
    pub async fn check_user(&self, user_id: &str) -> Result<RateLimitDecision, StoreError> {
        self.check_subject("user", user_id, &self.user_windows())
            .await
    }

    /// Check the process-wide ceiling without consuming quota
    pub async fn check_global(&self) -> Result<RateLimitDecision, StoreError> {
        let windows = [Window {
            name: "minute",
            secs: 60,
            limit: self.config.global_per_minute,
        }];
        self.check_subject("global", "global", &windows).await
    }

    /// Consume quota for an admitted notification. Called after the checks
    /// pass, and unconditionally for Critical sends.
    pub async fn increment(&self, user_id: &str) -> Result<(), StoreError> {
        if !self.config.enabled {
            return Ok(());
        }

        let now_secs = Utc::now().timestamp();
        for window in &self.user_windows() {
            let key = Self::counter_key(user_id, window, now_secs);
            // TTL of two windows keeps the counter alive through the
            // whole bucket regardless of when the first hit landed.
            self.store
                .incr_ex(&key, Duration::from_secs(window.secs * 2))
                .await?;
        }

        let global = Window {
            name: "minute",
            secs: 60,
            limit: self.config.global_per_minute,
        };
        let key = Self::counter_key("global", &global, now_secs);
        self.store
            .incr_ex(&key, Duration::from_secs(global.secs * 2))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_allows_under_all_ceilings() {
        let limiter = limiter(RateLimitConfig::default());
        let decision = limiter.check_user("u1").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_eleventh_in_minute_denied() {
        let config = RateLimitConfig {
            burst_limit: 100,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);

        for _ in 0..10 {
            assert!(limiter.check_user("u1").await.unwrap().allowed);
            limiter.increment("u1").await.unwrap();
        }

        let decision = limiter.check_user("u1").await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_burst_ceiling_independent_of_minute() {
        let limiter = limiter(RateLimitConfig::default());
        for _ in 0..3 {
            limiter.increment("u1").await.unwrap();
        }
        // Under the per-minute limit but over the burst limit.
        let decision = limiter.check_user("u1").await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_denial_is_monotonic() {
        let config = RateLimitConfig {
            burst_limit: 100,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        for _ in 0..10 {
            limiter.increment("u1").await.unwrap();
        }

        // Checking again without any window rollover stays denied.
        for _ in 0..5 {
            assert!(!limiter.check_user("u1").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_denial_holds_across_window_rollover() {
        let config = RateLimitConfig {
            burst_limit: 1,
            burst_window_secs: 1,
            backoff_multiplier: 4.0,
            max_backoff_secs: 100_000,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        limiter.increment("u1").await.unwrap();

        // A one-second burst bucket starts retry_after at 1s; the second
        // check pumps the backoff well past a single bucket.
        assert!(!limiter.check_user("u1").await.unwrap().allowed);
        let second = limiter.check_user("u1").await.unwrap();
        assert!(!second.allowed);
        assert!(second.retry_after >= Duration::from_secs(2));

        // Cross the bucket boundary: the counter resets but the block
        // entry keeps the denial in force until retry_after elapses.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!limiter.check_user("u1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_backoff_grows_with_breaches() {
        let config = RateLimitConfig {
            burst_limit: 100,
            max_backoff_secs: 100_000,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        for _ in 0..10 {
            limiter.increment("u1").await.unwrap();
        }

        let first = limiter.check_user("u1").await.unwrap().retry_after;
        let second = limiter.check_user("u1").await.unwrap().retry_after;
        let third = limiter.check_user("u1").await.unwrap().retry_after;
        assert!(second >= first);
        assert!(third >= second);
        assert!(third > first);
    }

    #[tokio::test]
    async fn test_backoff_capped() {
        let config = RateLimitConfig {
            burst_limit: 100,
            max_backoff_secs: 90,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        for _ in 0..10 {
            limiter.increment("u1").await.unwrap();
        }

        for _ in 0..8 {
            let decision = limiter.check_user("u1").await.unwrap();
            assert!(decision.retry_after <= Duration::from_secs(90));
        }
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let limiter = limiter(RateLimitConfig::default());
        for _ in 0..10 {
            limiter.increment("u1").await.unwrap();
        }
        assert!(limiter.check_user("u2").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let config = RateLimitConfig {
            global_per_minute: 2,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        limiter.increment("u1").await.unwrap();
        limiter.increment("u2").await.unwrap();
        let decision = limiter.check_global().await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_disabled_always_allows() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        for _ in 0..50 {
            limiter.increment("u1").await.unwrap();
        }
        assert!(limiter.check_user("u1").await.unwrap().allowed);
    }
}

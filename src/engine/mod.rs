//! Engine wiring: builds every component from settings and owns the
//! scheduler's lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::batch::{BatchComposer, BatchConfig};
use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::config::Settings;
use crate::dedup::Deduplicator;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::EngineError;
use crate::metrics::MetricsSnapshot;
use crate::notification::{NotificationRequest, SendResult};
use crate::preferences::{PreferenceGate, PreferenceStore};
use crate::queue::{MemoryQueueBackend, MemoryQueueConfig, NotificationQueue, QueueStats};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::scheduler::{SchedulerConfig, SchedulerTask};
use crate::store::{KeyValueStore, MemoryStore, RedisStore};
use crate::transport::DeliveryTransport;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store_backend: &'static str,
    pub store_reachable: bool,
    pub circuit_state: &'static str,
    pub queue: QueueStats,
    pub uptime_secs: u64,
}

pub struct NotificationEngine {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<NotificationQueue>,
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    scheduler_config: SchedulerConfig,
    shutdown_tx: broadcast::Sender<()>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl NotificationEngine {
    /// Wire the engine from settings. A configured Redis store that
    /// cannot be reached falls back to the in-memory store so the
    /// engine still comes up, in degraded single-node mode.
    pub async fn from_settings(
        settings: &Settings,
        transport: Arc<dyn DeliveryTransport>,
        preference_store: Arc<dyn PreferenceStore>,
    ) -> Result<Self, EngineError> {
        let store: Arc<dyn KeyValueStore> = if settings.store.backend == "redis" {
            match RedisStore::connect(&settings.store.redis_url, &settings.store.key_prefix).await
            {
                Ok(redis) => Arc::new(redis),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "Redis unavailable, falling back to in-memory store"
                    );
                    Arc::new(MemoryStore::new())
                }
            }
        } else {
            Arc::new(MemoryStore::new())
        };

        let backend = Arc::new(MemoryQueueBackend::new(MemoryQueueConfig {
            max_queue_size: settings.queue.max_queue_size,
            spill_threshold: settings.queue.spill_threshold,
            failed_retention: settings.queue.failed_retention,
        }));
        let dedup = Deduplicator::new(
            store.clone(),
            Duration::from_secs(settings.dedup.ttl_secs),
        );
        let composer = Arc::new(BatchComposer::new(BatchConfig {
            base_size: settings.batch.base_size,
            min_size: settings.batch.min_size,
            max_size: settings.batch.max_size,
            high_water_mark: settings.batch.high_water_mark,
            bucket: Duration::from_secs(settings.batch.bucket_secs),
            max_spread: Duration::from_secs(settings.batch.max_spread_secs),
            memory_pressure_bytes: settings.batch.memory_pressure_bytes,
        }));
        let queue = Arc::new(NotificationQueue::new(
            backend,
            dedup,
            composer.clone(),
            Duration::from_secs(settings.scheduler.max_batch_wait_secs),
        ));

        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                enabled: settings.ratelimit.enabled,
                per_minute: settings.ratelimit.per_minute,
                per_hour: settings.ratelimit.per_hour,
                per_day: settings.ratelimit.per_day,
                burst_limit: settings.ratelimit.burst_limit,
                burst_window_secs: settings.ratelimit.burst_window_secs,
                backoff_multiplier: settings.ratelimit.backoff_multiplier,
                max_backoff_secs: settings.ratelimit.max_backoff_secs,
                breach_decay_secs: settings.ratelimit.breach_decay_secs,
                global_per_minute: settings.ratelimit.global_per_minute,
            },
        ));

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: settings.breaker.failure_threshold,
            success_threshold: settings.breaker.success_threshold,
            open_duration: Duration::from_secs(settings.breaker.open_duration_secs),
            half_open_max_calls: settings.breaker.half_open_max_calls,
            call_timeout: Duration::from_secs(settings.breaker.call_timeout_secs),
            window: Duration::from_secs(settings.breaker.window_secs),
        }));

        let gate = Arc::new(PreferenceGate::new(
            preference_store,
            Duration::from_secs(settings.preferences.cache_ttl_secs),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            gate,
            queue.clone(),
            limiter,
            breaker.clone(),
            transport,
            composer,
            DispatchConfig {
                max_retries: settings.dispatch.max_retries,
                retry_delay: Duration::from_secs(settings.dispatch.retry_delay_secs),
                breaker_retry_delay: Duration::from_secs(
                    settings.dispatch.breaker_retry_delay_secs,
                ),
                concurrency: settings.dispatch.concurrency,
            },
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            dispatcher,
            queue,
            store,
            breaker,
            scheduler_config: SchedulerConfig {
                sweep_interval: Duration::from_secs(settings.scheduler.sweep_interval_secs),
                trigger_capacity: settings.scheduler.trigger_capacity,
            },
            shutdown_tx,
            scheduler_handle: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    /// Spawn the scheduler loop.
    pub async fn start(&self) {
        let scheduler = SchedulerTask::new(
            self.dispatcher.clone(),
            self.queue.clone(),
            self.scheduler_config.clone(),
            self.shutdown_tx.subscribe(),
        );
        let handle = tokio::spawn(scheduler.run());
        *self.scheduler_handle.lock().await = Some(handle);
        tracing::info!(store = self.store.backend_type(), "Notification engine started");
    }

    /// Stop the scheduler loop and wait for it to exit. In-flight
    /// deliveries already spawned keep running to completion.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Scheduler task join failed");
            }
        }
        tracing::info!("Notification engine stopped");
    }

    pub async fn send(&self, request: NotificationRequest) -> Result<SendResult, EngineError> {
        self.dispatcher.send(request).await
    }

    pub async fn health(&self) -> HealthReport {
        let store_reachable = self.store.ping().await.is_ok();
        let circuit = self.breaker.state();
        let queue = self.queue.stats().await;

        let status = if store_reachable && circuit != CircuitState::Open {
            "healthy"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            store_backend: self.store.backend_type(),
            store_reachable,
            circuit_state: circuit.as_str(),
            queue,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(self.started_at.elapsed().as_secs_f64())
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }
}

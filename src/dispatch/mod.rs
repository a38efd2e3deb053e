//! Dispatcher: the send path and batch draining.
//!
//! `send` runs the admission pipeline for one request: preference gate,
//! dedup, the Critical direct path, enqueue for batchables, and the
//! rate-limited immediate path. Queue draining composes batches and
//! delivers them through a bounded worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::batch::BatchComposer;
use crate::breaker::CircuitBreaker;
use crate::error::EngineError;
use crate::metrics;
use crate::notification::{Batch, NotificationRequest, Priority, QueueItem, SendResult};
use crate::preferences::{DigestMode, PreferenceGate};
use crate::queue::NotificationQueue;
use crate::ratelimit::RateLimiter;
use crate::transport::DeliveryTransport;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Delay applied when the circuit is open at dispatch time
    pub breaker_retry_delay: Duration,
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            breaker_retry_delay: Duration::from_secs(60),
            concurrency: 5,
        }
    }
}

pub struct Dispatcher {
    gate: Arc<PreferenceGate>,
    queue: Arc<NotificationQueue>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn DeliveryTransport>,
    composer: Arc<BatchComposer>,
    config: DispatchConfig,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<PreferenceGate>,
        queue: Arc<NotificationQueue>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn DeliveryTransport>,
        composer: Arc<BatchComposer>,
        config: DispatchConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            gate,
            queue,
            limiter,
            breaker,
            transport,
            composer,
            config,
            workers,
        }
    }

    /// Run one request through the full admission pipeline.
    pub async fn send(&self, request: NotificationRequest) -> Result<SendResult, EngineError> {
        if !self.gate.admit(&request.user_id, request.priority).await {
            tracing::debug!(
                user_id = %request.user_id,
                kind = %request.payload.kind,
                "Suppressed by user preferences"
            );
            return Ok(SendResult::suppressed("suppressed by user preferences"));
        }

        let item = QueueItem::new(request);

        if let Some(existing) = self.queue.check_duplicate(&item).await? {
            return Ok(SendResult {
                sent: false,
                queued: false,
                item_id: Some(existing),
                batch_id: None,
                error: Some("duplicate".to_string()),
            });
        }

        if item.priority() == Priority::Critical {
            return self.send_critical(item).await;
        }

        // Batching needs both the request to allow it and the user to
        // have it enabled; a non-immediate digest mode queues everything
        // below Critical, and scheduled-for-later items queue either way.
        let prefs = self.gate.preferences(item.user_id()).await;
        let now = Utc::now();
        let should_batch = (item.request.batchable && prefs.batching_enabled)
            || prefs.digest != DigestMode::Immediate;
        if should_batch || !item.is_due(now) {
            let id = self.queue.enqueue_item(item).await?;
            return Ok(SendResult::queued(id));
        }

        self.send_immediate(item).await
    }

    /// Critical path: counts toward rate counters but is never blocked
    /// by them, demands interaction, and still respects the breaker.
    async fn send_critical(&self, mut item: QueueItem) -> Result<SendResult, EngineError> {
        self.limiter.increment(item.user_id()).await?;

        item.request.payload.require_interaction = true;
        item.request.payload.tag = Some(format!("critical-{}", item.id));

        let user_id = item.user_id().to_string();
        let payload = item.request.payload.clone();
        let start = Instant::now();
        let result = self
            .breaker
            .execute(async { self.transport.deliver(&user_id, &payload).await })
            .await;

        match result {
            Ok(()) => {
                item.mark_delivered();
                metrics::NOTIFICATIONS_SENT
                    .with_label_values(&["critical"])
                    .inc();
                metrics::NOTIFICATIONS_DELIVERED.inc();
                metrics::DELIVERY_LATENCY.observe(start.elapsed().as_secs_f64());
                Ok(SendResult::sent(item.id))
            }
            Err(EngineError::CircuitOpen) => {
                item.request.scheduled_for =
                    Utc::now() + chrono::Duration::from_std(self.config.breaker_retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let id = self.queue.enqueue_item(item).await?;
                Ok(SendResult::queued_with_error(
                    id,
                    "delivery temporarily unavailable",
                ))
            }
            Err(err) => self.handle_delivery_failure(item, &err).await,
        }
    }

    /// Immediate path for non-batchable, due, non-critical requests.
    async fn send_immediate(&self, mut item: QueueItem) -> Result<SendResult, EngineError> {
        if !item.request.bypass_rate_limit {
            let global = self.limiter.check_global().await?;
            let user = self.limiter.check_user(item.user_id()).await?;
            let denied = [global, user].into_iter().find(|d| !d.allowed);
            if let Some(decision) = denied {
                item.request.scheduled_for = Utc::now()
                    + chrono::Duration::from_std(decision.retry_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let id = self.queue.enqueue_item(item).await?;
                return Ok(SendResult::queued_with_error(id, "rate limited"));
            }
        }

        self.limiter.increment(item.user_id()).await?;

        let user_id = item.user_id().to_string();
        let payload = item.request.payload.clone();
        let start = Instant::now();
        let result = self
            .breaker
            .execute(async { self.transport.deliver(&user_id, &payload).await })
            .await;

        match result {
            Ok(()) => {
                item.mark_delivered();
                metrics::NOTIFICATIONS_SENT
                    .with_label_values(&["immediate"])
                    .inc();
                metrics::NOTIFICATIONS_DELIVERED.inc();
                metrics::DELIVERY_LATENCY.observe(start.elapsed().as_secs_f64());
                Ok(SendResult::sent(item.id))
            }
            Err(EngineError::CircuitOpen) => {
                item.request.scheduled_for = Utc::now()
                    + chrono::Duration::from_std(self.config.breaker_retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let id = self.queue.enqueue_item(item).await?;
                Ok(SendResult::queued_with_error(
                    id,
                    "delivery temporarily unavailable",
                ))
            }
            Err(err) => self.handle_delivery_failure(item, &err).await,
        }
    }

    /// Book a failed attempt on an item: requeue with delay while the
    /// retry budget lasts, otherwise mark it failed for good.
    async fn handle_delivery_failure(
        &self,
        mut item: QueueItem,
        err: &EngineError,
    ) -> Result<SendResult, EngineError> {
        item.attempts += 1;
        let message = err.to_string();

        if item.attempts >= self.config.max_retries {
            tracing::warn!(
                item_id = %item.id,
                user_id = %item.user_id(),
                attempts = item.attempts,
                error = %message,
                "Retries exhausted, marking failed"
            );
            metrics::NOTIFICATIONS_FAILED.inc();
            let id = item.id;
            self.queue.record_failed(item).await;
            return Ok(SendResult {
                sent: false,
                queued: false,
                item_id: Some(id),
                batch_id: None,
                error: Some(message),
            });
        }

        item.request.scheduled_for = Utc::now()
            + chrono::Duration::from_std(self.retry_delay_with_jitter())
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        metrics::RETRIES_TOTAL.inc();
        match self.queue.enqueue_item(item).await {
            Ok(id) => Ok(SendResult::queued_with_error(id, message)),
            Err(EngineError::QueueFull { .. }) => {
                // Nowhere to put the retry; count the item as lost.
                metrics::NOTIFICATIONS_FAILED.inc();
                Ok(SendResult::suppressed(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Retry delay plus up to 25% jitter so requeued items from one
    /// failed batch do not all come due in the same instant.
    fn retry_delay_with_jitter(&self) -> Duration {
        let max_jitter_ms = self.config.retry_delay.as_millis() as u64 / 4;
        if max_jitter_ms == 0 {
            return self.config.retry_delay;
        }
        let jitter = rand::rng().random_range(0..=max_jitter_ms);
        self.config.retry_delay + Duration::from_millis(jitter)
    }

    /// Drain one user's partition: claim due items, compose, deliver.
    pub async fn run_user_pass(&self, user_id: &str) {
        let depth = self.queue.depth().await;
        let size = self.composer.adaptive_batch_size(depth);
        let items = self.queue.dequeue_due(Some(user_id), size).await;
        if items.is_empty() {
            return;
        }

        tracing::debug!(user_id = %user_id, claimed = items.len(), "Draining user partition");
        let batches = self.composer.compose(items);
        self.deliver_batches(batches).await;
    }

    /// Drain the critical lane and the global spill partition.
    pub async fn run_global_pass(&self) {
        let depth = self.queue.depth().await;
        let size = self.composer.adaptive_batch_size(depth);

        let critical = self.queue.dequeue_critical(size).await;
        for item in critical {
            // Critical items re-enter the direct path one at a time.
            if let Err(err) = self.send_critical(item).await {
                tracing::error!(error = %err, "Critical redelivery errored");
            }
        }

        let spilled = self.queue.dequeue_due(None, size).await;
        if !spilled.is_empty() {
            let batches = self.composer.compose(spilled);
            self.deliver_batches(batches).await;
        }
    }

    async fn deliver_batches(&self, batches: Vec<Batch>) {
        let futures: Vec<_> = batches
            .into_iter()
            .map(|batch| async move {
                // Closed semaphore cannot happen; we never close it.
                let Ok(_permit) = self.workers.acquire().await else {
                    return;
                };
                self.deliver_batch(batch).await;
            })
            .collect();
        futures::future::join_all(futures).await;
    }

    async fn deliver_batch(&self, mut batch: Batch) {
        let bypass = batch.items.iter().all(|i| i.request.bypass_rate_limit);
        if !bypass {
            let decision = match self.limiter.check_user(&batch.user_id).await {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::error!(error = %err, "Rate limiter unavailable, deferring batch");
                    self.requeue_members(batch, self.config.retry_delay, false)
                        .await;
                    return;
                }
            };
            if !decision.allowed {
                self.requeue_members(batch, decision.retry_after, false).await;
                return;
            }
            if let Err(err) = self.limiter.increment(&batch.user_id).await {
                tracing::error!(error = %err, "Rate counter update failed");
            }
        }

        let user_id = batch.user_id.clone();
        let payload = batch.payload.clone();
        let start = Instant::now();
        let result = self
            .breaker
            .execute(async { self.transport.deliver(&user_id, &payload).await })
            .await;

        match result {
            Ok(()) => {
                for item in &mut batch.items {
                    item.mark_delivered();
                }
                let path = if batch.size() > 1 { "batch" } else { "immediate" };
                metrics::NOTIFICATIONS_SENT.with_label_values(&[path]).inc();
                metrics::NOTIFICATIONS_DELIVERED.inc_by(batch.size() as u64);
                metrics::DELIVERY_LATENCY.observe(start.elapsed().as_secs_f64());
                tracing::info!(
                    user_id = %batch.user_id,
                    batch_id = %batch.id,
                    size = batch.size(),
                    kind = %batch.kind,
                    "Batch delivered"
                );
            }
            Err(EngineError::CircuitOpen) => {
                self.requeue_members(batch, self.config.breaker_retry_delay, false)
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %batch.user_id,
                    batch_id = %batch.id,
                    error = %err,
                    "Batch delivery failed"
                );
                self.requeue_members(batch, self.retry_delay_with_jitter(), true)
                    .await;
            }
        }
    }

    /// Put a batch's members back in the queue. When `count_attempt` is
    /// set the failure consumes retry budget and exhausted items are
    /// marked failed instead of requeued.
    async fn requeue_members(&self, batch: Batch, delay: Duration, count_attempt: bool) {
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
        for mut item in batch.items {
            if count_attempt {
                item.attempts += 1;
                if item.attempts >= self.config.max_retries {
                    metrics::NOTIFICATIONS_FAILED.inc();
                    self.queue.record_failed(item).await;
                    continue;
                }
                metrics::RETRIES_TOTAL.inc();
            }
            item.request.scheduled_for = Utc::now() + delay;
            if let Err(err) = self.queue.enqueue_item(item).await {
                tracing::error!(error = %err, "Requeue failed, dropping item");
                metrics::NOTIFICATIONS_FAILED.inc();
            }
        }
    }
}

//! Notification batching and delivery engine.
//!
//! Requests enter through [`dispatch::Dispatcher::send`]: the preference
//! gate and deduplicator decide admission, Critical items take a direct
//! breaker-guarded path, and everything batchable waits in the queue
//! until the scheduler drains it as summarised batches through the
//! rate limiter and circuit breaker.

pub mod api;
pub mod batch;
pub mod breaker;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod preferences;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod transport;

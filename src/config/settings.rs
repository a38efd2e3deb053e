use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// "memory" or "redis"
    pub backend: String,
    pub redis_url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    /// Per-user partition size above which items spill to the global partition
    pub spill_threshold: usize,
    /// How many failed items are retained for inspection
    pub failed_retention: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchSettings {
    pub base_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Queue depth above which the target batch size doubles
    pub high_water_mark: usize,
    /// Width of the time bucket items are grouped into
    pub bucket_secs: u64,
    /// Maximum scheduled_for spread within one batch
    pub max_spread_secs: u64,
    /// Process RSS above which the target batch size halves
    pub memory_pressure_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
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

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// How long the breaker stays open before probing
    pub open_duration_secs: u64,
    pub half_open_max_calls: u32,
    pub call_timeout_secs: u64,
    /// Rolling window over which failures are counted
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Retry delay applied when the circuit is open
    pub breaker_retry_delay_secs: u64,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub sweep_interval_secs: u64,
    /// Oldest-item age that forces a reactive pass
    pub max_batch_wait_secs: u64,
    pub trigger_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceSettings {
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub queue: QueueSettings,
    pub batch: BatchSettings,
    pub ratelimit: RateLimitSettings,
    pub breaker: BreakerSettings,
    pub dispatch: DispatchSettings,
    pub scheduler: SchedulerSettings,
    pub dedup: DedupSettings,
    pub preferences: PreferenceSettings,
    pub otel: OtelSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Server
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            // Store
            .set_default("store.backend", "memory")?
            .set_default("store.redis_url", "redis://127.0.0.1:6379")?
            .set_default("store.key_prefix", "notify")?
            // Queue
            .set_default("queue.max_queue_size", 10_000)?
            .set_default("queue.spill_threshold", 100)?
            .set_default("queue.failed_retention", 100)?
            // Batching
            .set_default("batch.base_size", 10)?
            .set_default("batch.min_size", 5)?
            .set_default("batch.max_size", 30)?
            .set_default("batch.high_water_mark", 1_000)?
            .set_default("batch.bucket_secs", 900)?
            .set_default("batch.max_spread_secs", 300)?
            .set_default("batch.memory_pressure_bytes", 512 * 1024 * 1024i64)?
            // Rate limiting
            .set_default("ratelimit.enabled", true)?
            .set_default("ratelimit.per_minute", 10)?
            .set_default("ratelimit.per_hour", 100)?
            .set_default("ratelimit.per_day", 500)?
            .set_default("ratelimit.burst_limit", 3)?
            .set_default("ratelimit.burst_window_secs", 10)?
            .set_default("ratelimit.backoff_multiplier", 2.0)?
            .set_default("ratelimit.max_backoff_secs", 3_600)?
            .set_default("ratelimit.breach_decay_secs", 600)?
            .set_default("ratelimit.global_per_minute", 1_000)?
            // Circuit breaker
            .set_default("breaker.failure_threshold", 5)?
            .set_default("breaker.success_threshold", 2)?
            .set_default("breaker.open_duration_secs", 30)?
            .set_default("breaker.half_open_max_calls", 3)?
            .set_default("breaker.call_timeout_secs", 10)?
            .set_default("breaker.window_secs", 60)?
            // Dispatch
            .set_default("dispatch.max_retries", 3)?
            .set_default("dispatch.retry_delay_secs", 30)?
            .set_default("dispatch.breaker_retry_delay_secs", 60)?
            .set_default("dispatch.concurrency", 5)?
            // Scheduler
            .set_default("scheduler.sweep_interval_secs", 15)?
            .set_default("scheduler.max_batch_wait_secs", 300)?
            .set_default("scheduler.trigger_capacity", 256)?
            // Dedup
            .set_default("dedup.ttl_secs", 300)?
            // Preferences
            .set_default("preferences.cache_ttl_secs", 60)?
            // OpenTelemetry
            .set_default("otel.enabled", false)?
            .set_default("otel.endpoint", "http://localhost:4317")?
            .set_default("otel.service_name", "notification-batch-engine")?
            // Logging
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("_")
                    .separator("__"),
            );

        builder.build()?.try_deserialize()
    }
}

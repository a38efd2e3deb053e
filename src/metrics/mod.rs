//! Prometheus metrics registry.
//!
//! All series share the `notify_engine` prefix. Components record into
//! the global registry; `/metrics` encodes it and `/stats` serves the
//! derived [`MetricsSnapshot`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use serde::Serialize;

pub const METRIC_PREFIX: &str = "notify_engine";

lazy_static! {
    /// Notifications handed to the transport, by path (immediate|critical|batch)
    pub static ref NOTIFICATIONS_SENT: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_sent_total", METRIC_PREFIX),
        "Notifications handed to the transport",
        &["path"]
    )
    .unwrap();

    pub static ref NOTIFICATIONS_DELIVERED: IntCounter = register_int_counter!(
        format!("{}_notifications_delivered_total", METRIC_PREFIX),
        "Notifications acknowledged by the transport"
    )
    .unwrap();

    pub static ref NOTIFICATIONS_FAILED: IntCounter = register_int_counter!(
        format!("{}_notifications_failed_total", METRIC_PREFIX),
        "Notifications that exhausted their retries"
    )
    .unwrap();

    pub static ref NOTIFICATIONS_QUEUED: IntCounter = register_int_counter!(
        format!("{}_notifications_queued_total", METRIC_PREFIX),
        "Notifications accepted into the queue"
    )
    .unwrap();

    pub static ref NOTIFICATIONS_SUPPRESSED: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_suppressed_total", METRIC_PREFIX),
        "Notifications dropped before dispatch",
        &["reason"]
    )
    .unwrap();

    pub static ref DEDUP_HITS: IntCounter = register_int_counter!(
        format!("{}_dedup_hits_total", METRIC_PREFIX),
        "Duplicate sends collapsed by the deduplicator"
    )
    .unwrap();

    pub static ref RATE_LIMIT_DECISIONS: CounterVec = register_counter_vec!(
        format!("{}_rate_limit_decisions_total", METRIC_PREFIX),
        "Rate limiter decisions",
        &["scope", "decision"]
    )
    .unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Items currently waiting in the queue"
    )
    .unwrap();

    pub static ref QUEUE_FULL_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_full_total", METRIC_PREFIX),
        "Enqueues rejected because the queue was at capacity"
    )
    .unwrap();

    pub static ref FAILED_ITEMS: IntGauge = register_int_gauge!(
        format!("{}_failed_items", METRIC_PREFIX),
        "Items currently retained in the failed set"
    )
    .unwrap();

    /// 0 = closed, 1 = half-open, 2 = open
    pub static ref CIRCUIT_STATE: IntGauge = register_int_gauge!(
        format!("{}_circuit_state", METRIC_PREFIX),
        "Circuit breaker state (0 closed, 1 half-open, 2 open)"
    )
    .unwrap();

    pub static ref CIRCUIT_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_circuit_opened_total", METRIC_PREFIX),
        "Times the circuit breaker transitioned to open"
    )
    .unwrap();

    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "Transport delivery latency",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        format!("{}_batch_size", METRIC_PREFIX),
        "Items per composed batch",
        vec![1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0]
    )
    .unwrap();

    pub static ref RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retries_total", METRIC_PREFIX),
        "Dispatch attempts re-queued after a failure"
    )
    .unwrap();

    pub static ref PROCESS_MEMORY_BYTES: IntGauge = register_int_gauge!(
        format!("{}_process_memory_bytes", METRIC_PREFIX),
        "Resident set size of this process"
    )
    .unwrap();
}

/// Encode the registry as Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Read this process's resident set size from /proc/self/status.
/// Returns None on platforms without procfs.
pub fn process_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Refresh the process memory gauge; returns the sampled value
pub fn update_process_memory() -> Option<u64> {
    let bytes = process_memory_bytes()?;
    PROCESS_MEMORY_BYTES.set(bytes as i64);
    Some(bytes)
}

/// Point-in-time view of engine health served on `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub delivery_rate: f64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub throughput_per_minute: f64,
    pub queue_depth: i64,
    pub circuit_state: String,
}

impl MetricsSnapshot {
    pub fn collect(uptime_secs: f64) -> Self {
        let delivered = NOTIFICATIONS_DELIVERED.get() as f64;
        let failed = NOTIFICATIONS_FAILED.get() as f64;
        let attempted = delivered + failed;

        let latency_count = DELIVERY_LATENCY.get_sample_count() as f64;
        let average_latency_ms = if latency_count > 0.0 {
            DELIVERY_LATENCY.get_sample_sum() / latency_count * 1000.0
        } else {
            0.0
        };

        let throughput_per_minute = if uptime_secs > 0.0 {
            delivered / (uptime_secs / 60.0)
        } else {
            0.0
        };

        Self {
            delivery_rate: if attempted > 0.0 { delivered / attempted } else { 1.0 },
            error_rate: if attempted > 0.0 { failed / attempted } else { 0.0 },
            average_latency_ms,
            throughput_per_minute,
            queue_depth: QUEUE_DEPTH.get(),
            circuit_state: match CIRCUIT_STATE.get() {
                0 => "closed".to_string(),
                1 => "half_open".to_string(),
                _ => "open".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_prefix() {
        NOTIFICATIONS_QUEUED.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains(METRIC_PREFIX));
    }

    #[test]
    fn test_process_memory_readable_on_linux() {
        if cfg!(target_os = "linux") {
            let bytes = process_memory_bytes().unwrap();
            assert!(bytes > 0);
        }
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot = MetricsSnapshot::collect(0.0);
        assert!(snapshot.delivery_rate >= 0.0);
        assert!(snapshot.error_rate >= 0.0);
    }
}

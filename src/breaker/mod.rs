//! Lock-free circuit breaker guarding the delivery transport.
//!
//! State lives in a single atomic word; transitions use compare-exchange
//! so concurrent dispatch workers agree on exactly one outcome. Failures
//! are counted over a rolling window, and a call that exceeds the call
//! timeout counts as a failure.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::error::EngineError;
use crate::metrics;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub half_open_max_calls: u32,
    pub call_timeout: Duration,
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 3,
            call_timeout: Duration::from_secs(10),
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    /// Failures observed inside the current rolling window
    failures: AtomicU32,
    window_start_ms: AtomicI64,
    opened_at_ms: AtomicI64,
    half_open_successes: AtomicU32,
    half_open_inflight: AtomicU32,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            window_start_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            opened_at_ms: AtomicI64::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            config,
        }
    }

    /// Current state, performing the timed Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from_u8(self.state.load(Ordering::Acquire));
        if current != CircuitState::Open {
            return current;
        }

        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = Utc::now().timestamp_millis() - opened_at;
        if elapsed < self.config.open_duration.as_millis() as i64 {
            return CircuitState::Open;
        }

        // Only one caller wins the transition; losers observe HalfOpen.
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.half_open_successes.store(0, Ordering::Release);
            self.half_open_inflight.store(0, Ordering::Release);
            metrics::CIRCUIT_STATE.set(CircuitState::HalfOpen as i64);
            tracing::info!("Circuit breaker probing (half-open)");
        }
        CircuitState::HalfOpen
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns `EngineError::CircuitOpen` without invoking the operation
    /// while the circuit is open or half-open trial capacity is used up.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let is_trial = match self.state() {
            CircuitState::Open => return Err(EngineError::CircuitOpen),
            CircuitState::HalfOpen => {
                if !self.try_begin_trial() {
                    return Err(EngineError::CircuitOpen);
                }
                true
            }
            CircuitState::Closed => false,
        };

        let outcome = match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match outcome {
            Ok(value) => {
                self.record_success(is_trial);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(is_trial);
                Err(EngineError::Transport(err))
            }
        }
    }

    fn try_begin_trial(&self) -> bool {
        self.half_open_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |inflight| {
                if inflight < self.config.half_open_max_calls {
                    Some(inflight + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn record_success(&self, is_trial: bool) {
        if is_trial {
            self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.close();
            }
            return;
        }
        // Success in the closed state does not reset the failure count;
        // the rolling window takes care of decay.
    }

    fn record_failure(&self, is_trial: bool) {
        if is_trial {
            self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
            // Any trial failure sends the circuit straight back to open.
            self.open();
            return;
        }

        let now_ms = Utc::now().timestamp_millis();
        let window_start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms - window_start > self.config.window.as_millis() as i64 {
            // New window; this failure is the first in it.
            if self
                .window_start_ms
                .compare_exchange(window_start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.failures.store(0, Ordering::Release);
            }
        }

        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.open();
        }
    }

    fn open(&self) {
        let previous = self.state.swap(CircuitState::Open as u8, Ordering::AcqRel);
        self.opened_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        metrics::CIRCUIT_STATE.set(CircuitState::Open as i64);
        if previous != CircuitState::Open as u8 {
            metrics::CIRCUIT_OPENED_TOTAL.inc();
            tracing::warn!("Circuit breaker opened");
        }
    }

    fn close(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.window_start_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        metrics::CIRCUIT_STATE.set(CircuitState::Closed as i64);
        tracing::info!("Circuit breaker closed");
    }
}

//! Circuit breaker protecting broker operations.
//!
//! ## States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ recovery timeout elapsed
//!      │                                   v
//!      │   2 consecutive       ┌─────────────┐
//!      │   successes           │ HALF-OPEN   │
//!      └────────────────────── └─────────────┘
//!                                      │
//!                       any failure    │
//!                       ───────────────┘
//! ```
//!
//! While OPEN, `execute` rejects without invoking the operation; the first
//! call after the recovery timeout elapses is let through as a probe.

use crate::error::{QueueError, QueueResult};
use serde::Serialize;
use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// Testing whether the service has recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state before closing.
    pub success_threshold: u32,
    /// How long to stay open before allowing a probe call through.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold for half-open state.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Read-only snapshot for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
}

/// Thread-safe circuit breaker.
///
/// One instance per protected external service, long-lived for the process
/// duration, mutated only through `execute`/`reset`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
        }
    }

    /// Create a circuit breaker with default configuration.
    pub fn default_config() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    /// Run `operation` under the breaker.
    ///
    /// If the circuit is open and the recovery timeout has not elapsed, the
    /// operation is never invoked and `QueueError::CircuitOpen` is returned
    /// (fail fast). If the timeout has elapsed, the circuit transitions to
    /// half-open and this call runs as the probe.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> QueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        if !self.try_acquire() {
            return Err(QueueError::CircuitOpen(format!(
                "{} consecutive failures, retrying after {:?}",
                self.failure_count.load(Ordering::SeqCst),
                self.config.recovery_timeout,
            )));
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Whether a call may proceed right now. Transitions open → half-open
    /// when the recovery timeout has elapsed.
    fn try_acquire(&self) -> bool {
        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.recovery_elapsed() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                // A success can only come from the probe call
                self.transition_to_closed();
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        *self.last_failure_time.write().unwrap() = Some(Instant::now());

        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // A single failure during the trial reopens the circuit
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed with zero counters (administrative escape
    /// hatch).
    pub fn reset(&self) {
        self.transition_to_closed();
        *self.last_failure_time.write().unwrap() = None;
        tracing::info!("Circuit breaker manually reset");
    }

    /// Read-only status snapshot.
    pub fn status(&self) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }

    fn recovery_elapsed(&self) -> bool {
        let last_failure = self.last_failure_time.read().unwrap();
        match *last_failure {
            Some(time) => time.elapsed() >= self.config.recovery_timeout,
            None => true,
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::Open;
        self.success_count.store(0, Ordering::SeqCst);
        tracing::warn!("Circuit breaker OPENED");
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::HalfOpen;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        tracing::info!("Circuit breaker HALF-OPEN (testing recovery)");
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        tracing::info!("Circuit breaker CLOSED (recovered)");
    }
}

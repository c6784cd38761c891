//! Resilience composition: timeout (outermost) wraps circuit breaker wraps
//! retry (innermost). Only [`CacheError::is_transient`] errors are retried;
//! anything else — a caller bug, a permission failure, a decode mismatch —
//! propagates on the first attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::error::{CacheError, CacheResult};
use crate::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A minimal closed/open/half-open circuit breaker. No crate in the corpus
/// supplies one suited to an async, `sqlx`-backed retry loop, so this is
/// hand-rolled, following the state-machine shape described in the design.
struct CircuitBreaker {
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    failure_threshold: u32,
    duration_of_break: Duration,
}

impl CircuitBreaker {
    fn new(config: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            failure_threshold: config.failure_threshold,
            duration_of_break: config.duration_of_break,
        }
    }

    /// Returns `Ok(())` if the call may proceed (closed, or open-but-cooled-
    /// down, in which case the state transitions to half-open), or
    /// `Err(CacheError::CircuitOpen)` otherwise.
    fn check(&self, time_source: &dyn TimeSource) -> CacheResult<()> {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        match *state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                let now_millis = time_source.now().timestamp_millis().max(0) as u64;
                if now_millis.saturating_sub(opened_at) >= self.duration_of_break.as_millis() as u64 {
                    *state = CircuitState::HalfOpen;
                    debug!(event = "circuit_half_open", "cool-down elapsed; probing");
                    Ok(())
                } else {
                    Err(CacheError::CircuitOpen)
                }
            }
        }
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        if *state != CircuitState::Closed {
            debug!(event = "circuit_closed", "probe succeeded; circuit closed");
        }
        *state = CircuitState::Closed;
    }

    fn on_failure(&self, time_source: &dyn TimeSource) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        if *state == CircuitState::HalfOpen {
            self.trip(&mut state, time_source);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.trip(&mut state, time_source);
        }
    }

    fn trip(&self, state: &mut CircuitState, time_source: &dyn TimeSource) {
        *state = CircuitState::Open;
        self.opened_at_millis.store(
            time_source.now().timestamp_millis().max(0) as u64,
            Ordering::Release,
        );
        warn!(event = "circuit_open", "failure threshold reached; circuit open");
    }
}

/// Wraps every cache operation with timeout, circuit breaker, and retry, in
/// that nesting order. One `ResilienceExecutor` is shared by all clones of a
/// `GlacialCache` handle.
pub struct ResilienceExecutor {
    config: ResilienceConfig,
    circuit_breaker: Option<CircuitBreaker>,
}

impl ResilienceExecutor {
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        let circuit_breaker = config
            .circuit_breaker
            .enable
            .then(|| CircuitBreaker::new(&config.circuit_breaker));
        Self {
            config,
            circuit_breaker,
        }
    }

    /// Runs `operation`, applying the configured timeout/circuit-
    /// breaker/retry policy. When resilience is disabled in config, runs
    /// `operation` exactly once with no timeout wrapper.
    pub async fn execute<F, Fut, T>(
        &self,
        time_source: &dyn TimeSource,
        mut operation: F,
    ) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        if !self.config.enable {
            return operation().await;
        }

        let timeout = self.config.operation_timeout;
        let retried = self.run_with_retry(time_source, &mut operation);
        match tokio::time::timeout(timeout, retried).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout),
        }
    }

    async fn run_with_retry<F, Fut, T>(
        &self,
        time_source: &dyn TimeSource,
        operation: &mut F,
    ) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry.base_delay,
            max_interval: self.config.retry.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut attempt: u32 = 0;
        loop {
            if let Some(breaker) = &self.circuit_breaker {
                breaker.check(time_source)?;
            }

            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.on_success();
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.on_failure(time_source);
                    }
                    let delay = Backoff::next_backoff(&mut backoff).unwrap_or(self.config.retry.max_delay);
                    debug!(
                        event = "retry_scheduled",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        if let Some(breaker) = &self.circuit_breaker {
                            breaker.on_failure(time_source);
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

//! Retry primitives for the shared-store paths: a capped exponential backoff
//! with jitter for the subscriber reconnect loop, and a circuit breaker that
//! keeps the enhanced backend from hammering an unhealthy store.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// CLOSED -> OPEN after `failure_threshold` consecutive failures;
/// OPEN -> HALF_OPEN after `reset_timeout`; HALF_OPEN -> CLOSED after
/// `success_threshold` successes, or back to OPEN on any failure.
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            failure_threshold,
            reset_timeout,
            success_threshold: 2,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => match self.last_failure {
                Some(last) if last.elapsed() >= self.reset_timeout => {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => self.state = CircuitState::Open,
            CircuitState::Open => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Exponential backoff with +-20% jitter, capped at `max`.
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter_factor = 0.8 + 0.4 * (nanos % 1000) as f64 / 1000.0;
        let delay = Duration::from_secs_f64((base * jitter_factor).min(self.max.as_secs_f64()));
        self.current =
            Duration::from_secs_f64((base * self.multiplier).min(self.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

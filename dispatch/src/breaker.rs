//! Circuit breaker guarding a flaky destination.
//!
//! The breaker is a three-state machine:
//!
//! 1. **Closed**: calls pass through; failures are counted against an
//!    adaptive threshold.
//! 2. **Open**: calls fail fast until an adaptive recovery window elapses.
//! 3. **HalfOpen**: trial calls probe the destination; one failure trips
//!    back to open, enough successes close the circuit again.
//!
//! The failure threshold moves within a configured band: it loosens while
//! the recent window shows a healthy destination (low error rate, fast
//! responses) and tightens when it does not. The recovery window grows with
//! the consecutive failure count so a persistently failing destination is
//! probed less often.

use crate::config::BreakerConfig;
use crate::errors::DispatchError;
use crate::metrics_defs::{BREAKER_CLOSED, BREAKER_HALF_OPENED, BREAKER_OPENED, BREAKER_REJECTED};
use parking_lot::Mutex;
use shared::counter;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker, for the stats snapshot.
#[derive(Clone, Debug)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub threshold: u32,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_error_rate: f64,
    pub opened: u64,
    pub half_opened: u64,
    pub closed: u64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Consecutive failure count captured when the breaker last opened,
    /// used to scale the half-open success requirement
    failures_at_open: u32,
    threshold: u32,
    outcomes: VecDeque<bool>,
    latencies: VecDeque<Duration>,
    last_transition: Instant,
    outcomes_since_adjust: u32,
    opened: u64,
    half_opened: u64,
    closed: u64,
}

impl BreakerInner {
    fn push_outcome(&mut self, success: bool, capacity: usize) {
        if self.outcomes.len() >= capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn push_latency(&mut self, latency: Duration, capacity: usize) {
        if self.latencies.len() >= capacity {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn window_error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn window_avg_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let threshold = config.failure_threshold;
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                failures_at_open: 0,
                threshold,
                outcomes: VecDeque::new(),
                latencies: VecDeque::new(),
                last_transition: Instant::now(),
                outcomes_since_adjust: 0,
                opened: 0,
                half_opened: 0,
                closed: 0,
            }),
        }
    }

    /// Runs `op` through the breaker. Fails fast with `CircuitOpen` while
    /// the circuit is open and its recovery window has not yet elapsed.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.check_admission()?;

        let started = Instant::now();
        match op().await {
            Ok(value) => {
                self.on_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            threshold: inner.threshold,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            window_error_rate: inner.window_error_rate(),
            opened: inner.opened,
            half_opened: inner.half_opened,
            closed: inner.closed,
        }
    }

    fn check_admission(&self) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let window = self.recovery_window(inner.consecutive_failures);
                let elapsed = inner.last_transition.elapsed();
                if elapsed >= window {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    Ok(())
                } else {
                    counter!(BREAKER_REJECTED).increment(1);
                    Err(DispatchError::CircuitOpen {
                        retry_after: window - elapsed,
                    })
                }
            }
        }
    }

    /// Recovery window scaled by the consecutive failure count:
    /// `base × min(5, 1.5^⌊failures/3⌋)`.
    fn recovery_window(&self, consecutive_failures: u32) -> Duration {
        let factor = 1.5_f64
            .powi((consecutive_failures / 3) as i32)
            .min(5.0);
        self.config.base_recovery().mul_f64(factor)
    }

    /// Trial successes needed to close again:
    /// `3 × max(1, ⌈failures_at_open / base_threshold⌉)`.
    fn half_open_required(&self, failures_at_open: u32) -> u32 {
        3 * u32::max(1, failures_at_open.div_ceil(self.config.failure_threshold))
    }

    fn on_success(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.push_outcome(true, self.config.window_size);
        inner.push_latency(latency, self.config.window_size);
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        match inner.state {
            BreakerState::HalfOpen => {
                let required = self.half_open_required(inner.failures_at_open);
                if inner.consecutive_successes >= required {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Closed => self.adjust_threshold(&mut inner),
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.push_outcome(false, self.config.window_size);
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::HalfOpen => {
                // Any trial failure trips straight back to open
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                let rate_trip = inner.outcomes.len() >= self.config.window_min_samples
                    && inner.window_error_rate() > self.config.error_rate_threshold;
                if inner.consecutive_failures >= inner.threshold || rate_trip {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Moves the closed-state threshold within `[min, max]`: loosened while
    /// the window is healthy and fast, tightened otherwise. Runs every
    /// `adjust_every` outcomes once the window has enough samples.
    fn adjust_threshold(&self, inner: &mut BreakerInner) {
        inner.outcomes_since_adjust += 1;
        if inner.outcomes_since_adjust < self.config.adjust_every
            || inner.outcomes.len() < self.config.window_min_samples
        {
            return;
        }
        inner.outcomes_since_adjust = 0;

        let error_rate = inner.window_error_rate();
        let fast = inner.window_avg_latency() <= Duration::from_millis(self.config.fast_latency_ms);

        if error_rate < self.config.error_rate_threshold / 2.0 && fast {
            inner.threshold = (inner.threshold + 1).min(self.config.max_threshold);
        } else if error_rate >= self.config.error_rate_threshold || !fast {
            inner.threshold = inner.threshold.saturating_sub(1).max(self.config.min_threshold);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: BreakerState) {
        let previous = inner.state;
        inner.state = next;
        inner.last_transition = Instant::now();

        match next {
            BreakerState::Open => {
                inner.failures_at_open = inner.consecutive_failures;
                inner.opened += 1;
                counter!(BREAKER_OPENED).increment(1);
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_opened += 1;
                counter!(BREAKER_HALF_OPENED).increment(1);
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.failures_at_open = 0;
                inner.closed += 1;
                counter!(BREAKER_CLOSED).increment(1);
            }
        }

        tracing::info!(
            from = previous.as_str(),
            to = next.as_str(),
            threshold = inner.threshold,
            "circuit breaker transition"
        );
    }
}

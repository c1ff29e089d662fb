pub mod registry;

pub use registry::BreakerRegistry;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Component, ControlError, ControlResult, ErrorKind};

const TRANSITION_HISTORY_LIMIT: usize = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            window_size: 20,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> ControlResult<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ControlError::invalid_input(
                Component::Breaker,
                "failure_threshold and success_threshold must be greater than zero",
            ));
        }
        if self.window_size < self.failure_threshold as usize {
            return Err(ControlError::invalid_input(
                Component::Breaker,
                format!(
                    "window_size ({}) must be at least failure_threshold ({})",
                    self.window_size, self.failure_threshold
                ),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ControlError::invalid_input(
                Component::Breaker,
                "timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Raises zero thresholds to 1 and the window to at least `failure_threshold`.
    pub fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.success_threshold = self.success_threshold.max(1);
        self.window_size = self.window_size.max(self.failure_threshold as usize);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: SystemTime,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: usize,
    pub success_count: u32,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub time_in_state_ms: u64,
    pub time_until_retry_ms: Option<u64>,
    pub transitions: usize,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open; retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl<E: Into<ControlError>> BreakerError<E> {
    /// Open circuits become `CircuitOpen` with a retry hint; inner errors pass through.
    pub fn into_control_error(self) -> ControlError {
        match self {
            BreakerError::Open { name, retry_after } => ControlError::new(
                Component::Breaker,
                ErrorKind::CircuitOpen,
                format!(
                    "circuit '{name}' is open; retry in {}ms",
                    retry_after.as_millis()
                ),
            )
            .with_retry_after(retry_after),
            BreakerError::Inner(error) => error.into(),
        }
    }
}

/// Open moves to half-open lazily on the next call once `timeout` has
/// elapsed. The lock is never held while the guarded call runs.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

struct BreakerInner {
    state: BreakerState,
    // true marks a failure
    window: VecDeque<bool>,
    success_count: u32,
    last_failure: Option<Instant>,
    state_entered: Instant,
    transitions: VecDeque<BreakerTransition>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn failure_count(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn push_outcome(&mut self, failed: bool, window_size: usize) {
        while self.window.len() >= window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn retry_after(&self, timeout: Duration) -> Duration {
        self.last_failure
            .map(|at| timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }
}

impl CircuitBreaker {
    /// Invalid settings are normalized rather than rejected; see [`BreakerConfig::normalized`].
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        if let Err(error) = config.validate() {
            tracing::warn!(breaker = %name, %error, "normalizing circuit breaker config");
        }
        Self {
            name,
            config: config.normalized(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                success_count: 0,
                last_failure: None,
                state_entered: Instant::now(),
                transitions: VecDeque::new(),
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Admits one call or rejects it in O(1) while the circuit is open.
    pub fn try_acquire(&self) -> ControlResult<()> {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            let retry_after = inner.retry_after(self.config.timeout);
            if !retry_after.is_zero() {
                inner.rejected_calls += 1;
                tracing::trace!(breaker = %self.name, ?retry_after, "call rejected by open circuit");
                return Err(ControlError::new(
                    Component::Breaker,
                    ErrorKind::CircuitOpen,
                    format!("circuit '{}' is open", self.name),
                )
                .with_retry_after(retry_after));
            }
            self.transition(&mut inner, BreakerState::HalfOpen, "cooldown elapsed");
        }
        inner.total_calls += 1;
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        let state = inner.state;
        match state {
            BreakerState::Closed => inner.push_outcome(false, self.config.window_size),
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed, "probe succeeded");
                }
            }
            // a call admitted before the circuit opened
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        let state = inner.state;
        match state {
            BreakerState::Closed => {
                inner.push_outcome(true, self.config.window_size);
                if inner.failure_count() >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, BreakerState::Open, "failure threshold reached");
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open, "probe failed");
            }
            BreakerState::Open => {}
        }
    }

    pub fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    pub async fn call_async<T, E, Fut>(&self, operation: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        if inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open, "forced open");
        }
    }

    pub fn force_close(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed, "forced closed");
        }
    }

    /// Closes the circuit and zeroes every counter; history is kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed, "reset");
        }
        inner.window.clear();
        inner.last_failure = None;
        inner.total_calls = 0;
        inner.total_successes = 0;
        inner.total_failures = 0;
        inner.rejected_calls = 0;
    }

    pub fn transitions(&self) -> Vec<BreakerTransition> {
        self.lock().transitions.iter().cloned().collect()
    }

    pub fn get_stats(&self) -> BreakerStats {
        let inner = self.lock();
        let failure_count = inner.failure_count();
        let window_len = inner.window.len();
        let (failure_rate, success_rate) = if window_len == 0 {
            (0.0, 0.0)
        } else {
            let failures = failure_count as f64 / window_len as f64;
            (failures, 1.0 - failures)
        };
        let time_until_retry_ms = (inner.state == BreakerState::Open)
            .then(|| inner.retry_after(self.config.timeout).as_millis() as u64);

        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count,
            success_count: inner.success_count,
            failure_rate,
            success_rate,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            time_in_state_ms: inner.state_entered.elapsed().as_millis() as u64,
            time_until_retry_ms,
            transitions: inner.transitions.len(),
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        self.try_acquire().map_err(|error| BreakerError::Open {
            name: self.name.clone(),
            retry_after: error.retry_after.unwrap_or_default(),
        })
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, reason: &'static str) {
        let from = inner.state;
        inner.state = to;
        inner.state_entered = Instant::now();
        inner.success_count = 0;
        if to == BreakerState::Closed {
            inner.window.clear();
        }

        if inner.transitions.len() == TRANSITION_HISTORY_LIMIT {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(BreakerTransition {
            from,
            to,
            at: SystemTime::now(),
            reason,
        });

        match to {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                ?from,
                reason,
                failures = inner.failure_count(),
                "circuit opened"
            ),
            BreakerState::HalfOpen => {
                tracing::debug!(breaker = %self.name, ?from, reason, "circuit half-open")
            }
            BreakerState::Closed => {
                tracing::info!(breaker = %self.name, ?from, reason, "circuit closed")
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, window_size: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "unit",
            BreakerConfig {
                failure_threshold,
                success_threshold: 1,
                timeout: Duration::from_secs(60),
                window_size,
            },
        )
    }

    #[test]
    fn window_forgets_old_failures() {
        let breaker = breaker(3, 3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.get_stats().failure_count, 1);
    }

    #[test]
    fn non_consecutive_failures_inside_window_open_the_circuit() {
        let breaker = breaker(2, 5);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn validate_rejects_window_smaller_than_threshold() {
        let config = BreakerConfig {
            failure_threshold: 10,
            window_size: 5,
            ..BreakerConfig::default()
        };
        let error = config.validate().expect_err("should be rejected");
        assert_eq!(error.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn transition_history_is_bounded() {
        let breaker = breaker(1, 1);
        for _ in 0..120 {
            breaker.force_open();
            breaker.force_close();
        }
        assert_eq!(breaker.transitions().len(), TRANSITION_HISTORY_LIMIT);
    }
}

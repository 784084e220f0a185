//! Rolling-window circuit breaker keyed per request type.
//!
//! One [`BreakerState`] exists per request type, shared by every dispatch of
//! that type in the process (see [`crate::circuit_breaker_registry`]). All
//! state mutation happens under the per-type lock; contention is limited to
//! stream boundaries, never per item.
//!
//! A stream is admitted once per dispatch. Rejection surfaces as
//! [`PipelineError::CircuitOpen`] through the returned stream.

use crate::bridge;
use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamRequest};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hard cap on window entries, independent of the time-based purge.
const WINDOW_MAX_RECORDS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tuning for one breaker. Shared across the unary and streaming variants.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage over the window that trips Closed → Open.
    /// Crossing the threshold exactly trips the circuit.
    pub failure_threshold: f64,
    /// Minimum records in the current window before the threshold applies.
    pub minimum_throughput: usize,
    /// Rolling window length; older records are purged on every access.
    pub sampling_window: Duration,
    /// How long the circuit stays Open before admitting trials.
    pub break_duration: Duration,
    /// Trials admitted while Half-Open.
    pub trial_requests: usize,
    /// A failed stream that already delivered at least this many items is
    /// recorded as a success. `None` disables reclassification.
    pub partial_success_threshold: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            minimum_throughput: 5,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            trial_requests: 3,
            partial_success_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    success: bool,
    at: u64,
    items: u64,
    duration_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    transitioned_at: u64,
    trials_admitted: usize,
    window: VecDeque<CallRecord>,
}

impl BreakerInner {
    fn purge(&mut self, config: &CircuitBreakerConfig, now: u64) {
        let horizon = now.saturating_sub(config.sampling_window.as_millis() as u64);
        while let Some(front) = self.window.front() {
            if front.at < horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|r| !r.success).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }
}

/// Result of asking the breaker whether a stream may start.
#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Admitted {
        /// True when admitted as a Half-Open trial.
        trial: bool,
    },
    Rejected {
        failure_rate: f64,
        retry_after: Duration,
    },
}

/// Point-in-time view of a breaker, for inspection and tests.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub window_len: usize,
    pub failure_rate: f64,
    /// Items delivered by the streams in the current window.
    pub window_items: u64,
    /// Mean stream duration over the current window, in milliseconds.
    pub mean_duration_ms: u64,
}

/// Per-request-type breaker state. All transitions happen under its lock.
#[derive(Debug)]
pub struct BreakerState {
    inner: Mutex<BreakerInner>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                transitioned_at: 0,
                trials_admitted: 0,
                window: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether one stream may start now.
    pub fn admit(&self, config: &CircuitBreakerConfig, now: u64) -> Admission {
        let mut inner = self.lock();
        inner.purge(config, now);

        match inner.state {
            CircuitState::Closed => Admission::Admitted { trial: false },
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.transitioned_at);
                let break_ms = config.break_duration.as_millis() as u64;
                if elapsed >= break_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.transitioned_at = now;
                    inner.trials_admitted = 1;
                    tracing::info!("circuit breaker → half-open");
                    Admission::Admitted { trial: true }
                } else {
                    Admission::Rejected {
                        failure_rate: inner.failure_rate(),
                        retry_after: Duration::from_millis(break_ms - elapsed),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted < config.trial_requests {
                    inner.trials_admitted += 1;
                    Admission::Admitted { trial: true }
                } else {
                    Admission::Rejected {
                        failure_rate: inner.failure_rate(),
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }

    /// Record one finished stream (or request, for the unary variant, with
    /// `items = 0`).
    pub fn record(
        &self,
        config: &CircuitBreakerConfig,
        now: u64,
        success: bool,
        items: u64,
        duration: Duration,
    ) {
        let mut inner = self.lock();
        inner.purge(config, now);

        inner.window.push_back(CallRecord {
            success,
            at: now,
            items,
            duration_ms: duration.as_millis() as u64,
        });
        while inner.window.len() > WINDOW_MAX_RECORDS {
            inner.window.pop_front();
        }

        match inner.state {
            CircuitState::Closed => {
                let total = inner.window.len();
                let rate = inner.failure_rate();
                if total >= config.minimum_throughput && rate >= config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.transitioned_at = now;
                    tracing::error!(
                        failure_rate = rate,
                        records = total,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if !success {
                    inner.state = CircuitState::Open;
                    inner.transitioned_at = now;
                    tracing::warn!("circuit breaker: trial failed → open");
                } else if inner.trials_admitted >= config.trial_requests {
                    inner.state = CircuitState::Closed;
                    inner.transitioned_at = now;
                    inner.trials_admitted = 0;
                    inner.window.clear();
                    tracing::info!("circuit breaker → closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self, config: &CircuitBreakerConfig, now: u64) -> BreakerSnapshot {
        let mut inner = self.lock();
        inner.purge(config, now);
        let window_items = inner.window.iter().map(|r| r.items).sum();
        let mean_duration_ms = if inner.window.is_empty() {
            0
        } else {
            inner.window.iter().map(|r| r.duration_ms).sum::<u64>() / inner.window.len() as u64
        };
        BreakerSnapshot {
            state: inner.state,
            window_len: inner.window.len(),
            failure_rate: inner.failure_rate(),
            window_items,
            mean_duration_ms,
        }
    }

    /// Force the breaker back to Closed, clearing all history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.transitioned_at = 0;
        inner.trials_admitted = 0;
        inner.window.clear();
    }
}

/// Streaming circuit-breaker behavior.
///
/// Admits once per stream, forwards items untouched, and records the outcome
/// when the stream terminates. Cancellation records neither success nor
/// failure. Handler failures propagate unchanged after recording.
pub struct CircuitBreakerBehavior<E> {
    config: CircuitBreakerConfig,
    should_count: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    registry: crate::circuit_breaker_registry::CircuitBreakerRegistry,
    clock: Arc<dyn Clock>,
}

impl<E> CircuitBreakerBehavior<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            should_count: Arc::new(|_| true),
            registry: crate::circuit_breaker_registry::CircuitBreakerRegistry::global(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Use a private registry instead of the process-wide one. Tests use this
    /// for a fresh state scope.
    pub fn with_registry(
        mut self,
        registry: crate::circuit_breaker_registry::CircuitBreakerRegistry,
    ) -> Self {
        self.registry = registry;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Exclude some failures from breaker statistics. A failure for which the
    /// predicate returns `false` is not recorded at all.
    pub fn should_count_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_count = Arc::new(predicate);
        self
    }
}

impl<R> StreamBehavior<R> for CircuitBreakerBehavior<<R as StreamRequest>::Error>
where
    R: StreamRequest,
{
    fn handle(
        &self,
        request: R,
        next: Next<R>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ItemStream<R::Item, R::Error> {
        let state = self.registry.state_for::<R>();
        let now = self.clock.now_millis();

        match state.admit(&self.config, now) {
            Admission::Rejected { failure_rate, retry_after } => {
                tracing::warn!(
                    request_type = std::any::type_name::<R>(),
                    failure_rate,
                    "stream rejected: circuit open"
                );
                let err = PipelineError::CircuitOpen {
                    request_type: std::any::type_name::<R>(),
                    failure_rate,
                    retry_after,
                };
                return Box::pin(futures::stream::iter(std::iter::once(
                    Err::<R::Item, PipelineError<R::Error>>(err),
                )));
            }
            Admission::Admitted { trial } => {
                if trial {
                    tracing::debug!(
                        request_type = std::any::type_name::<R>(),
                        "stream admitted as half-open trial"
                    );
                }
            }
        }

        let (tx, rx) = bridge::unbounded::<R::Item, PipelineError<R::Error>>();
        let config = self.config.clone();
        let should_count = Arc::clone(&self.should_count);
        let clock = Arc::clone(&self.clock);
        let started = now;

        tokio::spawn(async move {
            let mut upstream = next.run(request, cancel.clone());
            let mut items = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Cancellation is not an outcome; record nothing.
                        tx.close();
                        return;
                    }
                    item = upstream.next() => match item {
                        None => {
                            let finished = clock.now_millis();
                            state.record(
                                &config,
                                finished,
                                true,
                                items,
                                Duration::from_millis(finished.saturating_sub(started)),
                            );
                            tx.close();
                            return;
                        }
                        Some(Ok(value)) => {
                            items += 1;
                            if tx.send(value).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            let finished = clock.now_millis();
                            let counts = match &err {
                                PipelineError::Inner(inner) => (should_count)(inner),
                                _ => true,
                            };
                            if counts {
                                let as_success = config
                                    .partial_success_threshold
                                    .is_some_and(|threshold| items >= threshold);
                                state.record(
                                    &config,
                                    finished,
                                    as_success,
                                    items,
                                    Duration::from_millis(finished.saturating_sub(started)),
                                );
                            }
                            tx.fault(err);
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(rx.into_stream())
    }
}

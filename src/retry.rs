//! Streaming retry driver
//!
//! Runs the downstream stream inside a restart loop. Items delivered on a
//! failed attempt stay delivered; every restart re-runs the downstream from
//! its first item, so delivery across attempts is at-least-once, never
//! exactly-once.

use crate::backoff::RetryBackoff;
use crate::bridge;
use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamRequest};
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Tuning for the streaming retry driver.
pub struct StreamRetryOptions<E> {
    /// Restarts allowed after the initial attempt.
    pub max_retry_attempts: usize,
    /// Delay strategy between attempts.
    pub backoff: RetryBackoff,
    /// Elapsed-time budget: no restart is scheduled once
    /// `elapsed + next delay` would reach this.
    pub max_total_retry_time: Duration,
    /// Declared option: resume from the last delivered sequence number
    /// instead of restarting. Only honored when the handler itself is
    /// seekable; no such handler interface exists today, so the driver
    /// always restarts from the first item.
    pub resume_from_last_delivered: bool,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> Clone for StreamRetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_retry_attempts: self.max_retry_attempts,
            backoff: self.backoff.clone(),
            max_total_retry_time: self.max_total_retry_time,
            resume_from_last_delivered: self.resume_from_last_delivered,
            should_retry: self.should_retry.clone(),
        }
    }
}

impl<E> std::fmt::Debug for StreamRetryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRetryOptions")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("backoff", &self.backoff)
            .field("max_total_retry_time", &self.max_total_retry_time)
            .field("resume_from_last_delivered", &self.resume_from_last_delivered)
            .finish()
    }
}

impl<E> StreamRetryOptions<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff: RetryBackoff::exponential(Duration::from_secs(1)),
            max_total_retry_time: Duration::from_secs(30),
            resume_from_last_delivered: false,
            should_retry: Arc::new(|_| true),
        }
    }

    pub fn max_retry_attempts(mut self, retries: usize) -> Self {
        self.max_retry_attempts = retries;
        self
    }

    pub fn backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_total_retry_time(mut self, budget: Duration) -> Self {
        self.max_total_retry_time = budget;
        self
    }

    pub fn resume_from_last_delivered(mut self, resume: bool) -> Self {
        self.resume_from_last_delivered = resume;
        self
    }

    /// Classify which handler failures are transient. Failures the predicate
    /// rejects propagate unchanged without a single retry.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Whether the configured predicate classifies `error` as transient.
    pub fn is_retryable(&self, error: &E) -> bool {
        (self.should_retry)(error)
    }
}

impl<E> Default for StreamRetryOptions<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Retry behavior for streaming dispatch.
pub struct StreamRetryBehavior<E> {
    options: StreamRetryOptions<E>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl<E> StreamRetryBehavior<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(options: StreamRetryOptions<E>) -> Self {
        Self {
            options,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the sleeper (useful for deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl<R> StreamBehavior<R> for StreamRetryBehavior<<R as StreamRequest>::Error>
where
    R: StreamRequest,
{
    fn handle(
        &self,
        request: R,
        next: Next<R>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ItemStream<R::Item, R::Error> {
        let (tx, rx) = bridge::unbounded::<R::Item, PipelineError<R::Error>>();
        let options = self.options.clone();
        let sleeper = Arc::clone(&self.sleeper);
        let clock = Arc::clone(&self.clock);

        if options.resume_from_last_delivered {
            tracing::debug!(
                request_type = std::any::type_name::<R>(),
                "resume-from-position requested but the handler is not seekable; \
                 restarting from the first item on every attempt"
            );
        }

        tokio::spawn(async move {
            let started = clock.now_millis();
            let budget_ms = options.max_total_retry_time.as_millis() as u64;
            let mut failed_attempts = 0usize;
            let mut total_items = 0u64;

            loop {
                let mut upstream = next.run(request.clone(), cancel.clone());

                let failure = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tx.close();
                            return;
                        }
                        item = upstream.next() => match item {
                            None => {
                                tx.close();
                                return;
                            }
                            Some(Ok(value)) => {
                                total_items += 1;
                                if tx.send(value).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(err)) => break err,
                        }
                    }
                };

                let inner = match failure {
                    PipelineError::Inner(e) if (options.should_retry)(&e) => e,
                    other => {
                        // Non-retryable (or not a handler failure at all):
                        // propagate unchanged.
                        tx.fault(other);
                        return;
                    }
                };

                if failed_attempts >= options.max_retry_attempts {
                    tracing::warn!(
                        request_type = std::any::type_name::<R>(),
                        attempts = failed_attempts + 1,
                        items = total_items,
                        "stream retry attempts exhausted"
                    );
                    tx.fault(PipelineError::StreamAborted {
                        items_produced: total_items,
                        attempts: failed_attempts + 1,
                        source: inner,
                    });
                    return;
                }

                let delay = options.backoff.delay(failed_attempts);
                let elapsed = clock.now_millis().saturating_sub(started);
                if elapsed + delay.as_millis() as u64 >= budget_ms {
                    tracing::warn!(
                        request_type = std::any::type_name::<R>(),
                        attempts = failed_attempts + 1,
                        elapsed_ms = elapsed,
                        "stream retry budget exhausted"
                    );
                    tx.fault(PipelineError::StreamAborted {
                        items_produced: total_items,
                        attempts: failed_attempts + 1,
                        source: inner,
                    });
                    return;
                }

                tracing::debug!(
                    request_type = std::any::type_name::<R>(),
                    attempt = failed_attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "stream failed; restarting after delay"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tx.close();
                        return;
                    }
                    _ = sleeper.sleep(delay) => {}
                }

                failed_attempts += 1;
            }
        });

        Box::pin(rx.into_stream())
    }
}

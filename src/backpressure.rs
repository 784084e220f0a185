//! Backpressure valve for streaming dispatch.
//!
//! A session-scoped mediator between a producer task that iterates the
//! downstream sequence and a consumer loop that yields to the caller, over a
//! bounded bridge of `max_buffer_size` items. The valve estimates channel
//! occupancy as `produced - consumed` (an overestimate once items have been
//! dropped), engages at the high water mark and, once engaged, releases only
//! at the low water mark.

use crate::bridge::{self, BridgeSendTimeout};
use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamRequest};
use crate::session::StreamSession;
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Buffer strategy: how long a write may wait before degrading to a drop.
const BUFFER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Block strategy: occupancy poll interval.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Block strategy: safety limit for a single block episode.
const BLOCK_SAFETY_TIMEOUT: Duration = Duration::from_secs(30);

/// What the valve does with an item while backpressure is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Wait up to one second for channel space, then drop.
    Buffer,
    /// Drop the incoming item when the buffer estimate is at capacity.
    Drop,
    /// Delay each write in proportion to buffer pressure.
    Throttle,
    /// Keep every `sample_rate`-th item, drop the rest.
    Sample,
    /// Poll until occupancy falls to the low water mark, then write.
    Block,
}

impl std::fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackpressureStrategy::Buffer => "buffer",
            BackpressureStrategy::Drop => "drop",
            BackpressureStrategy::Throttle => "throttle",
            BackpressureStrategy::Sample => "sample",
            BackpressureStrategy::Block => "block",
        };
        write!(f, "{name}")
    }
}

/// Occupancy view handed to a custom trigger.
#[derive(Debug, Clone, Copy)]
pub struct PressureSnapshot {
    pub produced: u64,
    pub consumed: u64,
    pub est_buffer: u64,
    pub max_buffer_size: usize,
}

/// Tuning for the backpressure valve.
#[derive(Clone)]
pub struct BackpressureOptions {
    pub strategy: BackpressureStrategy,
    /// Channel capacity; writes on the underlying bridge wait when full.
    pub max_buffer_size: usize,
    /// Fraction of `max_buffer_size` at which backpressure engages.
    pub high_watermark: f64,
    /// Fraction of `max_buffer_size` below which backpressure releases.
    pub low_watermark: f64,
    /// Throttle strategy: delay at full pressure.
    pub max_throttle_delay: Duration,
    /// Sample strategy: keep items whose sequence number is a multiple of this.
    pub sample_rate: u64,
    /// Drop strategy intent flag. Both intents currently drop the incoming
    /// item; eviction of older buffered items is not implemented.
    pub prefer_newer_items: bool,
    custom_trigger: Option<Arc<dyn Fn(&PressureSnapshot) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for BackpressureOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureOptions")
            .field("strategy", &self.strategy)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("high_watermark", &self.high_watermark)
            .field("low_watermark", &self.low_watermark)
            .field("max_throttle_delay", &self.max_throttle_delay)
            .field("sample_rate", &self.sample_rate)
            .field("prefer_newer_items", &self.prefer_newer_items)
            .field("custom_trigger", &self.custom_trigger.is_some())
            .finish()
    }
}

impl Default for BackpressureOptions {
    fn default() -> Self {
        Self {
            strategy: BackpressureStrategy::Buffer,
            max_buffer_size: 10_000,
            high_watermark: 0.8,
            low_watermark: 0.5,
            max_throttle_delay: Duration::from_millis(500),
            sample_rate: 1,
            prefer_newer_items: true,
            custom_trigger: None,
        }
    }
}

impl BackpressureOptions {
    pub fn strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size.max(1);
        self
    }

    pub fn watermarks(mut self, high: f64, low: f64) -> Self {
        self.high_watermark = high.clamp(0.0, 1.0);
        self.low_watermark = low.clamp(0.0, self.high_watermark);
        self
    }

    pub fn max_throttle_delay(mut self, delay: Duration) -> Self {
        self.max_throttle_delay = delay;
        self
    }

    pub fn sample_rate(mut self, rate: u64) -> Self {
        self.sample_rate = rate.max(1);
        self
    }

    pub fn prefer_newer_items(mut self, prefer: bool) -> Self {
        self.prefer_newer_items = prefer;
        self
    }

    /// Additional activation condition, evaluated per produced item while
    /// backpressure is inactive.
    pub fn custom_trigger<F>(mut self, trigger: F) -> Self
    where
        F: Fn(&PressureSnapshot) -> bool + Send + Sync + 'static,
    {
        self.custom_trigger = Some(Arc::new(trigger));
        self
    }
}

/// Session-end statistics for one pass through the valve.
#[derive(Debug, Clone)]
pub struct BackpressureReport {
    pub session_id: String,
    pub request_type: &'static str,
    pub strategy: BackpressureStrategy,
    pub produced: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub sampled_out: u64,
    pub throttle_delay: Duration,
    pub block_time: Duration,
    /// Fraction of wall-clock session time spent with backpressure active.
    pub active_fraction: f64,
    pub duration: Duration,
    /// 0–100 summary of how well the strategy preserved system goals.
    pub effectiveness: f64,
}

/// Internal envelope written to the bridge; unwrapped by the yielding loop.
struct Envelope<T> {
    value: T,
    seq: u64,
    produced_at: u64,
    backpressure_applied: bool,
    sampled: bool,
}

fn effectiveness_score(
    strategy: BackpressureStrategy,
    produced: u64,
    dropped: u64,
    accrued_delay_ms: u64,
    duration_ms: u64,
    active_fraction: f64,
) -> f64 {
    use BackpressureStrategy::{Block, Drop, Sample, Throttle};
    let mut score = 100.0;

    // Unintended loss: Drop and Sample lose data on purpose.
    if produced > 0 && !matches!(strategy, Drop | Sample) {
        score -= 50.0 * (dropped as f64 / produced as f64);
    }

    // Excessive accrued delay: Throttle and Block trade latency on purpose.
    if duration_ms > 0 && !matches!(strategy, Throttle | Block) {
        let delay_fraction = (accrued_delay_ms as f64 / duration_ms as f64).min(1.0);
        score -= 30.0 * delay_fraction;
    }

    // Chronic pressure, whatever the strategy.
    score -= 20.0 * (active_fraction - 0.5).max(0.0);

    score.clamp(0.0, 100.0)
}

/// Backpressure behavior for streaming dispatch.
///
/// Does not catch: producer-task failures reach the consumer through the
/// bridge fault path untouched.
pub struct BackpressureBehavior {
    options: BackpressureOptions,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    on_complete: Option<Arc<dyn Fn(&BackpressureReport) + Send + Sync>>,
}

impl BackpressureBehavior {
    pub fn new(options: BackpressureOptions) -> Self {
        Self {
            options,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            on_complete: None,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper (useful for deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Observe the session report when the stream finishes.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BackpressureReport) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

struct ProducerCtx {
    session: Arc<StreamSession>,
    options: BackpressureOptions,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    high: u64,
    low: u64,
    active_since: Option<u64>,
}

impl ProducerCtx {
    /// Hysteresis step for one produced item. Returns whether backpressure is
    /// active for this item.
    fn update_pressure(&mut self, now: u64) -> bool {
        let est = self.session.estimated_buffer();

        if let Some(since) = self.active_since {
            if est <= self.low {
                self.session.add_active_time(now.saturating_sub(since));
                self.active_since = None;
                tracing::debug!(
                    session = self.session.id(),
                    est_buffer = est,
                    "backpressure released"
                );
            }
        }

        if self.active_since.is_none() {
            let triggered = est >= self.high
                || self.options.custom_trigger.as_ref().is_some_and(|trigger| {
                    trigger(&PressureSnapshot {
                        produced: self.session.produced(),
                        consumed: self.session.consumed(),
                        est_buffer: est,
                        max_buffer_size: self.options.max_buffer_size,
                    })
                });
            if triggered {
                self.active_since = Some(now);
                tracing::debug!(
                    session = self.session.id(),
                    est_buffer = est,
                    high = self.high,
                    "backpressure engaged"
                );
            }
        }

        self.active_since.is_some()
    }

    fn finish(&mut self, now: u64) {
        if let Some(since) = self.active_since.take() {
            self.session.add_active_time(now.saturating_sub(since));
        }
    }
}

impl<R> StreamBehavior<R> for BackpressureBehavior
where
    R: StreamRequest,
{
    fn handle(
        &self,
        request: R,
        next: Next<R>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ItemStream<R::Item, R::Error> {
        let session = Arc::new(StreamSession::new(std::any::type_name::<R>(), &*self.clock));
        let options = self.options.clone();
        let (tx, rx) =
            bridge::bounded::<Envelope<R::Item>, PipelineError<R::Error>>(options.max_buffer_size);

        let mut ctx = ProducerCtx {
            session: Arc::clone(&session),
            high: (options.max_buffer_size as f64 * options.high_watermark).floor() as u64,
            low: (options.max_buffer_size as f64 * options.low_watermark).floor() as u64,
            options,
            clock: Arc::clone(&self.clock),
            sleeper: Arc::clone(&self.sleeper),
            active_since: None,
        };

        let producer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut upstream = next.run(request, producer_cancel.clone());
            let mut seq = 0u64;

            loop {
                let item = tokio::select! {
                    _ = producer_cancel.cancelled() => {
                        ctx.finish(ctx.clock.now_millis());
                        tx.close();
                        return;
                    }
                    item = upstream.next() => item,
                };

                match item {
                    None => {
                        ctx.finish(ctx.clock.now_millis());
                        tx.close();
                        return;
                    }
                    Some(Err(err)) => {
                        ctx.session.push_error(err.to_string());
                        ctx.finish(ctx.clock.now_millis());
                        tx.fault(err);
                        return;
                    }
                    Some(Ok(value)) => {
                        seq += 1;
                        let now = ctx.clock.now_millis();
                        ctx.session.note_produced(now);
                        let active = ctx.update_pressure(now);

                        let mut envelope = Envelope {
                            value,
                            seq,
                            produced_at: now,
                            backpressure_applied: active,
                            sampled: false,
                        };

                        if !active {
                            if tx.send(envelope).await.is_err() {
                                ctx.finish(ctx.clock.now_millis());
                                return;
                            }
                            continue;
                        }

                        match ctx.options.strategy {
                            BackpressureStrategy::Buffer => {
                                match tx.send_timeout(envelope, BUFFER_WRITE_TIMEOUT).await {
                                    Ok(()) => {}
                                    Err(BridgeSendTimeout::TimedOut) => {
                                        ctx.session.note_dropped();
                                        tracing::debug!(
                                            session = ctx.session.id(),
                                            seq,
                                            "buffer write timed out; item dropped"
                                        );
                                    }
                                    Err(BridgeSendTimeout::Closed) => {
                                        ctx.finish(ctx.clock.now_millis());
                                        return;
                                    }
                                }
                            }
                            BackpressureStrategy::Drop => {
                                let est = ctx.session.estimated_buffer();
                                if est >= ctx.options.max_buffer_size as u64 {
                                    // Either prefer_newer_items intent drops the
                                    // incoming item; older buffered items stay.
                                    ctx.session.note_dropped();
                                    tracing::trace!(
                                        session = ctx.session.id(),
                                        seq,
                                        est_buffer = est,
                                        "buffer estimate at capacity; item dropped"
                                    );
                                } else if tx.send(envelope).await.is_err() {
                                    ctx.finish(ctx.clock.now_millis());
                                    return;
                                }
                            }
                            BackpressureStrategy::Throttle => {
                                let est = ctx.session.estimated_buffer();
                                let pressure =
                                    (est as f64 / ctx.options.max_buffer_size as f64).min(1.0);
                                let delay = ctx.options.max_throttle_delay.mul_f64(pressure);
                                if !delay.is_zero() {
                                    tokio::select! {
                                        _ = producer_cancel.cancelled() => {
                                            ctx.finish(ctx.clock.now_millis());
                                            tx.close();
                                            return;
                                        }
                                        _ = ctx.sleeper.sleep(delay) => {}
                                    }
                                    ctx.session.add_throttle_delay(delay.as_millis() as u64);
                                }
                                if tx.send(envelope).await.is_err() {
                                    ctx.finish(ctx.clock.now_millis());
                                    return;
                                }
                            }
                            BackpressureStrategy::Sample => {
                                let rate = ctx.options.sample_rate.max(1);
                                if seq % rate == 0 {
                                    envelope.sampled = true;
                                    if tx.send(envelope).await.is_err() {
                                        ctx.finish(ctx.clock.now_millis());
                                        return;
                                    }
                                } else {
                                    ctx.session.note_sampled_out();
                                }
                            }
                            BackpressureStrategy::Block => {
                                let block_started = ctx.clock.now_millis();
                                loop {
                                    if ctx.session.estimated_buffer() <= ctx.low {
                                        break;
                                    }
                                    let waited = ctx
                                        .clock
                                        .now_millis()
                                        .saturating_sub(block_started);
                                    if waited >= BLOCK_SAFETY_TIMEOUT.as_millis() as u64 {
                                        tracing::warn!(
                                            session = ctx.session.id(),
                                            waited_ms = waited,
                                            "block episode hit safety timeout"
                                        );
                                        break;
                                    }
                                    tokio::select! {
                                        _ = producer_cancel.cancelled() => {
                                            ctx.finish(ctx.clock.now_millis());
                                            tx.close();
                                            return;
                                        }
                                        _ = ctx.sleeper.sleep(BLOCK_POLL_INTERVAL) => {}
                                    }
                                    tokio::task::yield_now().await;
                                }
                                let waited =
                                    ctx.clock.now_millis().saturating_sub(block_started);
                                if waited > 0 {
                                    ctx.session.add_block_time(waited);
                                }
                                if tx.send(envelope).await.is_err() {
                                    ctx.finish(ctx.clock.now_millis());
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        // Yielding loop: unwrap envelopes, count consumption, finalize stats.
        struct ConsumerState<T, E: std::error::Error + 'static> {
            stream: futures::stream::BoxStream<'static, Result<Envelope<T>, PipelineError<E>>>,
            session: Arc<StreamSession>,
            clock: Arc<dyn Clock>,
            strategy: BackpressureStrategy,
            on_complete: Option<Arc<dyn Fn(&BackpressureReport) + Send + Sync>>,
            cancel: tokio_util::sync::CancellationToken,
            done: bool,
        }

        impl<T, E: std::error::Error + 'static> ConsumerState<T, E> {
            fn finalize(&mut self) {
                if self.done {
                    return;
                }
                self.done = true;

                let now = self.clock.now_millis();
                let duration_ms = now.saturating_sub(self.session.started_at());
                let active_fraction = if duration_ms > 0 {
                    (self.session.active_time_ms() as f64 / duration_ms as f64).min(1.0)
                } else {
                    0.0
                };
                let accrued_delay_ms =
                    self.session.throttle_delay_ms() + self.session.block_time_ms();
                let report = BackpressureReport {
                    session_id: self.session.id().to_string(),
                    request_type: self.session.request_type(),
                    strategy: self.strategy,
                    produced: self.session.produced(),
                    consumed: self.session.consumed(),
                    dropped: self.session.dropped(),
                    sampled_out: self.session.sampled_out(),
                    throttle_delay: Duration::from_millis(self.session.throttle_delay_ms()),
                    block_time: Duration::from_millis(self.session.block_time_ms()),
                    active_fraction,
                    duration: Duration::from_millis(duration_ms),
                    effectiveness: effectiveness_score(
                        self.strategy,
                        self.session.produced(),
                        self.session.dropped(),
                        accrued_delay_ms,
                        duration_ms,
                        active_fraction,
                    ),
                };

                tracing::info!(
                    session = %report.session_id,
                    request_type = report.request_type,
                    strategy = %report.strategy,
                    produced = report.produced,
                    consumed = report.consumed,
                    dropped = report.dropped,
                    sampled_out = report.sampled_out,
                    throttle_ms = report.throttle_delay.as_millis() as u64,
                    block_ms = report.block_time.as_millis() as u64,
                    active_fraction = report.active_fraction,
                    effectiveness = report.effectiveness,
                    "backpressure session finished"
                );

                if let Some(callback) = &self.on_complete {
                    callback(&report);
                }
            }
        }

        let state = ConsumerState::<R::Item, R::Error> {
            stream: Box::pin(rx.into_stream()),
            session,
            clock: Arc::clone(&self.clock),
            strategy: self.options.strategy,
            on_complete: self.on_complete.clone(),
            cancel,
            done: false,
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            let item = tokio::select! {
                _ = state.cancel.cancelled() => None,
                item = state.stream.next() => item,
            };
            match item {
                Some(Ok(envelope)) => {
                    let now = state.clock.now_millis();
                    state.session.note_consumed(now);
                    tracing::trace!(
                        session = state.session.id(),
                        seq = envelope.seq,
                        latency_ms = now.saturating_sub(envelope.produced_at),
                        backpressure = envelope.backpressure_applied,
                        sampled = envelope.sampled,
                        "item delivered"
                    );
                    Some((Ok(envelope.value), state))
                }
                Some(Err(err)) => Some((Err(err), state)),
                None => {
                    state.finalize();
                    None
                }
            }
        }))
    }
}

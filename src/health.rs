//! Health reporter for streaming dispatch.
//!
//! Aggregates throughput, stall, memory-growth and error-rate signals for one
//! stream session and pushes reports to a [`HealthSink`] every check
//! interval, plus a final report when the stream finishes. Producer failures
//! become a critical warning and re-raise; they are never swallowed.

use crate::bridge;
use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamRequest};
use crate::resource::{MemorySampler, SysinfoSampler};
use crate::session::new_session_id;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Low-throughput checks only apply once this many items were produced.
const MIN_ITEMS_FOR_THROUGHPUT: u64 = 100;

/// Rolling classification of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    Failed,
}

/// One observed health signal.
#[derive(Debug, Clone)]
pub enum HealthWarning {
    /// No item was produced for longer than the stall threshold.
    Stall { idle: Duration },
    /// Memory grew past the growth threshold since the session baseline.
    MemoryGrowth { grown_bytes: u64 },
    /// Observed throughput fell below the configured minimum.
    LowThroughput { items_per_sec: f64 },
    /// Error fraction exceeded the configured maximum.
    HighErrorRate { rate: f64 },
    /// The stream terminated with a failure.
    StreamFailed { message: String },
}

impl HealthWarning {
    /// Stall, error-rate and resource-exhaustion warnings go through the
    /// sink's critical path.
    pub fn is_critical(&self) -> bool {
        !matches!(self, HealthWarning::LowThroughput { .. })
    }
}

impl std::fmt::Display for HealthWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthWarning::Stall { idle } => write!(f, "stream stalled for {idle:?}"),
            HealthWarning::MemoryGrowth { grown_bytes } => {
                write!(f, "memory grew by {grown_bytes} bytes")
            }
            HealthWarning::LowThroughput { items_per_sec } => {
                write!(f, "throughput {items_per_sec:.1} items/s below minimum")
            }
            HealthWarning::HighErrorRate { rate } => {
                write!(f, "error rate {:.2}% above maximum", rate * 100.0)
            }
            HealthWarning::StreamFailed { message } => write!(f, "stream failed: {message}"),
        }
    }
}

/// Metrics snapshot pushed to a sink.
#[derive(Debug, Clone)]
pub struct StreamHealthReport {
    pub session_id: String,
    pub request_type: &'static str,
    pub status: HealthStatus,
    pub produced: u64,
    pub errors: u64,
    pub items_per_sec: f64,
    pub memory_grown_bytes: u64,
    pub elapsed: Duration,
    pub warnings: Vec<HealthWarning>,
    /// True for the report pushed on stream completion.
    pub final_report: bool,
}

/// Where health reports go.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn report(&self, metrics: &StreamHealthReport);
    async fn report_critical(&self, metrics: &StreamHealthReport, warning: &HealthWarning);
}

/// Sink that logs reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHealthSink;

#[async_trait]
impl HealthSink for LogHealthSink {
    async fn report(&self, metrics: &StreamHealthReport) {
        tracing::info!(
            session = %metrics.session_id,
            request_type = metrics.request_type,
            status = ?metrics.status,
            produced = metrics.produced,
            errors = metrics.errors,
            items_per_sec = metrics.items_per_sec,
            memory_grown = metrics.memory_grown_bytes,
            final_report = metrics.final_report,
            "stream health"
        );
    }

    async fn report_critical(&self, metrics: &StreamHealthReport, warning: &HealthWarning) {
        tracing::warn!(
            session = %metrics.session_id,
            request_type = metrics.request_type,
            warning = %warning,
            "critical stream health warning"
        );
    }
}

/// Sink that stores reports in memory, for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryHealthSink {
    reports: Arc<Mutex<Vec<StreamHealthReport>>>,
    criticals: Arc<Mutex<Vec<(StreamHealthReport, HealthWarning)>>>,
}

impl MemoryHealthSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<StreamHealthReport> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn criticals(&self) -> Vec<(StreamHealthReport, HealthWarning)> {
        self.criticals.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn last_report(&self) -> Option<StreamHealthReport> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).last().cloned()
    }
}

#[async_trait]
impl HealthSink for MemoryHealthSink {
    async fn report(&self, metrics: &StreamHealthReport) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(metrics.clone());
    }

    async fn report_critical(&self, metrics: &StreamHealthReport, warning: &HealthWarning) {
        self.criticals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((metrics.clone(), warning.clone()));
    }
}

/// Tuning for the health reporter.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub check_interval: Duration,
    pub stall_threshold: Duration,
    pub memory_growth_threshold: u64,
    /// Items per second, applied after 100 items produced.
    pub minimum_throughput: f64,
    /// Error fraction in `[0, 1]`, applied after the first item produced.
    pub maximum_error_rate: f64,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(120),
            memory_growth_threshold: 100 * 1024 * 1024,
            minimum_throughput: 50.0,
            maximum_error_rate: 0.05,
        }
    }
}

struct HealthState {
    session_id: String,
    request_type: &'static str,
    started_at: u64,
    baseline_memory: u64,
    produced: AtomicU64,
    errors: AtomicU64,
    last_item_at: AtomicU64,
    failed: AtomicBool,
}

impl HealthState {
    fn evaluate(&self, options: &HealthOptions, now: u64, current_memory: u64) -> Vec<HealthWarning> {
        let mut warnings = Vec::new();
        let produced = self.produced.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Acquire);

        let idle = now.saturating_sub(self.last_item_at.load(Ordering::Acquire));
        if idle > options.stall_threshold.as_millis() as u64 {
            warnings.push(HealthWarning::Stall { idle: Duration::from_millis(idle) });
        }

        let grown = current_memory.saturating_sub(self.baseline_memory);
        if grown > options.memory_growth_threshold {
            warnings.push(HealthWarning::MemoryGrowth { grown_bytes: grown });
        }

        let elapsed_ms = now.saturating_sub(self.started_at);
        if produced >= MIN_ITEMS_FOR_THROUGHPUT && elapsed_ms > 0 {
            let rate = produced as f64 * 1000.0 / elapsed_ms as f64;
            if rate < options.minimum_throughput {
                warnings.push(HealthWarning::LowThroughput { items_per_sec: rate });
            }
        }

        if produced >= 1 {
            let rate = errors as f64 / produced as f64;
            if rate > options.maximum_error_rate {
                warnings.push(HealthWarning::HighErrorRate { rate });
            }
        }

        warnings
    }

    fn classify(&self, warnings: &[HealthWarning]) -> HealthStatus {
        if self.failed.load(Ordering::Acquire) {
            return HealthStatus::Failed;
        }
        match warnings.len() {
            0 => HealthStatus::Healthy,
            1 | 2 => HealthStatus::Warning,
            _ => HealthStatus::Unhealthy,
        }
    }

    fn build_report(
        &self,
        options: &HealthOptions,
        now: u64,
        current_memory: u64,
        final_report: bool,
    ) -> StreamHealthReport {
        let warnings = self.evaluate(options, now, current_memory);
        let status = self.classify(&warnings);
        let produced = self.produced.load(Ordering::Acquire);
        let elapsed_ms = now.saturating_sub(self.started_at);
        let items_per_sec =
            if elapsed_ms > 0 { produced as f64 * 1000.0 / elapsed_ms as f64 } else { 0.0 };

        StreamHealthReport {
            session_id: self.session_id.clone(),
            request_type: self.request_type,
            status,
            produced,
            errors: self.errors.load(Ordering::Acquire),
            items_per_sec,
            memory_grown_bytes: current_memory.saturating_sub(self.baseline_memory),
            elapsed: Duration::from_millis(elapsed_ms),
            warnings,
            final_report,
        }
    }
}

async fn push_report(sink: &Arc<dyn HealthSink>, report: &StreamHealthReport) {
    for warning in &report.warnings {
        if warning.is_critical() {
            sink.report_critical(report, warning).await;
        }
    }
    sink.report(report).await;
}

/// Health-reporting behavior for streaming dispatch.
pub struct HealthReporterBehavior {
    options: HealthOptions,
    sink: Arc<dyn HealthSink>,
    sampler: Arc<dyn MemorySampler>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl HealthReporterBehavior {
    pub fn new(options: HealthOptions) -> Self {
        Self {
            options,
            sink: Arc::new(LogHealthSink),
            sampler: Arc::new(SysinfoSampler::new()),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sink<S: HealthSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_sampler<S: MemorySampler + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Arc::new(sampler);
        self
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
}

impl<R> StreamBehavior<R> for HealthReporterBehavior
where
    R: StreamRequest,
{
    fn handle(
        &self,
        request: R,
        next: Next<R>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ItemStream<R::Item, R::Error> {
        let now = self.clock.now_millis();
        let state = Arc::new(HealthState {
            session_id: new_session_id(),
            request_type: std::any::type_name::<R>(),
            started_at: now,
            baseline_memory: self.sampler.current_rss(),
            produced: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_item_at: AtomicU64::new(now),
            failed: AtomicBool::new(false),
        });

        let (tx, rx) = bridge::unbounded::<R::Item, PipelineError<R::Error>>();
        let done = tokio_util::sync::CancellationToken::new();

        // Periodic reporter, bounded by the session lifetime.
        {
            let state = Arc::clone(&state);
            let options = self.options.clone();
            let sink = Arc::clone(&self.sink);
            let sampler = Arc::clone(&self.sampler);
            let clock = Arc::clone(&self.clock);
            let sleeper = Arc::clone(&self.sleeper);
            let done = done.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.cancelled() => return,
                        _ = cancel.cancelled() => return,
                        _ = sleeper.sleep(options.check_interval) => {
                            let report = state.build_report(
                                &options,
                                clock.now_millis(),
                                sampler.current_rss(),
                                false,
                            );
                            push_report(&sink, &report).await;
                        }
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        let options = self.options.clone();
        let sink = Arc::clone(&self.sink);
        let sampler = Arc::clone(&self.sampler);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            let mut upstream = next.run(request, cancel.clone());
            loop {
                let item = tokio::select! {
                    // Cancellation is not a failure; push the final report
                    // and wind down.
                    _ = cancel.cancelled() => None,
                    item = upstream.next() => item,
                };
                match item {
                    None => {
                        done.cancel();
                        let report = state.build_report(
                            &options,
                            clock.now_millis(),
                            sampler.current_rss(),
                            true,
                        );
                        push_report(&sink, &report).await;
                        tx.close();
                        return;
                    }
                    Some(Ok(value)) => {
                        state.produced.fetch_add(1, Ordering::AcqRel);
                        state.last_item_at.store(clock.now_millis(), Ordering::Release);
                        if tx.send(value).await.is_err() {
                            done.cancel();
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        state.errors.fetch_add(1, Ordering::AcqRel);
                        state.failed.store(true, Ordering::Release);
                        done.cancel();

                        let mut report = state.build_report(
                            &options,
                            clock.now_millis(),
                            sampler.current_rss(),
                            true,
                        );
                        report
                            .warnings
                            .push(HealthWarning::StreamFailed { message: err.to_string() });
                        push_report(&sink, &report).await;

                        tx.fault(err);
                        return;
                    }
                }
            }
        });

        Box::pin(rx.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(30),
            memory_growth_threshold: 1000,
            minimum_throughput: 10.0,
            maximum_error_rate: 0.05,
        }
    }

    fn fresh_state(started_at: u64, baseline: u64) -> HealthState {
        HealthState {
            session_id: new_session_id(),
            request_type: "test::Req",
            started_at,
            baseline_memory: baseline,
            produced: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_item_at: AtomicU64::new(started_at),
            failed: AtomicBool::new(false),
        }
    }

    #[test]
    fn quiet_session_is_healthy() {
        let state = fresh_state(0, 100);
        let warnings = state.evaluate(&test_options(), 1_000, 100);
        assert!(warnings.is_empty());
        assert_eq!(state.classify(&warnings), HealthStatus::Healthy);
    }

    #[test]
    fn stall_is_detected_after_threshold() {
        let state = fresh_state(0, 100);
        state.last_item_at.store(0, Ordering::Release);
        let warnings = state.evaluate(&test_options(), 31_000, 100);
        assert!(matches!(warnings.as_slice(), [HealthWarning::Stall { .. }]));
        assert!(warnings[0].is_critical());
    }

    #[test]
    fn memory_growth_is_detected() {
        let state = fresh_state(0, 100);
        let warnings = state.evaluate(&test_options(), 1_000, 2_000);
        assert!(matches!(warnings.as_slice(), [HealthWarning::MemoryGrowth { grown_bytes: 1_900 }]));
    }

    #[test]
    fn low_throughput_needs_one_hundred_items() {
        let options = test_options();
        let state = fresh_state(0, 100);

        // 99 items in 100 s: far too slow, but under the item floor.
        state.produced.store(99, Ordering::Release);
        state.last_item_at.store(99_999, Ordering::Release);
        assert!(state.evaluate(&options, 100_000, 100).is_empty());

        // The 100th item arms the check: 100 items / 100 s = 1 item/s < 10.
        state.produced.store(100, Ordering::Release);
        let warnings = state.evaluate(&options, 100_000, 100);
        assert!(matches!(warnings.as_slice(), [HealthWarning::LowThroughput { .. }]));
        assert!(!warnings[0].is_critical());
    }

    #[test]
    fn high_error_rate_is_detected_after_first_item() {
        let state = fresh_state(0, 100);
        state.produced.store(10, Ordering::Release);
        state.errors.store(1, Ordering::Release);
        state.last_item_at.store(999, Ordering::Release);

        let warnings = state.evaluate(&test_options(), 1_000, 100);
        assert_eq!(warnings.len(), 1);
        match &warnings[0] {
            HealthWarning::HighErrorRate { rate } => assert!((*rate - 0.1).abs() < f64::EPSILON),
            other => panic!("expected HighErrorRate, got {other:?}"),
        }
    }

    #[test]
    fn warning_count_drives_classification() {
        let state = fresh_state(0, 100);
        // Stall + memory growth + low throughput + error rate all at once.
        state.produced.store(100, Ordering::Release);
        state.errors.store(50, Ordering::Release);
        state.last_item_at.store(0, Ordering::Release);

        let warnings = state.evaluate(&test_options(), 100_000, 1_000_000);
        assert!(warnings.len() >= 3);
        assert_eq!(state.classify(&warnings), HealthStatus::Unhealthy);

        assert_eq!(state.classify(&warnings[..2]), HealthStatus::Warning);
        assert_eq!(state.classify(&[]), HealthStatus::Healthy);

        state.failed.store(true, Ordering::Release);
        assert_eq!(state.classify(&[]), HealthStatus::Failed);
    }

    mod behavior {
        use super::*;
        use crate::handler::{HandlerStream, Next, StreamRequest};
        use tokio_util::sync::CancellationToken;

        #[derive(Debug, Clone)]
        struct Telemetry;

        #[derive(Debug, thiserror::Error)]
        #[error("telemetry interrupted")]
        struct TelemetryError;

        impl StreamRequest for Telemetry {
            type Item = u32;
            type Error = TelemetryError;
        }

        #[derive(Clone)]
        struct ZeroSampler;

        impl MemorySampler for ZeroSampler {
            fn current_rss(&self) -> u64 {
                0
            }
        }

        #[tokio::test]
        async fn completed_stream_pushes_healthy_final_report() {
            let sink = MemoryHealthSink::new();
            let behavior = HealthReporterBehavior::new(test_options())
                .with_sink(sink.clone())
                .with_sampler(ZeroSampler);

            let next = Next::from_handler(Arc::new(
                |_req: Telemetry, _cancel: CancellationToken| -> HandlerStream<u32, TelemetryError> {
                    Box::pin(futures::stream::iter((1..=5).map(Ok)))
                },
            ));

            let out: Vec<_> =
                behavior.handle(Telemetry, next, CancellationToken::new()).collect().await;
            assert_eq!(out.len(), 5);

            let last = sink.last_report().expect("final report pushed");
            assert!(last.final_report);
            assert_eq!(last.status, HealthStatus::Healthy);
            assert_eq!(last.produced, 5);
            assert!(sink.criticals().is_empty());
        }

        #[tokio::test]
        async fn producer_failure_reports_critical_and_reraises() {
            let sink = MemoryHealthSink::new();
            let behavior = HealthReporterBehavior::new(test_options())
                .with_sink(sink.clone())
                .with_sampler(ZeroSampler);

            let next = Next::from_handler(Arc::new(
                |_req: Telemetry, _cancel: CancellationToken| -> HandlerStream<u32, TelemetryError> {
                    Box::pin(futures::stream::iter(vec![Ok(1), Err(TelemetryError)]))
                },
            ));

            let out: Vec<_> =
                behavior.handle(Telemetry, next, CancellationToken::new()).collect().await;
            assert_eq!(out.len(), 2);
            assert!(matches!(out[1], Err(PipelineError::Inner(TelemetryError))));

            let criticals = sink.criticals();
            assert!(!criticals.is_empty(), "failure must reach the critical path");
            assert!(matches!(criticals[0].1, HealthWarning::StreamFailed { .. }));

            let last = sink.last_report().unwrap();
            assert_eq!(last.status, HealthStatus::Failed);
            assert!(last.final_report);
        }

        #[tokio::test]
        async fn cancellation_stays_healthy() {
            let sink = MemoryHealthSink::new();
            let behavior = HealthReporterBehavior::new(test_options())
                .with_sink(sink.clone())
                .with_sampler(ZeroSampler);

            let next = Next::from_handler(Arc::new(
                |_req: Telemetry, _cancel: CancellationToken| -> HandlerStream<u32, TelemetryError> {
                    Box::pin(futures::stream::pending())
                },
            ));

            let cancel = CancellationToken::new();
            let stream = behavior.handle(Telemetry, next, cancel.clone());
            cancel.cancel();
            let out: Vec<_> = stream.collect().await;
            assert!(out.is_empty());

            // Give the producer a moment to push its final report.
            tokio::task::yield_now().await;
            if let Some(last) = sink.last_report() {
                assert_eq!(last.status, HealthStatus::Healthy);
            }
            assert!(sink.criticals().is_empty());
        }
    }
}

//! End-to-end scenarios for the streaming dispatch pipeline.

use futures::StreamExt;
use midstream::{
    presets, BackpressureBehavior, BackpressureOptions, BackpressureReport, BackpressureStrategy,
    CircuitBreakerBehavior, CircuitBreakerRegistry, CircuitState, Clock, HandlerStream,
    PipelineError, StreamPipeline, StreamRequest, StreamRetryBehavior, TrackingSleeper,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct SensorFeed;

#[derive(Debug, Clone, thiserror::Error)]
enum SensorError {
    #[error("sensor read timed out")]
    Timeout,
    #[error("validation failed: bad probe id")]
    Validation,
}

impl StreamRequest for SensorFeed {
    type Item = u32;
    type Error = SensorError;
}

#[derive(Debug, Clone, Default)]
struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Handler that fails `failures` times before streaming `1..=items`.
fn flaky_handler(
    failures: usize,
    error: SensorError,
    items: u32,
    invocations: Arc<AtomicUsize>,
) -> impl Fn(SensorFeed, CancellationToken) -> HandlerStream<u32, SensorError> + Send + Sync + 'static
{
    move |_req, _cancel| {
        let run = invocations.fetch_add(1, Ordering::SeqCst);
        if run < failures {
            Box::pin(futures::stream::iter(vec![Err(error.clone())]))
        } else {
            Box::pin(futures::stream::iter((1..=items).map(Ok)))
        }
    }
}

// Scenario: two transient failures, then success on the third attempt.
#[tokio::test]
async fn retry_restart_delivers_final_attempt() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let sleeper = TrackingSleeper::new();

    let pipeline = StreamPipeline::builder()
        .behavior(
            StreamRetryBehavior::new(presets::retry::conservative())
                .with_sleeper(sleeper.clone()),
        )
        .build(flaky_handler(2, SensorError::Timeout, 3, invocations.clone()));

    let items: Vec<u32> = pipeline
        .dispatch(SensorFeed, CancellationToken::new())
        .map(|item| item.expect("stream should recover"))
        .collect()
        .await;

    assert_eq!(items, vec![1, 2, 3]);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    // Conservative preset waits a fixed 500 ms before each of the 2 restarts.
    assert_eq!(sleeper.total(), Duration::from_millis(1000));
}

// Scenario: every attempt fails; the driver gives up after the retry budget.
#[tokio::test]
async fn retry_exhaustion_reports_items_and_attempts() {
    let invocations = Arc::new(AtomicUsize::new(0));

    let pipeline = StreamPipeline::builder()
        .behavior(
            StreamRetryBehavior::new(presets::retry::conservative())
                .with_sleeper(midstream::InstantSleeper),
        )
        .build(flaky_handler(usize::MAX, SensorError::Timeout, 0, invocations.clone()));

    let out: Vec<_> =
        pipeline.dispatch(SensorFeed, CancellationToken::new()).collect().await;

    assert_eq!(out.len(), 1);
    match out.into_iter().next().unwrap() {
        Err(PipelineError::StreamAborted { items_produced, attempts, source }) => {
            assert_eq!(items_produced, 0);
            assert_eq!(attempts, 3);
            assert!(matches!(source, SensorError::Timeout));
        }
        other => panic!("expected StreamAborted, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

// Scenario: the database preset refuses to retry validation failures.
#[tokio::test]
async fn non_retryable_failure_is_not_retried() {
    let invocations = Arc::new(AtomicUsize::new(0));

    let pipeline = StreamPipeline::builder()
        .behavior(
            StreamRetryBehavior::new(presets::retry::database())
                .with_sleeper(midstream::InstantSleeper),
        )
        .build(flaky_handler(usize::MAX, SensorError::Validation, 0, invocations.clone()));

    let out: Vec<_> =
        pipeline.dispatch(SensorFeed, CancellationToken::new()).collect().await;

    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], Err(PipelineError::Inner(SensorError::Validation))));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// Scenario: the breaker trips after enough failures, rejects while open,
// admits trials after the break and closes on their success.
#[tokio::test]
async fn circuit_trips_rejects_then_recovers() {
    let registry = CircuitBreakerRegistry::new();
    let clock = ManualClock::default();
    let should_fail = Arc::new(AtomicBool::new(true));
    let invocations = Arc::new(AtomicUsize::new(0));

    let should_fail_handler = Arc::clone(&should_fail);
    let invocations_handler = Arc::clone(&invocations);
    let pipeline = StreamPipeline::builder()
        .behavior(
            CircuitBreakerBehavior::new(presets::circuit_breaker::balanced())
                .with_registry(registry.clone())
                .with_clock(clock.clone()),
        )
        .build(move |_req: SensorFeed, _cancel: CancellationToken| -> HandlerStream<u32, SensorError> {
            invocations_handler.fetch_add(1, Ordering::SeqCst);
            if should_fail_handler.load(Ordering::SeqCst) {
                Box::pin(futures::stream::iter(vec![Err(SensorError::Timeout)]))
            } else {
                Box::pin(futures::stream::iter((1..=2).map(Ok)))
            }
        });

    // Five counted failures meet the balanced preset's minimum throughput at
    // 100% failure rate.
    for _ in 0..5 {
        let out: Vec<_> =
            pipeline.dispatch(SensorFeed, CancellationToken::new()).collect().await;
        assert!(matches!(out[0], Err(PipelineError::Inner(SensorError::Timeout))));
    }
    let state = registry.state_for::<SensorFeed>();
    assert_eq!(state.current_state(), CircuitState::Open);

    // Requests 6..10 are rejected without reaching the handler.
    let before = invocations.load(Ordering::SeqCst);
    for _ in 0..5 {
        let out: Vec<_> =
            pipeline.dispatch(SensorFeed, CancellationToken::new()).collect().await;
        assert!(matches!(out[0], Err(PipelineError::CircuitOpen { .. })));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), before);

    // After the 30 s break, three successful trials close the circuit.
    should_fail.store(false, Ordering::SeqCst);
    clock.advance(30_001);
    for _ in 0..3 {
        let items: Vec<u32> = pipeline
            .dispatch(SensorFeed, CancellationToken::new())
            .map(|item| item.expect("trial should pass"))
            .collect()
            .await;
        assert_eq!(items, vec![1, 2]);
    }
    assert_eq!(state.current_state(), CircuitState::Closed);

    let snapshot =
        state.snapshot(&presets::circuit_breaker::balanced(), clock.now_millis());
    assert_eq!(snapshot.window_len, 0, "history cleared on recovery");
}

// Scenario: a burst far beyond the buffer under the Drop strategy sheds
// items without erroring and preserves order among survivors.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_burst_sheds_items_without_error() {
    let report: Arc<Mutex<Option<BackpressureReport>>> = Arc::new(Mutex::new(None));
    let report_slot = Arc::clone(&report);

    let options = BackpressureOptions::default()
        .strategy(BackpressureStrategy::Drop)
        .max_buffer_size(1000)
        .watermarks(0.7, 0.5);

    let pipeline = StreamPipeline::builder()
        .behavior(
            BackpressureBehavior::new(options)
                .on_complete(move |r| *report_slot.lock().unwrap() = Some(r.clone())),
        )
        .build(|_req: SensorFeed, _cancel: CancellationToken| -> HandlerStream<u32, SensorError> {
            Box::pin(futures::stream::iter((1..=5000).map(Ok)))
        });

    let survivors: Vec<u32> = pipeline
        .dispatch(SensorFeed, CancellationToken::new())
        .then(|item| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            item.expect("drop strategy must not error")
        })
        .collect()
        .await;

    assert!(survivors.len() >= 900, "survivors: {}", survivors.len());
    assert!(
        survivors.windows(2).all(|pair| pair[0] < pair[1]),
        "survivor order must be preserved"
    );

    let report = report.lock().unwrap().clone().expect("session report");
    assert_eq!(report.produced, 5000);
    assert!(report.dropped > 0);
    assert!(report.consumed <= report.produced);
    assert!((0.0..=100.0).contains(&report.effectiveness));
}

// Scenario: deterministic sampling keeps sequence numbers that are
// multiples of the sample rate, in order.
#[tokio::test]
async fn sampling_under_pressure_keeps_every_third_item() {
    let options = BackpressureOptions::default()
        .strategy(BackpressureStrategy::Sample)
        .sample_rate(3)
        .custom_trigger(|_| true);

    let pipeline = StreamPipeline::builder()
        .behavior(BackpressureBehavior::new(options))
        .build(|_req: SensorFeed, _cancel: CancellationToken| -> HandlerStream<u32, SensorError> {
            Box::pin(futures::stream::iter((1..=9).map(Ok)))
        });

    let items: Vec<u32> = pipeline
        .dispatch(SensorFeed, CancellationToken::new())
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(items, vec![3, 6, 9]);
}

// A handler that produces nothing completes cleanly.
#[tokio::test]
async fn empty_stream_completes_with_zero_counters() {
    let report: Arc<Mutex<Option<BackpressureReport>>> = Arc::new(Mutex::new(None));
    let report_slot = Arc::clone(&report);

    let pipeline = StreamPipeline::builder()
        .behavior(
            BackpressureBehavior::new(BackpressureOptions::default())
                .on_complete(move |r| *report_slot.lock().unwrap() = Some(r.clone())),
        )
        .behavior(
            StreamRetryBehavior::new(presets::retry::conservative())
                .with_sleeper(midstream::InstantSleeper),
        )
        .build(|_req: SensorFeed, _cancel: CancellationToken| -> HandlerStream<u32, SensorError> {
            Box::pin(futures::stream::empty())
        });

    let out: Vec<_> =
        pipeline.dispatch(SensorFeed, CancellationToken::new()).collect().await;
    assert!(out.is_empty());

    let report = report.lock().unwrap().clone().unwrap();
    assert_eq!(report.produced, 0);
    assert_eq!(report.consumed, 0);
}

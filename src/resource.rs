//! Resource monitor for streaming dispatch.
//!
//! Watches process memory while a stream runs: an absolute ceiling and a
//! growth-rate ceiling, checked on a background interval plus a cheap
//! per-item check every [`FAST_CHECK_EVERY`] items. Breaches trigger a
//! cleanup pass of configurable intensity and an optional user callback.
//!
//! Rust has no collector to nudge, so the managed-runtime intensities map to:
//! Conservative and Balanced log and account the pass (releasing slack is the
//! allocator's business), Aggressive additionally disposes resources the
//! tracker holds by weak reference.

use crate::bridge;
use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamRequest};
use crate::session::new_session_id;
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Per-item fast checks run once every this many items.
const FAST_CHECK_EVERY: u64 = 1000;
/// Completed session records are evicted once they are this old.
const SESSION_RETENTION: Duration = Duration::from_secs(600);

/// Source of current process memory usage, injectable for tests.
pub trait MemorySampler: Send + Sync {
    /// Resident set size of this process, in bytes.
    fn current_rss(&self) -> u64;
}

/// Production sampler reading process RSS through `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn current_rss(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(|process| process.memory()).unwrap_or(0)
    }
}

/// A resource the monitor may force-dispose during an aggressive cleanup.
pub trait TrackedResource: Send + Sync {
    fn dispose(&self);
}

/// How much work a cleanup pass does when thresholds are exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupIntensity {
    /// Log and account the pass only.
    Conservative,
    /// Conservative, plus request compaction of long-lived buffers on the
    /// next pass (accounting only on this runtime).
    Balanced,
    /// Balanced, plus dispose every tracked resource still alive.
    Aggressive,
}

/// Tuning for the resource monitor.
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    /// Absolute process memory ceiling.
    pub max_memory_bytes: u64,
    /// Growth ceiling in bytes per second, measured against the session
    /// baseline.
    pub growth_rate_threshold: f64,
    pub cleanup: CleanupIntensity,
    /// Background check cadence; also throttles the process-wide session
    /// sweep.
    pub monitoring_interval: Duration,
    /// Attach extended properties to pressure contexts.
    pub detailed_stats: bool,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            growth_rate_threshold: 10.0 * 1024.0 * 1024.0,
            cleanup: CleanupIntensity::Balanced,
            monitoring_interval: Duration::from_secs(30),
            detailed_stats: false,
        }
    }
}

/// Immutable snapshot handed to the pressure callback.
#[derive(Debug, Clone)]
pub struct ResourcePressureContext {
    pub session_id: String,
    pub request_type: &'static str,
    pub current_memory: u64,
    pub baseline_memory: u64,
    /// Bytes per second since the session baseline.
    pub growth_rate: f64,
    /// Cleanup passes run for this session, including this one.
    pub cleanup_passes: u32,
    pub detected_at: u64,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    request_type: &'static str,
    baseline: u64,
    peak: u64,
    cleanup_passes: u32,
    reclaimed: u64,
    completed_at: Option<u64>,
}

/// Point-in-time view of one monitored session.
#[derive(Debug, Clone)]
pub struct ResourceSessionSnapshot {
    pub request_type: &'static str,
    pub baseline: u64,
    pub peak: u64,
    pub cleanup_passes: u32,
    pub reclaimed: u64,
    pub completed: bool,
}

/// Process-wide monitor bookkeeping: session records and weakly-held
/// disposable resources. Tests construct a private tracker for a fresh scope.
#[derive(Clone, Default)]
pub struct ResourceTracker {
    sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
    resources: Arc<Mutex<Vec<Weak<dyn TrackedResource>>>>,
    last_sweep: Arc<AtomicU64>,
}

static GLOBAL_TRACKER: OnceLock<ResourceTracker> = OnceLock::new();

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker used by default.
    pub fn global() -> Self {
        GLOBAL_TRACKER.get_or_init(Self::new).clone()
    }

    /// Hold `resource` weakly for possible aggressive disposal.
    pub fn track(&self, resource: &Arc<dyn TrackedResource>) {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::downgrade(resource));
    }

    /// Number of live session records, completed or not.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Snapshot one session record, if it is still retained.
    pub fn session_snapshot(&self, id: &str) -> Option<ResourceSessionSnapshot> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(id).map(
            |record| ResourceSessionSnapshot {
                request_type: record.request_type,
                baseline: record.baseline,
                peak: record.peak,
                cleanup_passes: record.cleanup_passes,
                reclaimed: record.reclaimed,
                completed: record.completed_at.is_some(),
            },
        )
    }

    /// Drop every session record and tracked resource. Test hook.
    pub fn reset(&self) {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
        self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
        self.last_sweep.store(0, Ordering::Release);
    }

    fn register_session(&self, id: &str, request_type: &'static str, baseline: u64) {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(
            id.to_string(),
            SessionRecord {
                request_type,
                baseline,
                peak: baseline,
                cleanup_passes: 0,
                reclaimed: 0,
                completed_at: None,
            },
        );
    }

    fn update_session(&self, id: &str, peak: u64, cleanup_passes: u32, reclaimed: u64) {
        let mut sessions =
            self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = sessions.get_mut(id) {
            record.peak = record.peak.max(peak);
            record.cleanup_passes = cleanup_passes;
            record.reclaimed += reclaimed;
        }
    }

    fn complete_session(&self, id: &str, now: u64) {
        let mut sessions =
            self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = sessions.get_mut(id) {
            record.completed_at = Some(now);
        }
    }

    /// Evict stale completed sessions and dead resource references. Runs at
    /// most once per `interval`; extra calls are no-ops.
    pub fn sweep(&self, now: u64, interval: Duration) {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return;
        }
        self.last_sweep.store(now, Ordering::Release);

        let horizon = now.saturating_sub(SESSION_RETENTION.as_millis() as u64);
        let mut sessions =
            self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sessions.len();
        sessions.retain(|_, record| match record.completed_at {
            Some(done) => done >= horizon,
            None => true,
        });
        let evicted = before - sessions.len();
        drop(sessions);

        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|weak| weak.strong_count() > 0);

        if evicted > 0 {
            tracing::debug!(evicted, "swept completed resource sessions");
        }
    }

    /// Dispose every tracked resource still alive. Returns how many were
    /// disposed.
    fn dispose_tracked(&self) -> usize {
        let resources: Vec<Arc<dyn TrackedResource>> = {
            let mut slots =
                self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let alive = slots.iter().filter_map(Weak::upgrade).collect();
            slots.clear();
            alive
        };
        for resource in &resources {
            resource.dispose();
        }
        resources.len()
    }
}

type PressureCallback =
    dyn Fn(&ResourcePressureContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync;

/// Resource-monitoring behavior for streaming dispatch.
///
/// Never swallows handler failures; a failing pressure callback is logged and
/// ignored.
pub struct ResourceMonitorBehavior {
    options: ResourceOptions,
    sampler: Arc<dyn MemorySampler>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    tracker: ResourceTracker,
    on_pressure: Option<Arc<PressureCallback>>,
}

impl ResourceMonitorBehavior {
    pub fn new(options: ResourceOptions) -> Self {
        Self {
            options,
            sampler: Arc::new(SysinfoSampler::new()),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            tracker: ResourceTracker::global(),
            on_pressure: None,
        }
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

    /// Use a private tracker instead of the process-wide one.
    pub fn with_tracker(mut self, tracker: ResourceTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Invoked with a pressure context snapshot on every cleanup pass.
    pub fn on_pressure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ResourcePressureContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.on_pressure = Some(Arc::new(callback));
        self
    }
}

struct MonitorShared {
    options: ResourceOptions,
    sampler: Arc<dyn MemorySampler>,
    clock: Arc<dyn Clock>,
    tracker: ResourceTracker,
    on_pressure: Option<Arc<PressureCallback>>,
    session_id: String,
    request_type: &'static str,
    baseline: u64,
    started_at: u64,
    cleanup_passes: AtomicU32,
    items_seen: AtomicU64,
}

impl MonitorShared {
    fn growth_rate(&self, current: u64, now: u64) -> f64 {
        let elapsed_ms = now.saturating_sub(self.started_at);
        if elapsed_ms == 0 {
            return 0.0;
        }
        let grown = current.saturating_sub(self.baseline) as f64;
        grown * 1000.0 / elapsed_ms as f64
    }

    /// Absolute-threshold check only; cheap enough for the per-item path.
    fn fast_check(&self) {
        let current = self.sampler.current_rss();
        if current >= self.options.max_memory_bytes {
            self.run_cleanup(current, self.clock.now_millis());
        }
    }

    /// Full check: absolute and growth-rate thresholds.
    fn interval_check(&self) {
        let now = self.clock.now_millis();
        let current = self.sampler.current_rss();
        let growth = self.growth_rate(current, now);
        if current >= self.options.max_memory_bytes
            || growth >= self.options.growth_rate_threshold
        {
            self.run_cleanup(current, now);
        }
        self.tracker.sweep(now, self.options.monitoring_interval);
    }

    fn run_cleanup(&self, current: u64, now: u64) {
        let passes = self.cleanup_passes.fetch_add(1, Ordering::AcqRel) + 1;
        let growth = self.growth_rate(current, now);

        tracing::warn!(
            session = %self.session_id,
            request_type = self.request_type,
            current_bytes = current,
            baseline_bytes = self.baseline,
            growth_bytes_per_sec = growth,
            intensity = ?self.options.cleanup,
            "memory pressure detected; running cleanup"
        );

        let mut disposed = 0usize;
        match self.options.cleanup {
            CleanupIntensity::Conservative => {}
            CleanupIntensity::Balanced => {
                tracing::debug!(session = %self.session_id, "compaction requested for next pass");
            }
            CleanupIntensity::Aggressive => {
                disposed = self.tracker.dispose_tracked();
            }
        }

        let after = self.sampler.current_rss();
        let reclaimed = current.saturating_sub(after);
        self.tracker.update_session(&self.session_id, current, passes, reclaimed);
        tracing::info!(
            session = %self.session_id,
            reclaimed_bytes = reclaimed,
            disposed_resources = disposed,
            pass = passes,
            "resource cleanup finished"
        );

        if let Some(callback) = &self.on_pressure {
            let mut properties = HashMap::new();
            if self.options.detailed_stats {
                properties.insert(
                    "items_seen".to_string(),
                    self.items_seen.load(Ordering::Acquire).to_string(),
                );
                properties.insert("reclaimed_bytes".to_string(), reclaimed.to_string());
                properties.insert("disposed_resources".to_string(), disposed.to_string());
            }
            let context = ResourcePressureContext {
                session_id: self.session_id.clone(),
                request_type: self.request_type,
                current_memory: current,
                baseline_memory: self.baseline,
                growth_rate: growth,
                cleanup_passes: passes,
                detected_at: now,
                properties,
            };
            if let Err(err) = callback(&context) {
                tracing::warn!(
                    session = %self.session_id,
                    error = %err,
                    "pressure callback failed; continuing"
                );
            }
        }
    }
}

impl<R> StreamBehavior<R> for ResourceMonitorBehavior
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
        let baseline = self.sampler.current_rss();
        let shared = Arc::new(MonitorShared {
            options: self.options.clone(),
            sampler: Arc::clone(&self.sampler),
            clock: Arc::clone(&self.clock),
            tracker: self.tracker.clone(),
            on_pressure: self.on_pressure.clone(),
            session_id: new_session_id(),
            request_type: std::any::type_name::<R>(),
            baseline,
            started_at: now,
            cleanup_passes: AtomicU32::new(0),
            items_seen: AtomicU64::new(0),
        });
        self.tracker.register_session(&shared.session_id, shared.request_type, baseline);

        let (tx, rx) = bridge::unbounded::<R::Item, PipelineError<R::Error>>();
        let done = tokio_util::sync::CancellationToken::new();

        // Background interval checks, bounded by the session lifetime.
        {
            let shared = Arc::clone(&shared);
            let sleeper = Arc::clone(&self.sleeper);
            let done = done.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.cancelled() => return,
                        _ = cancel.cancelled() => return,
                        _ = sleeper.sleep(shared.options.monitoring_interval) => {
                            shared.interval_check();
                        }
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        let producer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut upstream = next.run(request, cancel.clone());
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = upstream.next() => item,
                };
                match item {
                    None => {
                        producer_shared.tracker.complete_session(
                            &producer_shared.session_id,
                            producer_shared.clock.now_millis(),
                        );
                        done.cancel();
                        tx.close();
                        return;
                    }
                    Some(Ok(value)) => {
                        let seen =
                            producer_shared.items_seen.fetch_add(1, Ordering::AcqRel) + 1;
                        if seen % FAST_CHECK_EVERY == 0 {
                            producer_shared.fast_check();
                        }
                        if tx.send(value).await.is_err() {
                            producer_shared.tracker.complete_session(
                                &producer_shared.session_id,
                                producer_shared.clock.now_millis(),
                            );
                            done.cancel();
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        producer_shared.tracker.complete_session(
                            &producer_shared.session_id,
                            producer_shared.clock.now_millis(),
                        );
                        done.cancel();
                        tx.fault(err);
                        return;
                    }
                }
            }
        });

        Box::pin(rx.into_stream())
    }
}

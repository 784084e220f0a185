//! Per-dispatch stream session bookkeeping.
//!
//! A session is created for each streaming dispatch and owned by the behavior
//! that created it. Counters follow the single-writer rule: the producer task
//! writes `produced`/`dropped`/`sampled`, the consumer loop writes `consumed`,
//! and either side may read the other's counters without locking.

use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Random 8-byte session id, hex-encoded.
pub fn new_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Counters and timestamps for one streaming dispatch.
#[derive(Debug)]
pub struct StreamSession {
    id: String,
    request_type: &'static str,
    started_at: u64,

    produced: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    sampled_out: AtomicU64,

    throttle_delay_ms: AtomicU64,
    block_time_ms: AtomicU64,
    active_time_ms: AtomicU64,

    last_produced_at: AtomicU64,
    last_consumed_at: AtomicU64,
    peak_memory: AtomicU64,

    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl StreamSession {
    pub fn new(request_type: &'static str, clock: &dyn Clock) -> Self {
        let now = clock.now_millis();
        Self {
            id: new_session_id(),
            request_type,
            started_at: now,
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            throttle_delay_ms: AtomicU64::new(0),
            block_time_ms: AtomicU64::new(0),
            active_time_ms: AtomicU64::new(0),
            last_produced_at: AtomicU64::new(now),
            last_consumed_at: AtomicU64::new(now),
            peak_memory: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn note_produced(&self, now: u64) -> u64 {
        self.last_produced_at.store(now, Ordering::Release);
        self.produced.fetch_add(1, Ordering::Release) + 1
    }

    pub fn note_consumed(&self, now: u64) -> u64 {
        self.last_consumed_at.store(now, Ordering::Release);
        self.consumed.fetch_add(1, Ordering::Release) + 1
    }

    pub fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Release);
    }

    pub fn note_sampled_out(&self) {
        self.sampled_out.fetch_add(1, Ordering::Release);
    }

    pub fn add_throttle_delay(&self, millis: u64) {
        self.throttle_delay_ms.fetch_add(millis, Ordering::Release);
    }

    pub fn add_block_time(&self, millis: u64) {
        self.block_time_ms.fetch_add(millis, Ordering::Release);
    }

    pub fn add_active_time(&self, millis: u64) {
        self.active_time_ms.fetch_add(millis, Ordering::Release);
    }

    pub fn note_memory(&self, bytes: u64) {
        self.peak_memory.fetch_max(bytes, Ordering::Release);
    }

    pub fn push_error(&self, message: String) {
        self.errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(message);
    }

    pub fn push_warning(&self, message: String) {
        self.warnings.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(message);
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Acquire)
    }

    pub fn throttle_delay_ms(&self) -> u64 {
        self.throttle_delay_ms.load(Ordering::Acquire)
    }

    pub fn block_time_ms(&self) -> u64 {
        self.block_time_ms.load(Ordering::Acquire)
    }

    pub fn active_time_ms(&self) -> u64 {
        self.active_time_ms.load(Ordering::Acquire)
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory.load(Ordering::Acquire)
    }

    pub fn last_produced_at(&self) -> u64 {
        self.last_produced_at.load(Ordering::Acquire)
    }

    pub fn last_consumed_at(&self) -> u64 {
        self.last_consumed_at.load(Ordering::Acquire)
    }

    /// Estimated channel occupancy: items written but not yet read.
    pub fn estimated_buffer(&self) -> u64 {
        self.produced().saturating_sub(self.consumed())
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    #[test]
    fn session_ids_are_16_hex_chars_and_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn consumed_never_exceeds_produced_under_correct_use() {
        let clock = MonotonicClock::default();
        let session = StreamSession::new("test::Req", &clock);

        for _ in 0..5 {
            session.note_produced(clock.now_millis());
        }
        for _ in 0..3 {
            session.note_consumed(clock.now_millis());
        }

        assert_eq!(session.produced(), 5);
        assert_eq!(session.consumed(), 3);
        assert_eq!(session.estimated_buffer(), 2);
        assert!(session.consumed() <= session.produced());
    }

    #[test]
    fn peak_memory_is_monotonic() {
        let clock = MonotonicClock::default();
        let session = StreamSession::new("test::Req", &clock);
        session.note_memory(100);
        session.note_memory(50);
        session.note_memory(200);
        assert_eq!(session.peak_memory(), 200);
    }
}

//! Registry of per-request-type circuit breaker state.
//!
//! Breaker state is process-wide: every dispatch of a given request type
//! shares one [`BreakerState`], whichever pipeline it came through. Tests
//! construct a private registry for a fresh state scope, or call
//! [`CircuitBreakerRegistry::reset_all`] on the global one.

use crate::circuit_breaker::{BreakerState, CircuitState};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

struct Entry {
    name: &'static str,
    state: Arc<BreakerState>,
}

/// Process map of `request type → breaker state`.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<TypeId, Entry>>>,
}

static GLOBAL: OnceLock<CircuitBreakerRegistry> = OnceLock::new();

impl CircuitBreakerRegistry {
    /// A fresh, private registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by default.
    pub fn global() -> Self {
        GLOBAL.get_or_init(Self::new).clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Entry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Breaker state for request type `R`, created on first use.
    pub fn state_for<R: 'static>(&self) -> Arc<BreakerState> {
        let mut map = self.lock();
        Arc::clone(
            &map.entry(TypeId::of::<R>())
                .or_insert_with(|| Entry {
                    name: std::any::type_name::<R>(),
                    state: Arc::new(BreakerState::new()),
                })
                .state,
        )
    }

    /// Reset every breaker to Closed. Test hook.
    pub fn reset_all(&self) {
        for entry in self.lock().values() {
            entry.state.reset();
        }
    }

    /// Current state of every registered breaker, sorted by type name.
    pub fn snapshot(&self) -> Vec<(&'static str, CircuitState)> {
        let map = self.lock();
        let mut entries: Vec<(&'static str, CircuitState)> =
            map.values().map(|e| (e.name, e.state.current_state())).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReqA;
    struct ReqB;

    #[test]
    fn same_type_shares_state() {
        let registry = CircuitBreakerRegistry::new();
        let a1 = registry.state_for::<ReqA>();
        let a2 = registry.state_for::<ReqA>();
        assert!(Arc::ptr_eq(&a1, &a2));
    }

    #[test]
    fn distinct_types_get_distinct_state() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.state_for::<ReqA>();
        let b = registry.state_for::<ReqB>();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn snapshot_lists_registered_types() {
        let registry = CircuitBreakerRegistry::new();
        let _ = registry.state_for::<ReqA>();
        let _ = registry.state_for::<ReqB>();
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().all(|(_, state)| *state == CircuitState::Closed));
    }

    #[test]
    fn reset_all_closes_everything() {
        use crate::circuit_breaker::CircuitBreakerConfig;
        use std::time::Duration;

        let registry = CircuitBreakerRegistry::new();
        let state = registry.state_for::<ReqA>();
        let config = CircuitBreakerConfig {
            minimum_throughput: 1,
            failure_threshold: 1.0,
            ..CircuitBreakerConfig::default()
        };
        state.record(&config, 0, false, 0, Duration::ZERO);
        assert_eq!(state.current_state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(state.current_state(), CircuitState::Closed);
    }
}

//! Production-ready configuration presets.
//!
//! Pre-tuned options for the streaming behaviors, so common deployments do
//! not hand-pick thresholds. Each submodule mirrors one behavior's options
//! type; pick a preset and adjust fields as needed.
//!
//! ```rust
//! use midstream::presets;
//! use midstream::{BackpressureBehavior, StreamRetryBehavior};
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("boom")]
//! # struct MyError;
//! let retry: StreamRetryBehavior<MyError> =
//!     StreamRetryBehavior::new(presets::retry::conservative());
//! let valve = BackpressureBehavior::new(presets::backpressure::no_data_loss());
//! ```

/// Retry presets for the streaming retry driver.
pub mod retry {
    use crate::backoff::RetryBackoff;
    use crate::retry::StreamRetryOptions;
    use std::time::Duration;

    /// 2 retries, fixed 500 ms delay, 10 s budget.
    pub fn conservative<E>() -> StreamRetryOptions<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamRetryOptions::new()
            .max_retry_attempts(2)
            .backoff(RetryBackoff::fixed(Duration::from_millis(500)))
            .max_total_retry_time(Duration::from_secs(10))
    }

    /// 5 retries, exponential-with-jitter from 200 ms, 2 min budget.
    pub fn aggressive<E>() -> StreamRetryOptions<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamRetryOptions::new()
            .max_retry_attempts(5)
            .backoff(RetryBackoff::exponential_jitter(Duration::from_millis(200)))
            .max_total_retry_time(Duration::from_secs(120))
    }

    /// 3 retries, exponential from 1 s, 30 s budget, database failure
    /// classification.
    ///
    /// Rust has no exception hierarchy to inspect, so transience is
    /// classified by error-message heuristics (timeouts, lost connections,
    /// deadlocks).
    pub fn database<E>() -> StreamRetryOptions<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamRetryOptions::new()
            .max_retry_attempts(3)
            .backoff(RetryBackoff::exponential(Duration::from_secs(1)))
            .max_total_retry_time(Duration::from_secs(30))
            .should_retry(|e: &E| {
                let message = e.to_string().to_lowercase();
                ["timeout", "timed out", "connection", "deadlock", "unavailable", "try again"]
                    .iter()
                    .any(|marker| message.contains(marker))
            })
    }

    /// 4 retries, exponential-with-jitter from 750 ms, 45 s budget, HTTP
    /// failure classification (timeouts, connection failures, 5xx, 429).
    pub fn http_api<E>() -> StreamRetryOptions<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamRetryOptions::new()
            .max_retry_attempts(4)
            .backoff(RetryBackoff::exponential_jitter(Duration::from_millis(750)))
            .max_total_retry_time(Duration::from_secs(45))
            .should_retry(|e: &E| {
                let message = e.to_string().to_lowercase();
                [
                    "timeout",
                    "timed out",
                    "connection",
                    "reset",
                    "500",
                    "502",
                    "503",
                    "504",
                    "429",
                ]
                .iter()
                .any(|marker| message.contains(marker))
            })
    }
}

/// Circuit-breaker presets.
///
/// The `database` and `external_api` deployments conventionally pair their
/// config with the matching `*_counts_failure` predicate via
/// [`CircuitBreakerBehavior::should_count_failure`](crate::CircuitBreakerBehavior::should_count_failure).
pub mod circuit_breaker {
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::time::Duration;

    /// 30% over min-throughput 3, 30 s window, 15 s break, 2 trials.
    pub fn sensitive() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 30.0,
            minimum_throughput: 3,
            sampling_window: Duration::from_secs(30),
            break_duration: Duration::from_secs(15),
            trial_requests: 2,
            partial_success_threshold: None,
        }
    }

    /// 50% over min-throughput 5, 60 s window, 30 s break, 3 trials.
    pub fn balanced() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 50.0,
            minimum_throughput: 5,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            trial_requests: 3,
            partial_success_threshold: None,
        }
    }

    /// 70% over min-throughput 10, 2 min window, 1 min break, 5 trials.
    pub fn resilient() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 70.0,
            minimum_throughput: 10,
            sampling_window: Duration::from_secs(120),
            break_duration: Duration::from_secs(60),
            trial_requests: 5,
            partial_success_threshold: None,
        }
    }

    /// 40% over min-throughput 5, 1 min window, 45 s break, 2 trials.
    pub fn database() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 40.0,
            minimum_throughput: 5,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(45),
            trial_requests: 2,
            partial_success_threshold: None,
        }
    }

    /// 60% over min-throughput 8, 3 min window, 60 s break, 3 trials.
    pub fn external_api() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 60.0,
            minimum_throughput: 8,
            sampling_window: Duration::from_secs(180),
            break_duration: Duration::from_secs(60),
            trial_requests: 3,
            partial_success_threshold: None,
        }
    }

    /// Exclude business failures (validation, not-found, constraint
    /// violations) from database breaker statistics. Message heuristic.
    pub fn database_counts_failure<E: std::error::Error>(error: &E) -> bool {
        let message = error.to_string().to_lowercase();
        !["validation", "not found", "constraint", "duplicate"]
            .iter()
            .any(|marker| message.contains(marker))
    }

    /// Exclude client errors (4xx) from external-API breaker statistics.
    /// Message heuristic over common status codes.
    pub fn external_api_counts_failure<E: std::error::Error>(error: &E) -> bool {
        let message = error.to_string().to_lowercase();
        !["400", "401", "403", "404", "409", "422", "client error", "bad request"]
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// Backpressure presets.
pub mod backpressure {
    use crate::backpressure::{BackpressureOptions, BackpressureStrategy};

    /// Throttle with a 50k buffer engaging at 90% occupancy: keeps every
    /// item at the cost of latency.
    pub fn no_data_loss() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Throttle)
            .max_buffer_size(50_000)
            .watermarks(0.9, 0.5)
    }

    /// Drop with a 10k buffer engaging at 70%: favors freshness and speed
    /// over completeness.
    pub fn high_throughput() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Drop)
            .max_buffer_size(10_000)
            .watermarks(0.7, 0.5)
    }

    /// Sample every 2nd item over a 1k buffer: halves volume under pressure.
    pub fn memory_constrained() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Sample)
            .max_buffer_size(1_000)
            .sample_rate(2)
    }

    /// Drop with a 5k buffer, preferring newer items.
    pub fn real_time() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Drop)
            .max_buffer_size(5_000)
            .prefer_newer_items(true)
    }

    /// Sample every 10th item over a 25k buffer, for high-volume analytics
    /// feeds where a representative subset suffices.
    pub fn analytics() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Sample)
            .max_buffer_size(25_000)
            .sample_rate(10)
    }

    /// Buffer with 10k capacity, 0.8/0.5 watermarks.
    pub fn balanced() -> BackpressureOptions {
        BackpressureOptions::default()
            .strategy(BackpressureStrategy::Buffer)
            .max_buffer_size(10_000)
            .watermarks(0.8, 0.5)
    }
}

/// Health-reporter presets.
pub mod health {
    use crate::health::HealthOptions;
    use std::time::Duration;

    /// 5 s checks, 10 s stall, 1000 items/s floor, 1% error ceiling.
    pub fn high_performance() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(10),
            minimum_throughput: 1000.0,
            maximum_error_rate: 0.01,
            ..HealthOptions::default()
        }
    }

    /// 30 s checks, 120 s stall, 50 items/s floor, 5% error ceiling.
    pub fn data_processing() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(120),
            minimum_throughput: 50.0,
            maximum_error_rate: 0.05,
            ..HealthOptions::default()
        }
    }

    /// 60 s checks, 300 s stall, 10 items/s floor, 10% error ceiling.
    pub fn long_running() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(300),
            minimum_throughput: 10.0,
            maximum_error_rate: 0.10,
            ..HealthOptions::default()
        }
    }

    /// 2 s checks, 5 s stall, 100 items/s floor, 0.1% error ceiling.
    pub fn real_time() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(2),
            stall_threshold: Duration::from_secs(5),
            minimum_throughput: 100.0,
            maximum_error_rate: 0.001,
            ..HealthOptions::default()
        }
    }

    /// 10 s checks, 30 s stall, 1 item/s floor, 20% error ceiling.
    pub fn development() -> HealthOptions {
        HealthOptions {
            check_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(30),
            minimum_throughput: 1.0,
            maximum_error_rate: 0.20,
            ..HealthOptions::default()
        }
    }
}

/// Resource-monitor presets.
pub mod resource {
    use crate::resource::{CleanupIntensity, ResourceOptions};
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    /// 256 MB ceiling, 5 MB/s growth, aggressive cleanup, 15 s checks.
    pub fn memory_constrained() -> ResourceOptions {
        ResourceOptions {
            max_memory_bytes: 256 * MIB,
            growth_rate_threshold: 5.0 * MIB as f64,
            cleanup: CleanupIntensity::Aggressive,
            monitoring_interval: Duration::from_secs(15),
            detailed_stats: false,
        }
    }

    /// 1 GB ceiling, 50 MB/s growth, conservative cleanup, 60 s checks.
    pub fn high_performance() -> ResourceOptions {
        ResourceOptions {
            max_memory_bytes: 1024 * MIB,
            growth_rate_threshold: 50.0 * MIB as f64,
            cleanup: CleanupIntensity::Conservative,
            monitoring_interval: Duration::from_secs(60),
            detailed_stats: false,
        }
    }

    /// 512 MB ceiling, 10 MB/s growth, balanced cleanup, 30 s checks.
    pub fn balanced() -> ResourceOptions {
        ResourceOptions {
            max_memory_bytes: 512 * MIB,
            growth_rate_threshold: 10.0 * MIB as f64,
            cleanup: CleanupIntensity::Balanced,
            monitoring_interval: Duration::from_secs(30),
            detailed_stats: false,
        }
    }

    /// 2 GB ceiling, 100 MB/s growth, conservative cleanup, 10 s checks,
    /// detailed pressure-context properties.
    pub fn development() -> ResourceOptions {
        ResourceOptions {
            max_memory_bytes: 2048 * MIB,
            growth_rate_threshold: 100.0 * MIB as f64,
            cleanup: CleanupIntensity::Conservative,
            monitoring_interval: Duration::from_secs(10),
            detailed_stats: true,
        }
    }
}

//! Convenient re-exports for common Midstream types.
pub use crate::{
    backoff::RetryBackoff,
    backpressure::{
        BackpressureBehavior, BackpressureOptions, BackpressureReport, BackpressureStrategy,
    },
    circuit_breaker::{CircuitBreakerBehavior, CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    clock::{Clock, MonotonicClock},
    dispatcher::Dispatcher,
    error::PipelineError,
    handler::{HandlerStream, ItemStream, Next, StreamBehavior, StreamHandler, StreamRequest},
    health::{
        HealthOptions, HealthReporterBehavior, HealthSink, HealthStatus, HealthWarning,
        LogHealthSink, MemoryHealthSink, StreamHealthReport,
    },
    pipeline::{StreamPipeline, StreamPipelineBuilder},
    presets,
    resource::{
        CleanupIntensity, MemorySampler, ResourceMonitorBehavior, ResourceOptions,
        ResourcePressureContext, ResourceTracker, TrackedResource,
    },
    retry::{StreamRetryBehavior, StreamRetryOptions},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
};

#![forbid(unsafe_code)]

//! # Midstream
//!
//! Resilient streaming dispatch for async Rust: route a request to its
//! streaming handler through a composable chain of flow-control behaviors.
//!
//! ## Features
//!
//! - **Stream retry** with restart semantics, delay strategies and a total
//!   time budget
//! - **Circuit breakers** keyed per request type, with rolling-window
//!   statistics and half-open trial accounting
//! - **Backpressure valves** with five strategies (buffer, drop, throttle,
//!   sample, block) and high/low-watermark hysteresis
//! - **Resource monitoring** with threshold-driven cleanup passes
//! - **Health reporting** with stall, throughput and error-rate signals
//! - **Pipeline composition** at configuration time via closures, no
//!   per-dispatch reflection
//!
//! ## Quick Start
//!
//! ```rust
//! use futures::StreamExt;
//! use midstream::{
//!     presets, BackpressureBehavior, CircuitBreakerBehavior, CircuitBreakerRegistry,
//!     HandlerStream, StreamPipeline, StreamRequest, StreamRetryBehavior,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone)]
//! struct TailLogs {
//!     lines: u32,
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("log source failed")]
//! struct TailError;
//!
//! impl StreamRequest for TailLogs {
//!     type Item = String;
//!     type Error = TailError;
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // Behaviors run in registration order: the valve sees everything the
//!     // retry driver re-delivers, the breaker wraps the handler directly.
//!     let pipeline = StreamPipeline::builder()
//!         .behavior(BackpressureBehavior::new(presets::backpressure::balanced()))
//!         .behavior(StreamRetryBehavior::new(presets::retry::conservative()))
//!         .behavior(
//!             CircuitBreakerBehavior::new(presets::circuit_breaker::balanced())
//!                 .with_registry(CircuitBreakerRegistry::new()),
//!         )
//!         .build(|req: TailLogs, _cancel: CancellationToken| -> HandlerStream<String, TailError> {
//!             Box::pin(futures::stream::iter(
//!                 (1..=req.lines).map(|n| Ok(format!("line {n}"))),
//!             ))
//!         });
//!
//!     let mut stream = pipeline.dispatch(TailLogs { lines: 3 }, CancellationToken::new());
//!     while let Some(item) = stream.next().await {
//!         println!("{}", item.expect("stream item"));
//!     }
//! }
//! ```

mod backoff;
mod backpressure;
pub mod bridge;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod dispatcher;
mod error;
mod handler;
mod health;
mod pipeline;
pub mod presets;
mod resource;
mod retry;
mod session;
mod sleeper;

// Re-exports
pub use backoff::RetryBackoff;
pub use backpressure::{
    BackpressureBehavior, BackpressureOptions, BackpressureReport, BackpressureStrategy,
    PressureSnapshot,
};
pub use circuit_breaker::{
    Admission, BreakerSnapshot, BreakerState, CircuitBreakerBehavior, CircuitBreakerConfig,
    CircuitState,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, MonotonicClock};
pub use dispatcher::Dispatcher;
pub use error::PipelineError;
pub use handler::{HandlerStream, ItemStream, Next, StreamBehavior, StreamHandler, StreamRequest};
pub use health::{
    HealthOptions, HealthReporterBehavior, HealthSink, HealthStatus, HealthWarning, LogHealthSink,
    MemoryHealthSink, StreamHealthReport,
};
pub use pipeline::{StreamPipeline, StreamPipelineBuilder};
pub use resource::{
    CleanupIntensity, MemorySampler, ResourceMonitorBehavior, ResourceOptions,
    ResourcePressureContext, ResourceTracker, SysinfoSampler, TrackedResource,
};
pub use retry::{StreamRetryBehavior, StreamRetryOptions};
pub use session::StreamSession;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;

//! Core contracts: streaming requests, handlers, behaviors and the `next` link.
//!
//! A [`StreamRequest`] names the item and error types a dispatch produces. A
//! [`StreamHandler`] services the request by returning a fresh, single-use
//! stream on every call; re-invoking it restarts from the first item, which
//! is what the retry driver relies on. [`StreamBehavior`]s wrap a handler in
//! registration order, each receiving the remainder of the chain as a
//! [`Next`].

use crate::error::PipelineError;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler produces: a lazy sequence of items in the handler's own
/// error space.
pub type HandlerStream<T, E> = BoxStream<'static, Result<T, E>>;

/// What flows through the pipeline: a lazy sequence in pipeline error space.
pub type ItemStream<T, E> = BoxStream<'static, Result<T, PipelineError<E>>>;

/// A request that is dispatched to a streaming handler.
///
/// The implementing type is the request fingerprint: per-type resilience
/// state (circuit breakers, session bookkeeping) is keyed by it. `Clone` is
/// required because the retry driver re-dispatches the request on restart.
pub trait StreamRequest: Clone + Send + Sync + 'static {
    /// Item type the stream yields.
    type Item: Send + 'static;
    /// Handler failure type.
    type Error: std::error::Error + Send + Sync + 'static;
}

/// The leaf of the chain: the code that actually services a request.
///
/// Every call to [`run`](StreamHandler::run) MUST return an independent
/// sequence restarted from its first item. The handler MUST observe the
/// cancellation token between items and wind down promptly when it fires.
pub trait StreamHandler<R: StreamRequest>: Send + Sync + 'static {
    fn run(&self, request: R, cancel: CancellationToken) -> HandlerStream<R::Item, R::Error>;
}

impl<R, F> StreamHandler<R> for F
where
    R: StreamRequest,
    F: Fn(R, CancellationToken) -> HandlerStream<R::Item, R::Error> + Send + Sync + 'static,
{
    fn run(&self, request: R, cancel: CancellationToken) -> HandlerStream<R::Item, R::Error> {
        (self)(request, cancel)
    }
}

/// The remainder of a behavior chain, invocable any number of times.
///
/// Each invocation re-runs everything downstream of the calling behavior,
/// producing a fresh stream. Behaviors MUST NOT yield an item after their
/// downstream has been cancelled.
pub struct Next<R: StreamRequest> {
    #[allow(clippy::type_complexity)]
    inner: Arc<
        dyn Fn(R, CancellationToken) -> ItemStream<R::Item, R::Error> + Send + Sync + 'static,
    >,
}

impl<R: StreamRequest> Clone for Next<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R: StreamRequest> Next<R> {
    /// Wrap a raw chain function.
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(R, CancellationToken) -> ItemStream<R::Item, R::Error> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Innermost link: the handler itself, lifted into pipeline error space.
    pub(crate) fn from_handler(handler: Arc<dyn StreamHandler<R>>) -> Self {
        Self::new(move |request, cancel| {
            use futures::StreamExt;
            Box::pin(handler.run(request, cancel).map(|item| item.map_err(PipelineError::Inner)))
        })
    }

    /// Execute the remainder of the chain.
    pub fn run(&self, request: R, cancel: CancellationToken) -> ItemStream<R::Item, R::Error> {
        (self.inner)(request, cancel)
    }
}

/// A reusable wrapper that observes or modifies the execution of a streaming
/// dispatch, composable with other behaviors.
///
/// Behaviors never swallow failures: anything they do not explicitly classify
/// and handle propagates outward through the stream.
pub trait StreamBehavior<R: StreamRequest>: Send + Sync + 'static {
    fn handle(
        &self,
        request: R,
        next: Next<R>,
        cancel: CancellationToken,
    ) -> ItemStream<R::Item, R::Error>;
}

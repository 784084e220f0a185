//! Pipeline composer: orders behaviors around a handler.
//!
//! The chain is built once, at configuration time, out of closures; dispatch
//! involves no reflection or registry lookups. The first behavior registered
//! runs outermost; on the return path behaviors unwind in reverse. The
//! composer never touches data items.

use crate::error::PipelineError;
use crate::handler::{ItemStream, Next, StreamBehavior, StreamHandler, StreamRequest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Collects behaviors in execution order, then seals them around a handler.
pub struct StreamPipelineBuilder<R: StreamRequest> {
    behaviors: Vec<Arc<dyn StreamBehavior<R>>>,
}

impl<R: StreamRequest> Default for StreamPipelineBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: StreamRequest> StreamPipelineBuilder<R> {
    pub fn new() -> Self {
        Self { behaviors: Vec::new() }
    }

    /// Append a behavior. Registration order is execution order: the first
    /// behavior added wraps everything that follows.
    pub fn behavior<B: StreamBehavior<R>>(mut self, behavior: B) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Append an already-shared behavior.
    pub fn behavior_arc(mut self, behavior: Arc<dyn StreamBehavior<R>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Seal the chain around `handler`.
    pub fn build<H: StreamHandler<R>>(self, handler: H) -> StreamPipeline<R> {
        let mut next = Next::from_handler(Arc::new(handler) as Arc<dyn StreamHandler<R>>);
        for behavior in self.behaviors.into_iter().rev() {
            let inner = next;
            next = Next::new(move |request, cancel| {
                behavior.handle(request, inner.clone(), cancel)
            });
        }
        StreamPipeline { entry: next }
    }
}

/// A sealed behavior chain for one request type.
pub struct StreamPipeline<R: StreamRequest> {
    entry: Next<R>,
}

impl<R: StreamRequest> Clone for StreamPipeline<R> {
    fn clone(&self) -> Self {
        Self { entry: self.entry.clone() }
    }
}

impl<R: StreamRequest> StreamPipeline<R> {
    pub fn builder() -> StreamPipelineBuilder<R> {
        StreamPipelineBuilder::new()
    }

    /// Run the chain for one request.
    pub fn dispatch(&self, request: R, cancel: CancellationToken) -> ItemStream<R::Item, R::Error> {
        if cancel.is_cancelled() {
            return Box::pin(futures::stream::iter(std::iter::once(
                Err::<R::Item, PipelineError<R::Error>>(PipelineError::Cancelled),
            )));
        }
        tracing::debug!(request_type = std::any::type_name::<R>(), "dispatching stream");
        self.entry.run(request, cancel)
    }
}

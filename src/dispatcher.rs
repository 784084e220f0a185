//! Typed dispatcher: one pipeline per request type.
//!
//! Registration is explicit; there is no scanning or container wiring. A
//! dispatch for an unregistered request type yields
//! [`PipelineError::NoHandler`] through the returned stream.

use crate::error::PipelineError;
use crate::handler::{ItemStream, StreamRequest};
use crate::pipeline::StreamPipeline;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Maps request types to their sealed pipelines.
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pipeline for `R`, replacing any previous registration.
    pub fn register<R: StreamRequest>(&self, pipeline: StreamPipeline<R>) {
        self.routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(TypeId::of::<R>(), Box::new(pipeline));
    }

    /// Number of registered request types.
    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the pipeline for `R` and run it.
    pub fn stream<R: StreamRequest>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> ItemStream<R::Item, R::Error> {
        let pipeline = {
            let routes = self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            routes
                .get(&TypeId::of::<R>())
                .and_then(|any| any.downcast_ref::<StreamPipeline<R>>())
                .cloned()
        };

        match pipeline {
            Some(pipeline) => pipeline.dispatch(request, cancel),
            None => {
                tracing::warn!(
                    request_type = std::any::type_name::<R>(),
                    "no stream handler registered"
                );
                Box::pin(futures::stream::iter(std::iter::once(
                    Err::<R::Item, PipelineError<R::Error>>(PipelineError::NoHandler {
                        request_type: std::any::type_name::<R>(),
                    }),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerStream, StreamHandler};
    use futures::StreamExt;

    #[derive(Debug, Clone)]
    struct Words;

    #[derive(Debug, Clone)]
    struct Numbers(u32);

    #[derive(Debug, thiserror::Error)]
    #[error("source failed")]
    struct SourceError;

    impl StreamRequest for Words {
        type Item = &'static str;
        type Error = SourceError;
    }

    impl StreamRequest for Numbers {
        type Item = u32;
        type Error = SourceError;
    }

    fn words_handler() -> impl StreamHandler<Words> {
        |_req: Words, _cancel: CancellationToken| -> HandlerStream<&'static str, SourceError> {
            Box::pin(futures::stream::iter(["alpha", "beta"].map(Ok)))
        }
    }

    fn numbers_handler() -> impl StreamHandler<Numbers> {
        |req: Numbers, _cancel: CancellationToken| -> HandlerStream<u32, SourceError> {
            Box::pin(futures::stream::iter((0..req.0).map(Ok)))
        }
    }

    #[tokio::test]
    async fn routes_by_request_type() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(StreamPipeline::builder().build(words_handler()));
        dispatcher.register(StreamPipeline::builder().build(numbers_handler()));
        assert_eq!(dispatcher.len(), 2);

        let words: Vec<_> = dispatcher
            .stream(Words, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(words, vec!["alpha", "beta"]);

        let numbers: Vec<_> = dispatcher
            .stream(Numbers(3), CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unregistered_type_yields_no_handler() {
        let dispatcher = Dispatcher::new();
        let out: Vec<_> = dispatcher.stream(Words, CancellationToken::new()).collect().await;
        assert_eq!(out.len(), 1);
        match &out[0] {
            Err(PipelineError::NoHandler { request_type }) => {
                assert!(request_type.contains("Words"));
            }
            other => panic!("expected NoHandler, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reregistration_replaces_the_pipeline() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(StreamPipeline::builder().build(numbers_handler()));
        dispatcher.register(StreamPipeline::builder().build(
            |_req: Numbers, _cancel: CancellationToken| -> HandlerStream<u32, SourceError> {
                Box::pin(futures::stream::iter([99].map(Ok)))
            },
        ));
        assert_eq!(dispatcher.len(), 1);

        let numbers: Vec<_> = dispatcher
            .stream(Numbers(3), CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(numbers, vec![99]);
    }
}

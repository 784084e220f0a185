//! Error taxonomy for streaming dispatch

use std::time::Duration;

/// Unified error type surfaced by a stream dispatch.
///
/// Handler failures travel as [`PipelineError::Inner`]; every other variant is
/// produced by the pipeline itself. A caller observes at most one terminal
/// error per dispatch, delivered through the stream after all previously
/// yielded items.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E>
where
    E: std::error::Error + 'static,
{
    /// No stream handler is registered for the request type.
    #[error("no stream handler registered for {request_type}")]
    NoHandler {
        /// Fully-qualified name of the request type.
        request_type: &'static str,
    },

    /// The circuit breaker refused admission for this request type.
    #[error(
        "circuit open for {request_type} ({failure_rate:.1}% failures in window, retry after {retry_after:?})"
    )]
    CircuitOpen {
        /// Fully-qualified name of the request type.
        request_type: &'static str,
        /// Failure percentage over the rolling window at refusal time.
        failure_rate: f64,
        /// Remaining break duration before the next trial is admitted.
        retry_after: Duration,
    },

    /// The retry driver gave up on a failing stream.
    #[error("stream failed after {attempts} attempts ({items_produced} items delivered)")]
    StreamAborted {
        /// Total items delivered to the consumer across all attempts.
        items_produced: u64,
        /// Number of handler invocations made before giving up.
        attempts: usize,
        /// The failure from the final attempt.
        #[source]
        source: E,
    },

    /// The dispatch was cancelled before it began.
    ///
    /// Mid-stream cancellation terminates the sequence without an error item;
    /// this variant only surfaces when dispatch starts on an already-cancelled
    /// token.
    #[error("dispatch cancelled")]
    Cancelled,

    /// The handler failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> PipelineError<E>
where
    E: std::error::Error + 'static,
{
    /// Check whether the circuit breaker refused admission.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check whether no handler was registered.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, Self::NoHandler { .. })
    }

    /// Check whether the retry driver gave up.
    pub fn is_stream_aborted(&self) -> bool {
        matches!(self, Self::StreamAborted { .. })
    }

    /// Check whether the dispatch was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check whether this wraps a handler failure.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the handler failure, if any.
    ///
    /// Returns the wrapped error for `Inner` and the final-attempt cause for
    /// `StreamAborted`.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::StreamAborted { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Extract the handler failure if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Items delivered before the stream was aborted, if known.
    pub fn items_produced(&self) -> Option<u64> {
        match self {
            Self::StreamAborted { items_produced, .. } => Some(*items_produced),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn no_handler_display_names_the_type() {
        let err: PipelineError<DummyError> = PipelineError::NoHandler {
            request_type: "my_app::ReportQuery",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("ReportQuery"));
        assert!(err.is_no_handler());
    }

    #[test]
    fn circuit_open_display_includes_rate_and_delay() {
        let err: PipelineError<DummyError> = PipelineError::CircuitOpen {
            request_type: "my_app::ReportQuery",
            failure_rate: 62.5,
            retry_after: Duration::from_secs(12),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("62.5"));
        assert!(msg.contains("12"));
        assert!(err.is_circuit_open());
    }

    #[test]
    fn stream_aborted_carries_cause_as_source() {
        use std::error::Error;
        let err: PipelineError<DummyError> = PipelineError::StreamAborted {
            items_produced: 42,
            attempts: 3,
            source: DummyError("disk on fire"),
        };
        assert_eq!(err.items_produced(), Some(42));
        let src = err.source().expect("source present");
        assert_eq!(src.to_string(), "disk on fire");
    }

    #[test]
    fn inner_is_transparent() {
        let err: PipelineError<DummyError> = PipelineError::Inner(DummyError("boom"));
        assert_eq!(format!("{}", err), "boom");
        assert!(err.is_inner());
        assert_eq!(err.into_inner().unwrap().0, "boom");
    }

    #[test]
    fn as_inner_reaches_through_stream_aborted() {
        let err: PipelineError<DummyError> = PipelineError::StreamAborted {
            items_produced: 0,
            attempts: 4,
            source: DummyError("last straw"),
        };
        assert_eq!(err.as_inner().unwrap().0, "last straw");
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn predicates_cover_all_variants() {
        let cancelled: PipelineError<DummyError> = PipelineError::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_inner());
        assert!(cancelled.as_inner().is_none());
        assert!(cancelled.items_produced().is_none());
    }
}

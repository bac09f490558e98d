// src/core/errors.rs

//! Defines the primary error type for the runtime coordination core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures produced by the core.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClientError(Arc<reqwest::Error>),

    /// Raised by `wait_for` when one of the signals it is watching arrives
    /// before the wrapped operation completes.
    #[error("operation cancelled by signal {signo}")]
    Signal {
        signo: i32,
        #[source]
        context: Option<Box<CoreError>>,
    },

    /// The caller's own cancellation propagated through a `wait_for` call.
    #[error("operation cancelled")]
    Cancelled {
        #[source]
        context: Option<Box<CoreError>>,
    },

    /// A child task of a `Supervisor` failed with an exception that is not
    /// itself recoverable (analogous to a base/uncatchable exception).
    #[error("supervisor base error: {0}")]
    SupervisorBase(Box<CoreError>),

    /// One or more child tasks of a `Supervisor` failed.
    #[error("{} unhandled error(s) in a supervisor", .0.len())]
    SupervisorAggregate(Vec<CoreError>),

    /// `create_task` was called after `cancel()` had already been invoked.
    #[error("supervisor is no longer accepting new tasks")]
    SupervisorClosed,

    /// A child task panicked. Treated as a base/uncatchable error: it
    /// short-circuits aggregation the same way a non-`Exception` failure
    /// does in the source material.
    #[error("supervised task panicked: {0}")]
    ChildPanicked(String),

    /// The transport to a worker was lost while a request was outstanding,
    /// or a new request was attempted after the pool had been closed.
    #[error("pool closed")]
    PoolClosed,

    /// The Manager was used outside of its `start()..stop()` lifetime.
    #[error("pool misuse: {0}")]
    PoolMisuse(&'static str),

    /// A frame exceeded the configured maximum size, or the length prefix
    /// was otherwise malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The worker reported that it raised an exception while dispatching a
    /// call; `traceback` carries the worker's formatted stack trace.
    #[error("worker call failed: {message}")]
    WorkerCallFailed { message: String, traceback: String },

    /// The worker could not serialize the result of an otherwise-successful
    /// call; `traceback` carries the worker's formatted stack trace.
    #[error("could not serialize result in worker subprocess")]
    WorkerSerializationFailed { traceback: String },

    /// Failed to encode/decode a request or reply payload.
    #[error("serialization error: {0}")]
    Codec(String),

    /// The HA URI did not match the expected `<backend>+<store>[+<wire>]://host:port/name` grammar,
    /// or named an unsupported backend/store/wire combination.
    #[error("invalid HA URI '{uri}': {reason}")]
    InvalidHaUri { uri: String, reason: String },

    /// The HA watcher's upstream store returned a non-200 response or an
    /// unparseable cluster-state document.
    #[error("HA transport error: {0}")]
    HaTransport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

// `std::io::Error` and `reqwest::Error` are not `Clone`; wrap them in `Arc`
// so `CoreError` itself can still be cloned cheaply where needed (e.g. when
// fanning one failure out to several waiters).
impl Clone for CoreError {
    fn clone(&self) -> Self {
        match self {
            CoreError::Io(e) => CoreError::Io(Arc::clone(e)),
            CoreError::HttpClientError(e) => CoreError::HttpClientError(Arc::clone(e)),
            CoreError::Signal { signo, context } => CoreError::Signal {
                signo: *signo,
                context: context.clone(),
            },
            CoreError::Cancelled { context } => CoreError::Cancelled {
                context: context.clone(),
            },
            CoreError::SupervisorBase(e) => CoreError::SupervisorBase(e.clone()),
            CoreError::SupervisorAggregate(v) => CoreError::SupervisorAggregate(v.clone()),
            CoreError::SupervisorClosed => CoreError::SupervisorClosed,
            CoreError::ChildPanicked(s) => CoreError::ChildPanicked(s.clone()),
            CoreError::PoolClosed => CoreError::PoolClosed,
            CoreError::PoolMisuse(s) => CoreError::PoolMisuse(s),
            CoreError::InvalidFrame(s) => CoreError::InvalidFrame(s.clone()),
            CoreError::WorkerCallFailed { message, traceback } => CoreError::WorkerCallFailed {
                message: message.clone(),
                traceback: traceback.clone(),
            },
            CoreError::WorkerSerializationFailed { traceback } => {
                CoreError::WorkerSerializationFailed {
                    traceback: traceback.clone(),
                }
            }
            CoreError::Codec(s) => CoreError::Codec(s.clone()),
            CoreError::InvalidHaUri { uri, reason } => CoreError::InvalidHaUri {
                uri: uri.clone(),
                reason: reason.clone(),
            },
            CoreError::HaTransport(s) => CoreError::HaTransport(s.clone()),
            CoreError::Config(s) => CoreError::Config(s.clone()),
        }
    }
}

impl CoreError {
    /// True if this is a [`CoreError::Signal`] or [`CoreError::Cancelled`] variant,
    /// i.e. something `wait_for`'s cause-chain walk should recognize as an
    /// inner cancellation cause rather than an ordinary failure.
    pub fn is_cancellation_cause(&self) -> bool {
        matches!(self, CoreError::Signal { .. } | CoreError::Cancelled { .. })
    }

    /// The signal number carried by a `Signal` variant, if any.
    pub fn signo(&self) -> Option<i32> {
        match self {
            CoreError::Signal { signo, .. } => Some(*signo),
            _ => None,
        }
    }

    /// Returns the immediate cause of a cancellation-family variant, if any.
    pub fn cancellation_context(&self) -> Option<&CoreError> {
        match self {
            CoreError::Signal { context, .. } => context.as_deref(),
            CoreError::Cancelled { context } => context.as_deref(),
            _ => None,
        }
    }

    /// Rebuilds `self` with a new cause chained underneath it, preserving
    /// whichever variant `self` already is.
    pub fn with_context(self, context: CoreError) -> CoreError {
        match self {
            CoreError::Signal { signo, .. } => CoreError::Signal {
                signo,
                context: Some(Box::new(context)),
            },
            CoreError::Cancelled { .. } => CoreError::Cancelled {
                context: Some(Box::new(context)),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::HttpClientError(Arc::new(e))
    }
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CoreError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CoreError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::HaTransport(format!("failed to parse cluster-state document: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_rebuild_preserves_variant_and_nests_context() {
        let innermost = CoreError::Signal {
            signo: 15,
            context: None,
        };
        let middle = CoreError::Signal {
            signo: 2,
            context: None,
        }
        .with_context(innermost);
        let outer = CoreError::Signal {
            signo: 10,
            context: None,
        }
        .with_context(middle);

        assert_eq!(outer.signo(), Some(10));
        let ctx1 = outer.cancellation_context().unwrap();
        assert_eq!(ctx1.signo(), Some(2));
        let ctx2 = ctx1.cancellation_context().unwrap();
        assert_eq!(ctx2.signo(), Some(15));
        assert!(ctx2.cancellation_context().is_none());
    }

    #[test]
    fn supervisor_aggregate_len_matches_display() {
        let agg = CoreError::SupervisorAggregate(vec![CoreError::PoolClosed, CoreError::PoolClosed]);
        assert_eq!(format!("{agg}"), "2 unhandled error(s) in a supervisor");
    }
}

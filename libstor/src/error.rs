//! Storage-orchestration error types.
//!
//! All errors in the `libstor` crate are represented by the [`StorError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can be recorded on
//! tasks and shipped to whatever transport consumes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for storage-orchestration operations.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum StorError {
    /// A storage driver returned an error.
    #[error("driver error: {0}")]
    Driver(String),

    /// An operation that inspects attachments was invoked without an
    /// instance identity bound to the context.
    #[error("missing instance ID for service {0}")]
    MissingInstanceId(String),

    /// The requested resource does not exist.
    #[error("resource {0} not found")]
    NotFound(String),

    /// A task result failed its validator.
    #[error("result validation failed: {0}")]
    Validation(String),

    /// A task's work function panicked; the panic was caught at the
    /// scheduler boundary and converted into this error.
    #[error("task panicked: {0}")]
    TaskPanic(String),

    /// A timed wait on a set of tasks elapsed before all of them reached a
    /// terminal state.
    #[error("timed out after {0:?} waiting for task completion")]
    WaitTimeout(Duration),

    /// A task result could not be interpreted as the expected resource
    /// shape (e.g. a per-service result that is not a volume map).
    #[error("unexpected result shape: {0}")]
    ResultShape(String),

    /// One or more operations in a batch failed; partial results are
    /// preserved inside the wrapped [`BatchError`].
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorError {
    /// Create a [`StorError::Driver`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn driver<E: std::fmt::Display>(e: E) -> Self {
        Self::Driver(e.to_string())
    }

    /// Create a [`StorError::Validation`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    /// Create a [`StorError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Composite failure produced when a batch of per-service tasks partially
/// fails.
///
/// The `completed` field holds whatever partial results had already been
/// merged when the failure was recorded, serialized as JSON, so callers can
/// report "3 of 5 backends succeeded" instead of discarding everything. The
/// surfaced `source` is the error of the first failing service in
/// lexicographic name order; other failures, if any, are not retained.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("batch processing error: {source}")]
pub struct BatchError {
    /// Partial results collected before (and alongside) the failure.
    pub completed: serde_json::Value,
    /// The failure being surfaced for the batch.
    pub source: Box<StorError>,
}

impl BatchError {
    /// Wrap `source` together with the partial results collected so far.
    pub fn new<T: Serialize>(completed: &T, source: StorError) -> Self {
        Self {
            completed: serde_json::to_value(completed).unwrap_or(serde_json::Value::Null),
            source: Box::new(source),
        }
    }
}

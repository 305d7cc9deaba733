//! Error types for the pipeline and its store collaborator.
//!
//! `ClientError` is defined here rather than in `evalpipe-client` so the
//! pipeline can classify a name conflict without string matching. Both
//! enums are `Clone`: a failure pulled from a forked source is cached and
//! handed to every fork that reaches the same position.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`Client`](crate::traits::Client) implementation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// A resource with the same unique name already exists.
    #[error("{0} already exists")]
    Conflict(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store could not be reached or failed internally.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Returns `true` if the error reports a unique-name conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

/// Errors that abort an experiment pipeline.
///
/// Row-local failures (a target or evaluator raising) never surface here;
/// they are logged and the row continues.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// An experiment with this name already exists in the store.
    #[error("experiment {name} already exists, please use a different name")]
    ExperimentExists { name: String },

    /// The experiment was accessed before `start()`.
    #[error("experiment not started yet")]
    ExperimentNotStarted,

    /// A run source was requested before predictions were made.
    #[error("runs not available until predictions have been made")]
    RunsNotAvailable,

    /// The tracer finished without delivering a run for this example.
    #[error("no run was recorded for example {example_id}")]
    MissingRun { example_id: Uuid },

    /// The dataset yielded no examples, so its identity cannot be inferred.
    #[error("dataset is empty")]
    EmptyDataset,

    /// Forked sources disagreed on length at the given row.
    #[error("forked sources are misaligned at row {index}")]
    Misaligned { index: usize },

    /// A submitted task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    /// The store collaborator failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

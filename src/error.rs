//! Error taxonomy for run orchestration.
//!
//! Collaborator traits (agents, step executors, stores) speak `anyhow`; the
//! run controller converts those failures into a [`RunFault`] at its boundary
//! so callers always see one of a closed set of outcomes.

use std::time::Duration;

use thiserror::Error;

/// Faults surfaced by the run controller and the step engine.
#[derive(Error, Debug)]
pub enum RunFault {
    /// Bad dispatch parameters or an illegal state transition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A condition, router or loop expression failed to compile or evaluate.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Cooperative cancellation observed at a checkpoint.
    #[error("run {run_id} was cancelled")]
    Cancelled {
        /// Identifier of the cancelled run.
        run_id: String,
    },

    /// Unhandled failure inside a step, tool or model call.
    #[error("{0}")]
    Execution(String),

    /// The run exceeded its deadline.
    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    /// The persistence or cancellation store rejected an operation.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// No run with the given identifier is known.
    #[error("run '{0}' not found")]
    NotFound(String),
}

impl RunFault {
    /// Wrap a collaborator error raised by a store.
    pub fn persistence(err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

/// Failures of the sandboxed expression language.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("failed to compile expression `{expression}`: {message}")]
    Compile { expression: String, message: String },

    #[error("failed to evaluate expression `{expression}`: {message}")]
    Evaluate { expression: String, message: String },

    #[error("router `{router}` selected unknown route `{selected}` and has no default")]
    UnknownRoute { router: String, selected: String },
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, RunFault>;

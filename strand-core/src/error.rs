use strand_model::ModelError;
use thiserror::Error;

use crate::scope::{CancelReason, ScopeFailure};

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// A policy or key failed model validation.
    #[error("invalid model value: {0}")]
    InvalidModel(#[from] ModelError),

    /// Configuration values that cannot be used as given.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Called outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The run or scope was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// A non-isolated task failed its scope.
    #[error("{0}")]
    ScopeFailed(ScopeFailure),
}

/// Result alias for the orchestration core.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

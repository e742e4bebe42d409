//! Structured-concurrency data orchestration.
//!
//! The crate is layered leaf-first:
//!
//! - [`dispatch`]: named execution contexts ([`DispatcherProvider`]).
//! - [`scope`]: [`CancellableScope`], the ownership boundary for tasks.
//! - [`pipeline`]: [`ReconcilingPipeline`], which merges a local and a remote
//!   read into an ordered [`ResultState`] stream with retry and backoff.
//! - [`executor`]: [`UseCaseExecutor`], which runs pipelines per
//!   [`OperationKey`] with supersession and deadlines.
//! - [`state_holder`]: [`StateHolder`], the sink that keeps the latest state
//!   and its history.
//!
//! ```no_run
//! use strand_core::prelude::*;
//!
//! # async fn demo() -> strand_core::Result<()> {
//! let executor = UseCaseExecutor::new(
//!     DispatcherProvider::current(),
//!     ExecutorConfig::default(),
//! )?;
//! let run = executor.execute(
//!     OperationKey::new("get-user:42")?,
//!     local_fn(|| async { Ok(Some("cached")) }),
//!     remote_fn(
//!         || async { Ok::<_, String>("fresh") },
//!         |_: &String| ErrorKind::Transient,
//!     ),
//!     RetryPolicy::default(),
//! );
//! let state = run.wait().await.into_result()?;
//! assert_eq!(state, ResultState::remote("fresh"));
//! # Ok(())
//! # }
//! ```

/// Orchestrator configuration.
pub mod config;
pub mod dispatch;
/// Error type of the core.
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod scope;
pub mod sources;
pub mod state_holder;

pub use config::{
    DispatchConfig, ExecutorConfig, OrchestratorConfig, RetryConfig,
};
pub use dispatch::{ContextName, DispatcherProvider, ExecutionContext};
pub use error::{OrchestrationError, Result};
pub use executor::{
    Deadline, ExecuteOptions, Execution, RunOutcome, UseCaseExecutor,
};
pub use pipeline::{ReconcilingPipeline, StateStream, reconcile};
pub use scope::{
    CancelReason, CancellableScope, Outcome, ScopeBuilder, ScopeExit,
    ScopeFailure, ScopeState, TaskHandle, TaskId, TaskOptions, TaskState,
};
pub use sources::{
    LocalFn, LocalSource, NoLocal, RemoteFailure, RemoteFn, RemoteSource,
    local_fn, remote_fn,
};
pub use state_holder::StateHolder;
pub use strand_model::{
    ErrorKind, OperationKey, Origin, ResultState, RetryPolicy, RunId,
};

/// Everything needed to wire a use case.
pub mod prelude {
    pub use crate::{
        CancelReason, CancellableScope, DispatcherProvider, ErrorKind,
        ExecuteOptions, ExecutorConfig, LocalSource, OperationKey, Origin,
        RemoteSource, ResultState, RetryPolicy, RunOutcome, StateHolder,
        UseCaseExecutor, local_fn, remote_fn,
    };
}

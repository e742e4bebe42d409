//! Core data model definitions shared across Strand crates.
//!
//! Everything that leaves the orchestration core travels as a
//! [`ResultState`]; everything that configures a run is a plain value
//! ([`RetryPolicy`], [`OperationKey`]). The crate has no runtime
//! dependencies so presentation layers can depend on it without pulling in
//! tokio.

/// Validation errors.
pub mod error;
/// Operation keys and run ids.
pub mod ids;
/// Retry and backoff policy.
pub mod retry;
/// States emitted by a run.
pub mod state;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{OperationKey, RunId};
pub use retry::RetryPolicy;
pub use state::{ErrorKind, Origin, ResultState};

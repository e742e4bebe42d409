//! Configuration loading for Strand.
//!
//! [`ConfigLoader`] resolves an
//! [`OrchestratorConfig`](strand_core::OrchestratorConfig) from, in order of
//! precedence:
//!
//! 1. an explicit path passed to the loader,
//! 2. `$STRAND_CONFIG_PATH` (TOML or JSON file),
//! 3. `$STRAND_CONFIG_JSON` (inline JSON),
//! 4. the first of `strand.toml`, `strand.json`, `config/strand.toml`,
//!    `config/strand.json` that exists,
//! 5. built-in defaults.
//!
//! A `.env` file is read first when present. `STRAND_TIMEOUT`,
//! `STRAND_MAX_ATTEMPTS` and `STRAND_BASE_DELAY` then override individual
//! fields regardless of where the rest came from. The merged result is
//! validated before it is returned.

/// Loader errors.
pub mod error;
/// Source resolution and environment overrides.
pub mod loader;

pub use error::ConfigLoadError;
pub use loader::{
    CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigLoad, ConfigLoader, ConfigSource,
    parse_config,
};

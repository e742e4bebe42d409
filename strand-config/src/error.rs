use std::{num::ParseIntError, path::PathBuf};

use strand_core::OrchestrationError;
use thiserror::Error;

/// Failures while locating, parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly requested file is absent.
    #[error("config file {path} does not exist")]
    MissingConfig {
        /// The requested path.
        path: PathBuf,
    },
    /// The file exists but could not be read.
    #[error("failed to read config file {path}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A `.toml` payload failed to parse.
    #[error("invalid TOML in {origin}")]
    Toml {
        /// Where the payload came from.
        origin: String,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },
    /// A `.json` or inline JSON payload failed to parse.
    #[error("invalid JSON in {origin}")]
    Json {
        /// Where the payload came from.
        origin: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },
    /// A payload of unknown format parsed as neither TOML nor JSON.
    #[error(
        "failed to parse {origin} as TOML ({toml_error}) or JSON ({json_error})"
    )]
    UnknownFormat {
        /// Where the payload came from.
        origin: String,
        /// Message from the TOML attempt.
        toml_error: String,
        /// Message from the JSON attempt.
        json_error: String,
    },
    /// A duration override did not parse.
    #[error("{var}='{value}' is not a valid duration")]
    InvalidDuration {
        /// Environment variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
        /// Parser error.
        #[source]
        source: humantime::DurationError,
    },
    /// A numeric override did not parse.
    #[error("{var}='{value}' is not a valid number")]
    InvalidNumber {
        /// Environment variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
        /// Parser error.
        #[source]
        source: ParseIntError,
    },
    /// The merged configuration failed validation.
    #[error("configuration rejected: {0}")]
    Invalid(#[from] OrchestrationError),
    /// The `.env` file exists but could not be parsed.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

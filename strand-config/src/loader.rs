use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use strand_core::OrchestratorConfig;
use tracing::{debug, info};

use crate::error::ConfigLoadError;

/// Variable naming a TOML or JSON config file.
pub const CONFIG_PATH_ENV: &str = "STRAND_CONFIG_PATH";
/// Variable carrying the configuration as inline JSON.
pub const CONFIG_JSON_ENV: &str = "STRAND_CONFIG_JSON";
const TIMEOUT_ENV: &str = "STRAND_TIMEOUT";
const MAX_ATTEMPTS_ENV: &str = "STRAND_MAX_ATTEMPTS";
const BASE_DELAY_ENV: &str = "STRAND_BASE_DELAY";

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "strand.toml",
    "strand.json",
    "config/strand.toml",
    "config/strand.json",
];

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path given to [`ConfigLoader::with_config_path`].
    Explicit(PathBuf),
    /// Path taken from `$STRAND_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// Inline JSON from `$STRAND_CONFIG_JSON`.
    EnvInline,
    /// First default location that exists.
    File(PathBuf),
    /// Nothing found; built-in defaults.
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            ConfigSource::EnvPath(path) => {
                write!(f, "{} (from ${CONFIG_PATH_ENV})", path.display())
            }
            ConfigSource::EnvInline => write!(f, "${CONFIG_JSON_ENV}"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Default => f.write_str("built-in defaults"),
        }
    }
}

/// A validated configuration and how it was assembled.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// The effective configuration.
    pub config: OrchestratorConfig,
    /// Where the base configuration came from.
    pub source: ConfigSource,
    /// Whether a `.env` file was read.
    pub env_file_loaded: bool,
    /// Environment variables that overrode a field.
    pub overrides: Vec<&'static str>,
}

/// Builder that resolves and loads an [`OrchestratorConfig`].
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    skip_env_file: bool,
    search_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader with default search behaviour.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load this file; it must exist.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Read this file instead of `.env`.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Skip reading any `.env` file.
    pub fn without_env_file(mut self) -> Self {
        self.skip_env_file = true;
        self
    }

    /// Directory the default file locations are resolved against. The
    /// working directory when unset.
    pub fn with_search_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.search_root = Some(root.into());
        self
    }

    /// Load from the process environment, reading `.env` first.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let mut load = self.load_with(|name| env::var(name).ok())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Load using `lookup` in place of the process environment. No `.env`
    /// file is read.
    pub fn load_with<F>(&self, lookup: F) -> Result<ConfigLoad, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| {
            lookup(name).filter(|value| !value.trim().is_empty())
        };

        let (mut config, source) = self.resolve(&lookup)?;
        let overrides = apply_env_overrides(&mut config, &lookup)?;
        config.validate()?;

        info!(
            source = %source,
            overrides = ?overrides,
            "loaded orchestrator configuration"
        );

        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded: false,
            overrides,
        })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn resolve(
        &self,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<(OrchestratorConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.config_path {
            let config = load_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(raw) = lookup(CONFIG_PATH_ENV) {
            let path = PathBuf::from(raw);
            let config = load_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(CONFIG_JSON_ENV) {
            let config = serde_json::from_str(&raw).map_err(|source| {
                ConfigLoadError::Json {
                    origin: format!("${CONFIG_JSON_ENV}"),
                    source,
                }
            })?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        debug!("no configuration file found; using defaults");
        Ok((OrchestratorConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let root = self.search_root.as_deref().unwrap_or(Path::new("."));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}

fn load_file(path: &Path) -> Result<OrchestratorConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let origin = path.display().to_string();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .map_err(|source| ConfigLoadError::Json { origin, source }),
        Some("toml") | Some("tml") => toml::from_str(&contents)
            .map_err(|source| ConfigLoadError::Toml { origin, source }),
        _ => parse_config(&contents, &origin),
    }
}

/// Parse a configuration of unknown format, trying TOML first.
pub fn parse_config(
    contents: &str,
    origin: &str,
) -> Result<OrchestratorConfig, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml_error| {
        serde_json::from_str(contents).map_err(|json_error| {
            ConfigLoadError::UnknownFormat {
                origin: origin.to_string(),
                toml_error: toml_error.to_string(),
                json_error: json_error.to_string(),
            }
        })
    })
}

fn apply_env_overrides(
    config: &mut OrchestratorConfig,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Vec<&'static str>, ConfigLoadError> {
    let mut applied = Vec::new();

    if let Some(raw) = lookup(TIMEOUT_ENV) {
        config.executor.timeout_ms = match raw.trim() {
            "off" | "none" | "disabled" => None,
            value => Some(millis(parse_duration(TIMEOUT_ENV, value)?)),
        };
        applied.push(TIMEOUT_ENV);
    }

    if let Some(raw) = lookup(MAX_ATTEMPTS_ENV) {
        config.retry.max_attempts = raw.trim().parse().map_err(|source| {
            ConfigLoadError::InvalidNumber {
                var: MAX_ATTEMPTS_ENV,
                value: raw.clone(),
                source,
            }
        })?;
        applied.push(MAX_ATTEMPTS_ENV);
    }

    if let Some(raw) = lookup(BASE_DELAY_ENV) {
        let delay = parse_duration(BASE_DELAY_ENV, raw.trim())?;
        config.retry.base_delay_ms = millis(delay);
        applied.push(BASE_DELAY_ENV);
    }

    Ok(applied)
}

fn parse_duration(
    var: &'static str,
    value: &str,
) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(value).map_err(|source| {
        ConfigLoadError::InvalidDuration {
            var,
            value: value.to_string(),
            source,
        }
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

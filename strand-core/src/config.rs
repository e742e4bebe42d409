use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_model::{ErrorKind, RetryPolicy};

use crate::error::{OrchestrationError, Result};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so callers can supply partial configuration
/// payloads and only override what they care about.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency budgets for the named execution contexts.
    pub dispatch: DispatchConfig,
    /// Default retry/backoff policy for the remote leg.
    pub retry: RetryConfig,
    /// Timeout and supersession tuning for the use-case executor.
    pub executor: ExecutorConfig,
}

impl OrchestratorConfig {
    /// Check every section, building the retry policy once to validate it.
    pub fn validate(&self) -> Result<()> {
        self.retry.policy()?;
        self.executor.validate()?;
        Ok(())
    }
}

/// Maximum concurrently running tasks per execution context. `0` leaves a
/// context unbounded.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Budget for local and remote reads.
    pub io_parallelism: usize,
    /// Budget for compute-heavy work; defaults to the number of CPUs.
    pub cpu_parallelism: usize,
    /// Budget for run drivers and deadline timers.
    pub coordination_parallelism: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            io_parallelism: 64,
            cpu_parallelism: num_cpus::get(),
            coordination_parallelism: 0,
        }
    }
}

/// Serializable form of [`RetryPolicy`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total remote attempts, the first included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Failure kinds that earn another attempt.
    pub retryable_kinds: Vec<ErrorKind>,
}

impl RetryConfig {
    /// `base_delay_ms` as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Build the immutable policy handed to pipeline runs.
    pub fn policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::new(
            self.max_attempts,
            self.base_delay(),
            self.backoff_multiplier,
            self.retryable_kinds.iter().copied(),
        )?)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            retryable_kinds: vec![ErrorKind::Transient],
        }
    }
}

/// Per-run settings for [`crate::UseCaseExecutor`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline applied to every run unless overridden per call. `None`
    /// disables the deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// How long a new run waits for a superseded run with the same key to
    /// wind down before starting anyway.
    pub supersede_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            supersede_grace_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    /// Configured run deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `supersede_grace_ms` as a [`Duration`].
    pub fn supersede_grace(&self) -> Duration {
        Duration::from_millis(self.supersede_grace_ms)
    }

    /// Reject a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == Some(0) {
            return Err(OrchestrationError::InvalidConfig(
                "executor.timeout_ms must be greater than zero; omit it to \
                 disable the deadline"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        OrchestratorConfig::default()
            .validate()
            .expect("defaults are valid");
    }

    #[test]
    fn partial_payload_keeps_defaults() {
        let raw = r#"{
            "retry": { "max_attempts": 5 },
            "executor": { "timeout_ms": 250 }
        }"#;
        let config: OrchestratorConfig =
            serde_json::from_str(raw).expect("parse partial config");

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.executor.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.dispatch, DispatchConfig::default());
    }

    #[test]
    fn invalid_retry_settings_are_rejected() {
        let mut config = OrchestratorConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::InvalidModel(_))
        ));

        let mut config = OrchestratorConfig::default();
        config.executor.timeout_ms = Some(0);
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn policy_reflects_retryable_kinds() {
        let retry = RetryConfig {
            retryable_kinds: vec![ErrorKind::Transient, ErrorKind::Permanent],
            ..RetryConfig::default()
        };
        let policy = retry.policy().expect("valid policy");
        assert!(policy.is_retryable(ErrorKind::Permanent));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }
}

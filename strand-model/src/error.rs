use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Operation keys identify supersession groups and may not be blank.
    EmptyOperationKey,
    /// A retry policy must allow at least one attempt.
    ZeroAttempts,
    /// Backoff multipliers below 1.0 would shrink delays between attempts.
    InvalidMultiplier(f64),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EmptyOperationKey => {
                write!(f, "operation key must not be empty")
            }
            ModelError::ZeroAttempts => {
                write!(f, "retry policy requires max_attempts >= 1")
            }
            ModelError::InvalidMultiplier(value) => write!(
                f,
                "backoff multiplier must be a finite value >= 1.0 (got {value})"
            ),
        }
    }
}

impl std::error::Error for ModelError {}

/// Result alias for model validation.
pub type Result<T> = std::result::Result<T, ModelError>;

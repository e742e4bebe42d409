//! Typed states emitted by a reconciling run.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Where a successful value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Origin {
    /// Best-effort local cache.
    Local,
    /// Authoritative remote source.
    Remote,
}

/// Classification of a remote failure.
///
/// Cancellation is deliberately absent: it is a property of the owning
/// scope, never a state delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorKind {
    /// Network hiccups, upstream timeouts. Usually worth retrying.
    Transient,
    /// Validation failures, missing records. Retrying will not help.
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// One emission of a reconciling run.
///
/// Per request the sequence is `Loading`, optionally `Success` from
/// [`Origin::Local`], then at most one terminal state. Once emitted a state
/// is never mutated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "state", rename_all = "snake_case")
)]
pub enum ResultState<T> {
    /// Work has started and nothing is known yet.
    Loading,
    /// A value, tagged with where it came from.
    Success {
        /// The value itself.
        value: T,
        /// Which source produced it.
        origin: Origin,
    },
    /// The remote read failed and no local value was served.
    Error {
        /// Classification supplied by the caller's classifier.
        kind: ErrorKind,
        /// Human-readable description of the last failure.
        message: String,
        /// Whether the policy in effect treats `kind` as retryable.
        retryable: bool,
    },
}

impl<T> Default for ResultState<T> {
    fn default() -> Self {
        ResultState::Loading
    }
}

impl<T> ResultState<T> {
    /// `Success` from the local cache.
    pub fn local(value: T) -> Self {
        ResultState::Success {
            value,
            origin: Origin::Local,
        }
    }

    /// `Success` from the remote source.
    pub fn remote(value: T) -> Self {
        ResultState::Success {
            value,
            origin: Origin::Remote,
        }
    }

    /// Terminal `Error`.
    pub fn error(
        kind: ErrorKind,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        ResultState::Error {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// True for states that end a request: an `Error`, or a `Success` from
    /// the remote source.
    pub fn is_terminal(&self) -> bool {
        match self {
            ResultState::Loading => false,
            ResultState::Success { origin, .. } => *origin == Origin::Remote,
            ResultState::Error { .. } => true,
        }
    }

    /// True for `Loading`.
    pub fn is_loading(&self) -> bool {
        matches!(self, ResultState::Loading)
    }

    /// The carried value, if this is a `Success`.
    pub fn value(&self) -> Option<&T> {
        match self {
            ResultState::Success { value, .. } => Some(value),
            ResultState::Loading | ResultState::Error { .. } => None,
        }
    }

    /// Owned form of [`ResultState::value`].
    pub fn into_value(self) -> Option<T> {
        match self {
            ResultState::Success { value, .. } => Some(value),
            ResultState::Loading | ResultState::Error { .. } => None,
        }
    }

    /// Origin of a `Success`.
    pub fn origin(&self) -> Option<Origin> {
        match self {
            ResultState::Success { origin, .. } => Some(*origin),
            ResultState::Loading | ResultState::Error { .. } => None,
        }
    }

    /// Kind of an `Error`.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ResultState::Error { kind, .. } => Some(*kind),
            ResultState::Loading | ResultState::Success { .. } => None,
        }
    }

    /// Transform the carried value, keeping the state's shape.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResultState<U> {
        match self {
            ResultState::Loading => ResultState::Loading,
            ResultState::Success { value, origin } => ResultState::Success {
                value: f(value),
                origin,
            },
            ResultState::Error {
                kind,
                message,
                retryable,
            } => ResultState::Error {
                kind,
                message,
                retryable,
            },
        }
    }
}

impl<T: fmt::Display> fmt::Display for ResultState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultState::Loading => f.write_str("loading"),
            ResultState::Success {
                value,
                origin: Origin::Local,
            } => write!(f, "success(local): {value}"),
            ResultState::Success {
                value,
                origin: Origin::Remote,
            } => write!(f, "success(remote): {value}"),
            ResultState::Error {
                kind,
                message,
                retryable,
            } => write!(f, "error({kind}, retryable={retryable}): {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_success_and_error_are_terminal() {
        assert!(!ResultState::<u8>::Loading.is_terminal());
        assert!(!ResultState::local(1).is_terminal());
        assert!(ResultState::remote(1).is_terminal());
        assert!(
            ResultState::<u8>::error(ErrorKind::Permanent, "gone", false)
                .is_terminal()
        );
    }

    #[test]
    fn map_preserves_origin() {
        let mapped = ResultState::local(21).map(|v| v * 2);
        assert_eq!(mapped.value(), Some(&42));
        assert_eq!(mapped.origin(), Some(Origin::Local));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(
            ResultState::remote("fresh").to_string(),
            "success(remote): fresh"
        );
        assert_eq!(
            ResultState::<&str>::error(ErrorKind::Transient, "503", true)
                .to_string(),
            "error(transient, retryable=true): 503"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_with_state_tag() {
        let json = serde_json::to_value(ResultState::local("cached"))
            .expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "state": "success",
                "value": "cached",
                "origin": "local"
            })
        );
    }
}

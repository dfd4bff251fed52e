//! Error types for runwave-core.
//!
//! Every fault that crosses a component boundary is a [`CoreError`]. The
//! transport layer never matches on variants directly; it asks for the
//! stable [`ErrorCode`] via [`CoreError::code`] and picks the response from
//! that.

use crate::cluster::ClusterError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for runwave-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Stable classification of a failure.
///
/// Codes are independent of the concrete error variant so that new variants
/// can be added without changing how callers react to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The remote execution did not finish before the deadline.
    Timeout,
    /// No standby pod could be obtained for the language.
    PodNotFound,
    /// The in-use role label could not be persisted on the pod.
    PodUpdateFailed,
    /// The language has no configured command template.
    UnsupportedLanguage,
    /// The submitted code ran and failed.
    ExecutionFailed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::PodNotFound => write!(f, "pod_not_found"),
            Self::PodUpdateFailed => write!(f, "pod_update_failed"),
            Self::UnsupportedLanguage => write!(f, "unsupported_language"),
            Self::ExecutionFailed => write!(f, "execution_failed"),
        }
    }
}

/// Errors that can occur while scheduling or running code.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Execution exceeded the configured deadline.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// No standby pod available for the language.
    #[error("no standby pods available for language: {0}")]
    PodNotFound(String),

    /// Persisting the in-use role label failed.
    #[error("failed to mark pod {pod} as in use: {source}")]
    PodUpdateFailed {
        /// Name of the pod whose claim was rolled back
        pod: String,
        /// Underlying cluster failure
        #[source]
        source: ClusterError,
    },

    /// No command template for the language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The code ran inside the pod and exited with an error.
    #[error("execution error: {message}, output: {output}")]
    ExecutionFailed {
        /// Failure reported by the remote-exec transport
        message: String,
        /// Combined stdout/stderr captured before the failure
        output: String,
    },

    /// The change feed could not be established.
    #[error("pod change feed unavailable: {0}")]
    FeedUnavailable(#[source] ClusterError),

    /// Invalid service configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unexpected fault (for example a panicking exec transport).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classification code for this error.
    ///
    /// Returns `None` for faults outside the taxonomy; the transport treats
    /// those as generic internal errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Timeout(_) => Some(ErrorCode::Timeout),
            Self::PodNotFound(_) => Some(ErrorCode::PodNotFound),
            Self::PodUpdateFailed { .. } => Some(ErrorCode::PodUpdateFailed),
            Self::UnsupportedLanguage(_) => Some(ErrorCode::UnsupportedLanguage),
            Self::ExecutionFailed { .. } => Some(ErrorCode::ExecutionFailed),
            Self::FeedUnavailable(_) | Self::Config(_) | Self::Internal(_) => None,
        }
    }

    /// Whether a claim attempt that failed with this error may be retried.
    pub fn is_retryable_claim(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::PodNotFound) | Some(ErrorCode::PodUpdateFailed)
        )
    }
}

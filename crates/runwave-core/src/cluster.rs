//! Boundary to the cluster that owns the sandbox pods.
//!
//! The scheduler never creates pods. It consumes a change feed, flips the
//! role label on the pod it claims, and deletes the pod after one use. Code
//! runs inside the pod through a separate remote-exec seam. Both seams are
//! traits so the scheduler can run against a real cluster ([`crate::Kubectl`])
//! or a test double.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors reported by a cluster backend.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The backend process could not be spawned or read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend returned output that could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The backend command ran and failed.
    #[error("{program} failed: {message}")]
    Command {
        /// Program that was run
        program: String,
        /// Trimmed stderr or exit status
        message: String,
    },

    /// The named pod does not exist.
    #[error("pod not found: {0}")]
    NotFound(String),

    /// The cluster refused the change.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Lifecycle phase of a pod as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum PodPhase {
    /// Accepted but not yet running.
    Pending,
    /// Running; eligible for standby.
    Running,
    /// Terminated successfully.
    Succeeded,
    /// Terminated with failure.
    Failed,
    /// State could not be obtained.
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The parts of a pod object the scheduler looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObject {
    /// Unique pod name within the namespace.
    pub name: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Readiness phase.
    pub phase: PodPhase,
}

impl PodObject {
    /// Create a pod object with no labels.
    pub fn new(name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            phase,
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Get a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Whether the pod is running.
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }
}

/// One change-feed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// A pod appeared (also re-delivered when a watch is re-established).
    Added(PodObject),
    /// A pod changed.
    Modified(PodObject),
    /// A pod was removed.
    Deleted(PodObject),
}

impl PodEvent {
    /// The pod this event describes.
    pub fn pod(&self) -> &PodObject {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) => pod,
        }
    }
}

/// Live stream of change notifications.
pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClusterError>>;

/// Pod object store operations used by the scheduler.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// List every sandbox pod currently known to the cluster.
    async fn list(&self) -> Result<Vec<PodObject>, ClusterError>;

    /// Open a change feed.
    ///
    /// The stream ends when the backend closes the watch; callers are
    /// expected to re-open it.
    async fn watch(&self) -> Result<PodEventStream, ClusterError>;

    /// Set a label on the named pod, overwriting any existing value.
    async fn set_label(&self, pod: &str, key: &str, value: &str) -> Result<(), ClusterError>;

    /// Delete the named pod.
    async fn delete(&self, pod: &str) -> Result<(), ClusterError>;
}

/// Failure of a remote execution, with whatever output was captured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecFailure {
    /// What went wrong (exit status, transport error).
    pub message: String,
    /// Combined stdout/stderr captured before the failure.
    pub output: String,
}

impl ExecFailure {
    /// Create a new failure.
    pub fn new(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: output.into(),
        }
    }
}

/// Runs a command inside a pod.
///
/// Implementations must be cancel-safe: the dispatcher enforces its deadline
/// by dropping the returned future, and anything started for the call must
/// stop when that happens.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `argv` in `pod` and return combined stdout/stderr.
    async fn exec(&self, pod: &str, argv: &[String]) -> Result<String, ExecFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_deserialize() {
        let phase: PodPhase = serde_json::from_str("\"Running\"").expect("valid phase");
        assert_eq!(phase, PodPhase::Running);
        let phase: PodPhase = serde_json::from_str("\"Evicted\"").expect("unknown phase");
        assert_eq!(phase, PodPhase::Unknown);
    }

    #[test]
    fn test_pod_object_labels() {
        let pod = PodObject::new("py-1", PodPhase::Running)
            .with_label("language", "python")
            .with_label("app", "standby-pod");
        assert_eq!(pod.label("language"), Some("python"));
        assert_eq!(pod.label("missing"), None);
        assert!(pod.is_running());
        assert_eq!(PodEvent::Deleted(pod.clone()).pod(), &pod);
    }
}

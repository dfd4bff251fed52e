//! Cluster backend that drives the `kubectl` binary.
//!
//! Every call is a child process created with `kill_on_drop(true)`, so
//! dropping a pending call (deadline, client disconnect, watch shutdown)
//! also stops the process.

use crate::cluster::{
    ClusterError, ExecFailure, PodApi, PodEvent, PodEventStream, PodObject, PodPhase, RemoteExec,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// Maximum captured exec output in bytes (1 MB).
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Read size for the watch stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// `kubectl` backed implementation of [`PodApi`] and [`RemoteExec`].
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: PathBuf,
    namespace: String,
    kubeconfig: Option<PathBuf>,
    selector: String,
}

impl Kubectl {
    /// Create a backend for `namespace` using the given kubectl binary.
    ///
    /// Lists and watches are restricted to pods carrying a `language` label.
    pub fn new(program: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            namespace: namespace.into(),
            kubeconfig: None,
            selector: "language".into(),
        }
    }

    /// Use an explicit kubeconfig file.
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Label selector for list and watch (default: `language`).
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }

    /// Namespace this backend operates in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg("--namespace")
            .arg(&self.namespace)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run a kubectl subcommand to completion and return stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, ClusterError> {
        tracing::trace!(args = ?args, "Running kubectl");
        let output = self.command().args(args).output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("NotFound") || stderr.contains("not found") {
            return Err(ClusterError::NotFound(stderr));
        }
        Err(ClusterError::Command {
            program: self.program_name(),
            message: if stderr.is_empty() {
                describe_status(output.status)
            } else {
                stderr
            },
        })
    }
}

#[async_trait]
impl PodApi for Kubectl {
    async fn list(&self) -> Result<Vec<PodObject>, ClusterError> {
        let stdout = self
            .run(&["get", "pods", "-l", &self.selector, "-o", "json"])
            .await?;
        let list: RawPodList = serde_json::from_slice(&stdout)?;
        Ok(list.items.into_iter().map(PodObject::from).collect())
    }

    async fn watch(&self) -> Result<PodEventStream, ClusterError> {
        let mut child = self
            .command()
            .args([
                "get",
                "pods",
                "-l",
                self.selector.as_str(),
                "--watch",
                "--output-watch-events",
                "-o",
                "json",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| ClusterError::Command {
            program: self.program_name(),
            message: "watch stdout not captured".into(),
        })?;

        tracing::debug!(namespace = %self.namespace, selector = %self.selector, "Pod watch started");

        let state = WatchState {
            child,
            stdout,
            program: self.program_name(),
            decoder: WatchDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        };
        Ok(stream::try_unfold(state, next_event).boxed())
    }

    async fn set_label(&self, pod: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        let label = format!("{key}={value}");
        self.run(&["label", "pod", pod, &label, "--overwrite"])
            .await?;
        Ok(())
    }

    async fn delete(&self, pod: &str) -> Result<(), ClusterError> {
        self.run(&["delete", "pod", pod, "--wait=false"]).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for Kubectl {
    async fn exec(&self, pod: &str, argv: &[String]) -> Result<String, ExecFailure> {
        let output = self
            .command()
            .arg("exec")
            .arg(pod)
            .arg("--")
            .args(argv)
            .output()
            .await
            .map_err(|e| ExecFailure::new(format!("failed to run kubectl exec: {e}"), ""))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = truncate_output(combined, MAX_OUTPUT_SIZE);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ExecFailure::new(describe_status(output.status), combined))
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".into(),
    }
}

/// Cap captured output at `max_bytes`, cutting on a char boundary.
fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let cut = (0..=max_bytes)
        .rev()
        .find(|&i| output.is_char_boundary(i))
        .unwrap_or(0);
    output.truncate(cut);
    output.push_str("\n... [output truncated]");
    output
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPodList {
    #[serde(default)]
    items: Vec<RawPod>,
}

#[derive(Debug, Deserialize)]
struct RawPod {
    metadata: RawMetadata,
    #[serde(default)]
    status: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    phase: PodPhase,
}

impl From<RawPod> for PodObject {
    fn from(raw: RawPod) -> Self {
        Self {
            name: raw.metadata.name,
            labels: raw.metadata.labels.unwrap_or_default(),
            phase: raw.status.phase,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

impl RawWatchEvent {
    fn into_event(self) -> Result<Option<PodEvent>, ClusterError> {
        let wrap: fn(PodObject) -> PodEvent = match self.kind.as_str() {
            "ADDED" => PodEvent::Added,
            "MODIFIED" => PodEvent::Modified,
            "DELETED" => PodEvent::Deleted,
            "ERROR" => {
                let message = self
                    .object
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("watch error")
                    .to_owned();
                return Err(ClusterError::Rejected(message));
            }
            other => {
                tracing::trace!(kind = %other, "Skipping watch event");
                return Ok(None);
            }
        };
        let pod: RawPod = serde_json::from_value(self.object)?;
        Ok(Some(wrap(pod.into())))
    }
}

/// Decodes a byte stream of concatenated JSON watch events.
///
/// kubectl pretty-prints each event across many lines, so documents are
/// split on JSON boundaries rather than newlines.
#[derive(Debug, Default)]
struct WatchDecoder {
    buf: Vec<u8>,
}

impl WatchDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode every complete event buffered so far.
    fn drain(&mut self) -> Result<Vec<PodEvent>, ClusterError> {
        let mut events = Vec::new();
        let mut consumed = 0;
        {
            let mut iter =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<RawWatchEvent>();
            loop {
                match iter.next() {
                    Some(Ok(raw)) => {
                        consumed = iter.byte_offset();
                        if let Some(event) = raw.into_event()? {
                            events.push(event);
                        }
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        consumed = iter.byte_offset();
                        break;
                    }
                }
            }
        }
        self.buf.drain(..consumed);
        Ok(events)
    }

    fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }
}

struct WatchState {
    child: Child,
    stdout: ChildStdout,
    program: String,
    decoder: WatchDecoder,
    pending: VecDeque<PodEvent>,
    done: bool,
}

async fn next_event(mut state: WatchState) -> Result<Option<(PodEvent, WatchState)>, ClusterError> {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        if let Some(event) = state.pending.pop_front() {
            return Ok(Some((event, state)));
        }
        if state.done {
            return Ok(None);
        }

        let n = state.stdout.read(&mut chunk).await?;
        if n == 0 {
            state.done = true;
            return finish_watch(&mut state).await.map(|()| None);
        }
        state.decoder.push(&chunk[..n]);
        let events = state.decoder.drain()?;
        state.pending.extend(events);
    }
}

/// Reap the watch process once its output is exhausted.
async fn finish_watch(state: &mut WatchState) -> Result<(), ClusterError> {
    let status = state.child.wait().await?;
    if status.success() {
        if state.decoder.has_partial() {
            tracing::warn!("Pod watch ended with a partial event");
        }
        tracing::debug!("Pod watch closed by backend");
        return Ok(());
    }

    let mut stderr = String::new();
    if let Some(mut pipe) = state.child.stderr.take() {
        // Best effort; the exit status is reported either way.
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    let stderr = stderr.trim();
    Err(ClusterError::Command {
        program: state.program.clone(),
        message: if stderr.is_empty() {
            describe_status(status)
        } else {
            stderr.to_owned()
        },
    })
}

//! Running submitted code on a claimed pod.
//!
//! One request moves through `allocating → executing → classified →
//! torn down`. The teardown step is reached on every path that claimed a
//! pod, including timeouts and a panicking exec transport.

use crate::allocator::Allocator;
use crate::cluster::RemoteExec;
use crate::config::ServiceConfig;
use crate::error::{CoreError, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The code ran and exited successfully.
    Succeeded(String),
    /// The deadline elapsed first.
    TimedOut,
    /// The code ran and failed.
    ExecutionFailed {
        /// Transport failure description
        message: String,
        /// Combined output captured before the failure
        output: String,
    },
}

/// Dispatches code to pods from the warm pool.
pub struct Dispatcher {
    config: Arc<ServiceConfig>,
    allocator: Arc<Allocator>,
    exec: Arc<dyn RemoteExec>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: Arc<ServiceConfig>,
        allocator: Arc<Allocator>,
        exec: Arc<dyn RemoteExec>,
    ) -> Self {
        Self {
            config,
            allocator,
            exec,
        }
    }

    /// Get the service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run `code` as `language` on a fresh pod and return its output.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnsupportedLanguage`] before any pod is claimed
    /// - [`CoreError::PodNotFound`] if no pod could be claimed
    /// - [`CoreError::Timeout`] if the deadline elapsed
    /// - [`CoreError::ExecutionFailed`] if the code failed
    /// - [`CoreError::Internal`] if the exec transport panicked
    pub async fn execute(&self, code: &str, language: &str) -> Result<String> {
        let template = self.config.command_for(language)?;
        let argv = template.to_argv(code);

        let pod = self.allocator.claim_with_retry(language).await?;
        let start = Instant::now();
        tracing::debug!(pod = %pod.name(), language = %language, code_len = code.len(), "Executing code");

        let outcome = self.run(pod.name(), &argv).await;
        pod.release_and_delete().await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(Outcome::Succeeded(output)) => {
                tracing::info!(language = %language, elapsed_ms, output_len = output.len(), "Execution succeeded");
                Ok(output)
            }
            Ok(Outcome::TimedOut) => {
                self.allocator_stats_timeout();
                tracing::warn!(language = %language, elapsed_ms, "Execution timed out");
                Err(CoreError::Timeout(self.config.timeout))
            }
            Ok(Outcome::ExecutionFailed { message, output }) => {
                tracing::info!(language = %language, elapsed_ms, error = %message, "Execution failed");
                Err(CoreError::ExecutionFailed { message, output })
            }
            Err(e) => {
                tracing::error!(language = %language, error = %e, "Execution aborted");
                Err(e)
            }
        }
    }

    /// Run `argv` on `pod` under the configured deadline.
    async fn run(&self, pod: &str, argv: &[String]) -> Result<Outcome> {
        let call = AssertUnwindSafe(self.exec.exec(pod, argv)).catch_unwind();
        match tokio::time::timeout(self.config.timeout, call).await {
            Err(_elapsed) => Ok(Outcome::TimedOut),
            Ok(Err(panic)) => Err(CoreError::Internal(format!(
                "exec transport panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(Err(failure))) => Ok(Outcome::ExecutionFailed {
                message: failure.message,
                output: failure.output,
            }),
            Ok(Ok(Ok(output))) => Ok(Outcome::Succeeded(output)),
        }
    }

    fn allocator_stats_timeout(&self) {
        self.allocator
            .stats()
            .timeouts
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

//! Claiming standby pods and tearing them down after use.
//!
//! A claim is only final once the in-use role label is persisted on the
//! pod. If that write fails the local claim is rolled back so the store and
//! the cluster never disagree about a pod nobody owns.
//!
//! Claimed pods are never returned to standby. [`ClaimedPod`] owns the
//! claim; consuming it with [`ClaimedPod::release_and_delete`] releases the
//! local entry first and then deletes the pod. If the guard is dropped
//! instead (cancelled request, panic) the same teardown runs in the
//! background.

use crate::cluster::PodApi;
use crate::config::ServiceConfig;
use crate::error::{CoreError, Result};
use crate::pool::{PoolStats, PoolStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Retry policy
// ============================================================================

/// Linear backoff for claim attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of claim attempts (default: 4).
    pub max_attempts: u32,
    /// Delay unit; the sleep after attempt `n` is `n` units (default: 1s).
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep after the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

impl From<&ServiceConfig> for RetryPolicy {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_attempts: config.claim_retries,
            backoff_unit: config.retry_backoff,
        }
    }
}

// ============================================================================
// Teardown
// ============================================================================

#[derive(Clone)]
struct Teardown {
    store: Arc<PoolStore>,
    api: Arc<dyn PodApi>,
}

impl Teardown {
    fn release(&self, name: &str) {
        self.store.release(name);
        self.store.stats().teardowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete failures are logged only; the pod is left for external cleanup.
    async fn delete(&self, name: &str) {
        match self.api.delete(name).await {
            Ok(()) => tracing::debug!(pod = %name, "Pod deleted"),
            Err(e) => {
                self.store.stats().delete_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(pod = %name, error = %e, "Failed to delete pod");
            }
        }
    }
}

/// Exclusive ownership of one claimed pod.
pub struct ClaimedPod {
    name: String,
    language: String,
    teardown: Option<Teardown>,
}

impl ClaimedPod {
    /// Pod name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Language the pod was claimed for.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Release the local claim, then delete the pod.
    ///
    /// The guard is disarmed before the delete starts, and the delete runs
    /// on its own task, so dropping this future mid-delete neither repeats
    /// the teardown nor abandons it.
    pub async fn release_and_delete(mut self) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        teardown.release(&self.name);

        let name = std::mem::take(&mut self.name);
        let task = tokio::spawn(async move { teardown.delete(&name).await });
        if let Err(e) = task.await {
            tracing::error!(error = ?e, "Pod delete task failed");
        }
    }

    /// Release the local claim without touching the cluster.
    fn abandon(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown.store.release(&self.name);
        }
    }
}

impl std::fmt::Debug for ClaimedPod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedPod")
            .field("name", &self.name)
            .field("language", &self.language)
            .field("armed", &self.teardown.is_some())
            .finish()
    }
}

impl Drop for ClaimedPod {
    fn drop(&mut self) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        teardown.release(&self.name);

        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(pod = %name, "Claimed pod dropped before teardown, deleting in background");
                handle.spawn(async move { teardown.delete(&name).await });
            }
            Err(_) => {
                tracing::error!(pod = %name, "No runtime to delete dropped pod, leaving it for external cleanup");
            }
        }
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Claims standby pods with retry and tears them down after use.
pub struct Allocator {
    teardown: Teardown,
    retry: RetryPolicy,
}

impl Allocator {
    /// Create an allocator over `store`, persisting claims through `api`.
    pub fn new(store: Arc<PoolStore>, api: Arc<dyn PodApi>, retry: RetryPolicy) -> Self {
        Self {
            teardown: Teardown { store, api },
            retry,
        }
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Pool counters.
    pub fn stats(&self) -> &PoolStats {
        self.teardown.store.stats()
    }

    fn store(&self) -> &PoolStore {
        &self.teardown.store
    }

    /// Claim one standby pod and persist the in-use label.
    ///
    /// # Errors
    ///
    /// - [`CoreError::PodNotFound`] if no standby pod is available
    /// - [`CoreError::PodUpdateFailed`] if the label write failed; the local
    ///   claim has already been released
    pub async fn claim_one(&self, language: &str) -> Result<ClaimedPod> {
        let Some(name) = self.store().claim(language) else {
            self.store().stats().misses.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::PodNotFound(language.to_owned()));
        };

        // Armed before the label write so a cancelled claim still tears down.
        let pod = ClaimedPod {
            name,
            language: language.to_owned(),
            teardown: Some(self.teardown.clone()),
        };

        let labels = self.store().labels();
        if let Err(source) = self
            .teardown
            .api
            .set_label(&pod.name, &labels.role_key, &labels.in_use_role)
            .await
        {
            self.store()
                .stats()
                .label_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pod = %pod.name, error = %source, "Failed to mark pod in use, releasing claim");
            let name = pod.name.clone();
            pod.abandon();
            return Err(CoreError::PodUpdateFailed { pod: name, source });
        }

        Ok(pod)
    }

    /// Claim a pod, retrying with linear backoff while none is available.
    ///
    /// Every failed attempt is followed by a sleep of `attempt × backoff_unit`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PodNotFound`] once all attempts are exhausted.
    pub async fn claim_with_retry(&self, language: &str) -> Result<ClaimedPod> {
        for attempt in 1..=self.retry.max_attempts {
            match self.claim_one(language).await {
                Ok(pod) => {
                    tracing::info!(pod = %pod.name(), language = %language, attempt, "Using pod");
                    return Ok(pod);
                }
                Err(e) if e.is_retryable_claim() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        language = %language,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %e,
                        "No standby pod claimed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            language = %language,
            attempts = self.retry.max_attempts,
            "No standby pods available"
        );
        Err(CoreError::PodNotFound(language.to_owned()))
    }

    /// Release `name` locally and delete it from the cluster.
    ///
    /// Never fails: delete errors are logged and counted.
    pub async fn release_and_delete(&self, name: &str) {
        self.teardown.release(name);
        self.teardown.delete(name).await;
    }
}

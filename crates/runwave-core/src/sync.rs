//! Keeps the pool store in step with the cluster's change feed.
//!
//! # Architecture
//!
//! [`PoolSynchronizer::start`] performs a full list of sandbox pods and
//! opens the watch before returning, so the first request is served from a
//! synced pool. A background task then applies every notification to the
//! store. When the backend closes the watch it is re-opened after a short
//! delay; re-delivered adds are absorbed by idempotent reconciliation.

use crate::cluster::{PodApi, PodEvent, PodEventStream};
use crate::error::{CoreError, Result};
use crate::pool::{PoolStore, Reconciled};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Default delay before re-opening a closed watch.
const DEFAULT_RESYNC_DELAY: Duration = Duration::from_secs(1);

/// Mirrors cluster pod objects into a [`PoolStore`].
pub struct PoolSynchronizer {
    api: Arc<dyn PodApi>,
    store: Arc<PoolStore>,
    resync_delay: Duration,
    /// Shutdown signal for the feed task.
    shutdown: Arc<AtomicBool>,
    /// Notification to wake up the feed task on shutdown.
    shutdown_notify: Arc<Notify>,
    /// Handle to the background feed task.
    feed_handle: Option<JoinHandle<()>>,
}

impl PoolSynchronizer {
    /// Create a synchronizer. Nothing happens until [`start`](Self::start).
    pub fn new(api: Arc<dyn PodApi>, store: Arc<PoolStore>) -> Self {
        Self {
            api,
            store,
            resync_delay: DEFAULT_RESYNC_DELAY,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            feed_handle: None,
        }
    }

    /// Set the delay before re-opening a closed watch.
    pub fn with_resync_delay(mut self, delay: Duration) -> Self {
        self.resync_delay = delay;
        self
    }

    /// Sync the pool and start following the change feed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FeedUnavailable`] if the initial list or the
    /// watch cannot be established. Callers treat this as fatal.
    pub async fn start(&mut self) -> Result<()> {
        if self.feed_handle.is_some() {
            tracing::warn!("Pool synchronizer already started");
            return Ok(());
        }

        let pods = self.api.list().await.map_err(CoreError::FeedUnavailable)?;
        let added = pods
            .iter()
            .filter(|pod| self.store.reconcile_add(pod) == Reconciled::Added)
            .count();
        tracing::info!(observed = pods.len(), standby = added, "Initial pool sync complete");

        let stream = self.api.watch().await.map_err(CoreError::FeedUnavailable)?;

        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let resync_delay = self.resync_delay;

        let handle = tokio::spawn(async move {
            Self::feed_loop(api, store, stream, shutdown, shutdown_notify, resync_delay).await;
        });

        self.feed_handle = Some(handle);
        tracing::info!("Pool synchronizer started");
        Ok(())
    }

    /// Apply one notification to the store.
    pub fn apply(store: &PoolStore, event: &PodEvent) -> Reconciled {
        let outcome = match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => store.reconcile_add(pod),
            PodEvent::Deleted(pod) => store.reconcile_delete(pod),
        };
        tracing::trace!(pod = %event.pod().name, ?outcome, "Reconciled pod event");
        outcome
    }

    /// Background feed loop.
    ///
    /// Runs until shutdown is signaled, re-opening the watch whenever the
    /// backend closes it.
    async fn feed_loop(
        api: Arc<dyn PodApi>,
        store: Arc<PoolStore>,
        initial: PodEventStream,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
        resync_delay: Duration,
    ) {
        tracing::debug!("Feed loop started");
        let mut next_stream = Some(initial);

        'feed: loop {
            let mut stream = match next_stream.take() {
                Some(stream) => stream,
                None => {
                    tokio::select! {
                        biased;
                        _ = shutdown_notify.notified() => break 'feed,
                        _ = tokio::time::sleep(resync_delay) => {}
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break 'feed;
                    }
                    match api.watch().await {
                        Ok(stream) => {
                            tracing::info!("Pod watch re-established");
                            stream
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to re-open pod watch, retrying");
                            continue 'feed;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_notify.notified() => {
                        tracing::info!("Pool synchronizer received shutdown signal");
                        break 'feed;
                    }

                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            Self::apply(&store, &event);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Pod watch failed");
                            break;
                        }
                        None => {
                            tracing::debug!("Pod watch ended");
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("Feed loop exited");
    }

    /// Check if the feed task is running.
    pub fn is_running(&self) -> bool {
        self.feed_handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop following the change feed and wait for the task to exit.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down pool synchronizer");

        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();

        if let Some(handle) = self.feed_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Feed task panicked during shutdown");
            }
        }
    }
}

//! RunwaveServer - shared state behind the HTTP handlers.
//!
//! Wires the pool store, synchronizer, allocator, dispatcher and health
//! reporter together over one cluster backend.

use crate::config::{ConfigError, ServerConfig};
use runwave_core::{
    Allocator, Dispatcher, HealthReport, HealthReporter, Kubectl, PodApi, PoolStats, PoolStore,
    PoolSynchronizer, RemoteExec, RetryPolicy, ServiceConfig,
};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Code execution server state.
///
/// Cheap to clone; every clone shares the same pool.
#[derive(Clone)]
pub struct RunwaveServer {
    /// Pool store shared with the synchronizer and allocator
    store: Arc<PoolStore>,

    /// Runs requests on claimed pods
    dispatcher: Arc<Dispatcher>,

    /// Pool occupancy reports
    health: HealthReporter,

    /// Change feed follower
    sync: Arc<TokioMutex<PoolSynchronizer>>,

    /// Largest accepted `code` field in bytes
    max_code_bytes: usize,
}

impl RunwaveServer {
    /// Create a server backed by kubectl.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        let service = config.to_service_config()?;

        let mut kubectl = Kubectl::new(&config.kubectl, &config.namespace)
            .with_selector(service.labels.language_key.clone());
        if let Some(kubeconfig) = &config.kubeconfig {
            kubectl = kubectl.with_kubeconfig(kubeconfig);
        }
        let kubectl = Arc::new(kubectl);

        tracing::info!(
            namespace = %service.namespace,
            languages = ?service.commands.keys().collect::<Vec<_>>(),
            retries = service.claim_retries,
            timeout_ms = service.timeout.as_millis() as u64,
            "Scheduler configured"
        );

        Ok(Self::with_backend(
            service,
            kubectl.clone(),
            kubectl,
            config.max_code_bytes,
        ))
    }

    /// Create a server over arbitrary cluster backends.
    pub fn with_backend(
        service: ServiceConfig,
        api: Arc<dyn PodApi>,
        exec: Arc<dyn RemoteExec>,
        max_code_bytes: usize,
    ) -> Self {
        let service = Arc::new(service);
        let store = Arc::new(PoolStore::new(service.labels.clone()));
        let sync = PoolSynchronizer::new(Arc::clone(&api), Arc::clone(&store));
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&store),
            api,
            RetryPolicy::from(&*service),
        ));
        let dispatcher = Dispatcher::new(service, allocator, exec);

        Self {
            health: HealthReporter::new(Arc::clone(&store)),
            store,
            dispatcher: Arc::new(dispatcher),
            sync: Arc::new(TokioMutex::new(sync)),
            max_code_bytes,
        }
    }

    /// Sync the pool and start following the change feed.
    ///
    /// # Errors
    ///
    /// Fails if the initial list or watch cannot be established.
    pub async fn start_sync(&self) -> runwave_core::Result<()> {
        self.sync.lock().await.start().await
    }

    /// Stop following the change feed and log the pool counters.
    pub async fn shutdown_sync(&self) {
        self.sync.lock().await.shutdown().await;

        let stats = self.stats();
        tracing::info!(
            claims = stats.claims(),
            misses = stats.misses(),
            label_failures = stats.label_failures(),
            teardowns = stats.teardowns(),
            delete_failures = stats.delete_failures(),
            timeouts = stats.timeouts(),
            hit_rate = stats.hit_rate(),
            "Pool statistics"
        );
    }

    /// Run `code` as `language` on a fresh pod.
    pub async fn execute(&self, code: &str, language: &str) -> runwave_core::Result<String> {
        self.dispatcher.execute(code, language).await
    }

    /// Current pool occupancy.
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// Pool counters.
    pub fn stats(&self) -> &PoolStats {
        self.store.stats()
    }

    /// Pool store, for seeding and inspection.
    pub fn store(&self) -> &Arc<PoolStore> {
        &self.store
    }

    /// Largest accepted `code` field in bytes.
    pub fn max_code_bytes(&self) -> usize {
        self.max_code_bytes
    }
}

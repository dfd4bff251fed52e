//! # runwave-core
//!
//! Warm-pool scheduler for single-use sandbox pods.
//!
//! A pool of pre-started pods, one queue per language, is kept in sync with
//! the cluster. Each execution request claims the oldest standby pod, runs
//! the code on it under a deadline, and deletes the pod afterwards. Pods are
//! never reused; the cluster's own replica controller replaces them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    runwave-core                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ PoolSynchronizer│────▶│  PoolStore               │   │
//! │  │  - start()      │     │   standby: lang → FIFO   │   │
//! │  │  - shutdown()   │     │   in_use:  set           │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           ▲                   ▲              ▲          │
//! │           │ list/watch        │ claim        │ snapshot │
//! │           │                   │ release      │          │
//! │  ┌─────────────────┐     ┌─────────────┐  ┌───────────┐ │
//! │  │    PodApi       │◀────│  Allocator  │  │  Health   │ │
//! │  │  (Kubectl)      │     │  + retry    │  │  Reporter │ │
//! │  └─────────────────┘     └─────────────┘  └───────────┘ │
//! │                               ▲                          │
//! │  ┌─────────────────┐     ┌─────────────┐                │
//! │  │   RemoteExec    │◀────│ Dispatcher  │                │
//! │  │  (Kubectl)      │     │ - execute() │                │
//! │  └─────────────────┘     └─────────────┘                │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use runwave_core::{
//!     Allocator, Dispatcher, Kubectl, PoolStore, PoolSynchronizer, RetryPolicy, ServiceConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> runwave_core::Result<()> {
//! let config = Arc::new(ServiceConfig::builder().namespace("code-exec-system").build()?);
//! let kubectl = Arc::new(Kubectl::new("kubectl", &config.namespace));
//! let store = Arc::new(PoolStore::new(config.labels.clone()));
//!
//! let mut sync = PoolSynchronizer::new(kubectl.clone(), Arc::clone(&store));
//! sync.start().await?;
//!
//! let allocator = Arc::new(Allocator::new(store, kubectl.clone(), RetryPolicy::from(&*config)));
//! let dispatcher = Dispatcher::new(config, allocator, kubectl);
//!
//! let output = dispatcher.execute("print('hi')", "python").await?;
//! println!("{output}");
//!
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod allocator;
mod cluster;
mod config;
mod dispatch;
mod error;
mod health;
mod kubectl;
mod pool;
mod sync;

pub use allocator::{Allocator, ClaimedPod, RetryPolicy};
pub use cluster::{
    ClusterError, ExecFailure, PodApi, PodEvent, PodEventStream, PodObject, PodPhase, RemoteExec,
};
pub use config::{CommandTemplate, PodLabels, ServiceConfig, ServiceConfigBuilder, DEFAULT_NAMESPACE};
pub use dispatch::{Dispatcher, Outcome};
pub use error::{CoreError, ErrorCode, Result};
pub use health::{HealthReport, HealthReporter};
pub use kubectl::Kubectl;
pub use pool::{PoolSnapshot, PoolStats, PoolStore, Reconciled};
pub use sync::PoolSynchronizer;

//! In-memory view of the warm pod pool.
//!
//! The store holds, per language, a FIFO queue of standby pod names and a
//! set of claimed (in-use) names. Both collections live behind one mutex and
//! are never handed out by reference: callers get the claimed name, a
//! reconcile outcome, or a [`PoolSnapshot`] copy.
//!
//! Invariant: a pod name appears at most once across all standby queues and
//! the in-use set combined.
//!
//! # Example
//!
//! ```
//! use runwave_core::{PodLabels, PodObject, PodPhase, PoolStore};
//!
//! let store = PoolStore::new(PodLabels::default());
//! let pod = PodObject::new("py-1", PodPhase::Running).with_label("language", "python");
//! store.reconcile_add(&pod);
//!
//! assert_eq!(store.claim("python").as_deref(), Some("py-1"));
//! assert!(store.claim("python").is_none());
//! store.release("py-1");
//! ```

use crate::cluster::PodObject;
use crate::config::PodLabels;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Claims that returned a standby pod.
    pub claims: AtomicU64,
    /// Claims that found no standby pod.
    pub misses: AtomicU64,
    /// Claims rolled back because the role label could not be persisted.
    pub label_failures: AtomicU64,
    /// Pods handed to teardown.
    pub teardowns: AtomicU64,
    /// Teardown deletes that failed.
    pub delete_failures: AtomicU64,
    /// Executions that hit the deadline.
    pub timeouts: AtomicU64,
}

impl PoolStats {
    /// Get the number of successful claims.
    pub fn claims(&self) -> u64 {
        self.claims.load(Ordering::Relaxed)
    }

    /// Get the number of claim misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get the number of rolled-back claims.
    pub fn label_failures(&self) -> u64 {
        self.label_failures.load(Ordering::Relaxed)
    }

    /// Get the number of teardowns.
    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    /// Get the number of failed teardown deletes.
    pub fn delete_failures(&self) -> u64 {
        self.delete_failures.load(Ordering::Relaxed)
    }

    /// Get the number of timed-out executions.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Claim hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.claims() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of the pool contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Standby pod names per language, oldest first.
    pub standby: BTreeMap<String, Vec<String>>,
    /// Claimed pod names, sorted.
    pub in_use: Vec<String>,
}

impl PoolSnapshot {
    /// Number of standby pods across all languages.
    pub fn standby_count(&self) -> usize {
        self.standby.values().map(Vec::len).sum()
    }

    /// Standby plus in-use pods.
    pub fn total(&self) -> usize {
        self.standby_count() + self.in_use.len()
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// What a reconcile call did to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Appended to the language's standby queue.
    Added,
    /// Already queued; nothing changed.
    Duplicate,
    /// Pod is claimed or labeled in-use; left alone.
    InUse,
    /// Pod is not running yet.
    NotReady,
    /// Pod has no language label.
    Unlabeled,
    /// Removed from a standby queue.
    Removed,
    /// Removed from the in-use set.
    Released,
    /// Deleted pod was not tracked.
    Untracked,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Default)]
struct PoolState {
    standby: HashMap<String, VecDeque<String>>,
    in_use: HashSet<String>,
}

/// Concurrency-safe store of standby and in-use pods.
#[derive(Debug)]
pub struct PoolStore {
    state: Mutex<PoolState>,
    labels: PodLabels,
    stats: PoolStats,
}

impl PoolStore {
    /// Create an empty store.
    pub fn new(labels: PodLabels) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            labels,
            stats: PoolStats::default(),
        }
    }

    /// Every critical section leaves the state consistent, so a poisoned
    /// lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Label keys and role values this store reconciles with.
    pub fn labels(&self) -> &PodLabels {
        &self.labels
    }

    /// Get the pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Take the oldest standby pod for `language` and mark it in use.
    ///
    /// Returns `None` if the language has no standby pod.
    pub fn claim(&self, language: &str) -> Option<String> {
        let mut state = self.lock();
        let name = state.standby.get_mut(language)?.pop_front()?;
        state.in_use.insert(name.clone());
        drop(state);

        self.stats.claims.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pod = %name, language = %language, "Claimed standby pod");
        Some(name)
    }

    /// Remove `name` from the in-use set. Unknown names are ignored.
    ///
    /// Returns whether the name was in use.
    pub fn release(&self, name: &str) -> bool {
        let released = self.lock().in_use.remove(name);
        if released {
            tracing::debug!(pod = %name, "Released pod");
        }
        released
    }

    /// Whether `name` is currently claimed.
    pub fn is_in_use(&self, name: &str) -> bool {
        self.lock().in_use.contains(name)
    }

    /// Copy both collections under a single lock acquisition.
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        let standby = state
            .standby
            .iter()
            .map(|(lang, queue)| (lang.clone(), queue.iter().cloned().collect()))
            .collect();
        let mut in_use: Vec<String> = state.in_use.iter().cloned().collect();
        drop(state);

        in_use.sort();
        PoolSnapshot { standby, in_use }
    }

    /// Apply an add or update notification.
    pub fn reconcile_add(&self, pod: &PodObject) -> Reconciled {
        let Some(language) = pod.label(&self.labels.language_key) else {
            return Reconciled::Unlabeled;
        };

        let mut state = self.lock();
        if state.in_use.contains(&pod.name)
            || pod.label(&self.labels.role_key) == Some(self.labels.in_use_role.as_str())
        {
            return Reconciled::InUse;
        }

        // Languages show up in health reports as soon as any pod is seen.
        let queue = state.standby.entry(language.to_owned()).or_default();
        if !pod.is_running() {
            return Reconciled::NotReady;
        }
        if queue.iter().any(|name| name == &pod.name) {
            return Reconciled::Duplicate;
        }
        queue.push_back(pod.name.clone());
        drop(state);

        tracing::info!(pod = %pod.name, language = %language, "Adding pod to standby pool");
        Reconciled::Added
    }

    /// Apply a delete notification.
    pub fn reconcile_delete(&self, pod: &PodObject) -> Reconciled {
        let mut state = self.lock();
        if state.in_use.remove(&pod.name) {
            return Reconciled::Released;
        }

        let Some(language) = pod.label(&self.labels.language_key) else {
            return Reconciled::Unlabeled;
        };
        let Some(queue) = state.standby.get_mut(language) else {
            return Reconciled::Untracked;
        };
        match queue.iter().position(|name| name == &pod.name) {
            Some(index) => {
                queue.remove(index);
                drop(state);
                tracing::info!(pod = %pod.name, language = %language, "Removed pod from standby pool");
                Reconciled::Removed
            }
            None => Reconciled::Untracked,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

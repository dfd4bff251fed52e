//! Read-only pool occupancy report.

use crate::pool::{PoolSnapshot, PoolStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Occupancy report served by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Standby plus in-use pods.
    pub total_pods: usize,
    /// Standby pod names per language, oldest first.
    pub standby_pods: BTreeMap<String, Vec<String>>,
    /// Claimed pod names.
    pub in_use_pods: Vec<String>,
}

impl From<PoolSnapshot> for HealthReport {
    fn from(snapshot: PoolSnapshot) -> Self {
        Self {
            total_pods: snapshot.total(),
            standby_pods: snapshot.standby,
            in_use_pods: snapshot.in_use,
        }
    }
}

/// Builds [`HealthReport`]s from the pool store.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    store: Arc<PoolStore>,
}

impl HealthReporter {
    /// Create a reporter over `store`.
    pub fn new(store: Arc<PoolStore>) -> Self {
        Self { store }
    }

    /// Current occupancy, taken from one consistent snapshot.
    pub fn report(&self) -> HealthReport {
        let report = HealthReport::from(self.store.snapshot());
        tracing::trace!(total = report.total_pods, in_use = report.in_use_pods.len(), "Health report");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{PodObject, PodPhase};
    use crate::config::PodLabels;

    #[test]
    fn test_empty_report() {
        let reporter = HealthReporter::new(Arc::new(PoolStore::new(PodLabels::default())));
        let report = reporter.report();
        assert_eq!(report.total_pods, 0);
        assert!(report.standby_pods.is_empty());
        assert!(report.in_use_pods.is_empty());
    }

    #[test]
    fn test_report_counts_standby_and_in_use() {
        let store = Arc::new(PoolStore::new(PodLabels::default()));
        for name in ["py-1", "py-2"] {
            store.reconcile_add(
                &PodObject::new(name, PodPhase::Running).with_label("language", "python"),
            );
        }
        store.claim("python");

        let report = HealthReporter::new(Arc::clone(&store)).report();
        assert_eq!(report.total_pods, 2);
        assert_eq!(report.standby_pods["python"], vec!["py-2"]);
        assert_eq!(report.in_use_pods, vec!["py-1"]);
    }

    #[test]
    fn test_report_json_shape() {
        let report = HealthReport {
            total_pods: 1,
            standby_pods: BTreeMap::from([("python".to_owned(), vec!["py-1".to_owned()])]),
            in_use_pods: Vec::new(),
        };
        let json = serde_json::to_value(&report).expect("serializable");
        assert_eq!(
            json,
            serde_json::json!({
                "total_pods": 1,
                "standby_pods": {"python": ["py-1"]},
                "in_use_pods": []
            })
        );
    }
}

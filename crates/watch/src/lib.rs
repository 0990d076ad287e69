//! Dynamic watch registration: the watch-set registry and the CSV event
//! mapper that grows it.

#![forbid(unsafe_code)]

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use svcbind_api::{ClusterOps, ResourceKind, WatchSink};
use tracing::{debug, error, info};

/// Reconcile request shape handed back to the controller framework. The
/// mapper never produces any; its only effect is growing the watch set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

/// Notification about a cluster-service-version object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsvEvent {
    pub namespace: String,
    pub name: String,
}

/// The watch set, owned by the controller and shared with event callbacks.
/// `register_if_absent` is the single atomic operation; concurrent mappers
/// cannot race a kind into two registrations.
#[derive(Default)]
pub struct WatchRegistry {
    inner: Mutex<HashSet<String>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the kind's gvk key; false when it was already watched.
    pub fn register_if_absent(&self, kind: &ResourceKind) -> bool {
        self.inner.lock().unwrap().insert(kind.gvk_key())
    }

    /// Forget a kind so a later event can retry its registration.
    pub fn release(&self, kind: &ResourceKind) {
        self.inner.lock().unwrap().remove(&kind.gvk_key());
    }

    pub fn contains(&self, kind: &ResourceKind) -> bool {
        self.inner.lock().unwrap().contains(&kind.gvk_key())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Sorted snapshot of the watched gvk keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// Map a CSV notification to watch registrations.
///
/// Best-effort throughout: a failed kind listing returns the empty request
/// set, a failed registration releases that kind and moves on. Already
/// watched kinds are a no-op.
pub async fn map_csv_event(
    ops: &dyn ClusterOps,
    registry: &WatchRegistry,
    sink: &dyn WatchSink,
    event: &CsvEvent,
) -> Vec<ReconcileRequest> {
    let kinds = match ops.list_csv_kinds(&event.namespace, &event.name).await {
        Ok(kinds) => kinds,
        Err(e) => {
            error!(csv = %event.name, ns = %event.namespace, error = %e, "listing csv kinds failed");
            return Vec::new();
        }
    };

    for kind in &kinds {
        if !registry.register_if_absent(kind) {
            debug!(gvk = %kind.gvk_key(), "already watched");
            continue;
        }
        match sink.register_watch(kind).await {
            Ok(()) => {
                info!(gvk = %kind.gvk_key(), "watch added");
                counter!("svcbind_watches_registered", 1u64);
            }
            Err(e) => {
                error!(gvk = %kind.gvk_key(), error = %e, "watch registration failed");
                registry.release(kind);
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use svcbind_api::{MockCluster, RecordingSink};

    fn kind(group: &str, kind: &str) -> ResourceKind {
        ResourceKind {
            group: group.into(),
            version: "v1alpha1".into(),
            kind: kind.into(),
            namespaced: true,
        }
    }

    #[test]
    fn register_if_absent_is_idempotent() {
        let reg = WatchRegistry::new();
        let db = kind("postgres.dev", "Database");
        assert!(reg.register_if_absent(&db));
        assert!(!reg.register_if_absent(&db));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn concurrent_registration_yields_one_winner() {
        let reg = Arc::new(WatchRegistry::new());
        let db = kind("postgres.dev", "Database");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            let db = db.clone();
            handles.push(std::thread::spawn(move || reg.register_if_absent(&db)));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn mapper_registers_all_declared_kinds_and_returns_no_requests() {
        let mut ops = MockCluster::new();
        ops.add_csv(
            "ns1",
            "pg-operator.v1",
            vec![kind("postgres.dev", "Database"), kind("postgres.dev", "Backup")],
        );
        let reg = WatchRegistry::new();
        let sink = RecordingSink::default();
        let event = CsvEvent {
            namespace: "ns1".into(),
            name: "pg-operator.v1".into(),
        };

        let requests = map_csv_event(&ops, &reg, &sink, &event).await;
        assert!(requests.is_empty());
        assert_eq!(reg.len(), 2);
        assert_eq!(sink.registered.lock().unwrap().len(), 2);

        // a second event for the same CSV is a no-op
        map_csv_event(&ops, &reg, &sink, &event).await;
        assert_eq!(sink.registered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_failed_registration_does_not_block_the_rest() {
        let mut ops = MockCluster::new();
        ops.add_csv(
            "ns1",
            "pg-operator.v1",
            vec![kind("postgres.dev", "Database"), kind("postgres.dev", "Backup")],
        );
        let reg = WatchRegistry::new();
        let sink = RecordingSink {
            fail_gvk: Some("postgres.dev/v1alpha1/Database".into()),
            ..Default::default()
        };
        let event = CsvEvent {
            namespace: "ns1".into(),
            name: "pg-operator.v1".into(),
        };

        map_csv_event(&ops, &reg, &sink, &event).await;
        // the failed kind is released so a later event can retry it
        assert!(!reg.contains(&kind("postgres.dev", "Database")));
        assert!(reg.contains(&kind("postgres.dev", "Backup")));
        assert_eq!(sink.registered.lock().unwrap().as_slice(), ["postgres.dev/v1alpha1/Backup"]);
    }

    #[tokio::test]
    async fn listing_failure_is_contained() {
        let mut ops = MockCluster::new();
        ops.fail_csv_listing = true;
        let reg = WatchRegistry::new();
        let sink = RecordingSink::default();
        let event = CsvEvent {
            namespace: "ns1".into(),
            name: "gone".into(),
        };
        let requests = map_csv_event(&ops, &reg, &sink, &event).await;
        assert!(requests.is_empty());
        assert!(reg.is_empty());
    }
}

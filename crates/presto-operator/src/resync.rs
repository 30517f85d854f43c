//! Periodic resync of known clusters.
//!
//! Status updates don't bump `metadata.generation`, so the controller never
//! sees them as changes. Pod phases and CPU usage drift without any write
//! to the Presto resource either. Every cluster the controller has seen is
//! registered here, and a ticker re-enqueues all of them on a fixed interval
//! so their status keeps tracking reality.

use crate::crd::Presto;
use dashmap::DashMap;
use futures::channel::mpsc::UnboundedSender;
use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Default resync period
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Clusters to resync, keyed by `namespace/name`
#[derive(Default)]
pub struct ResyncRegistry {
    entries: DashMap<String, ObjectRef<Presto>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl ResyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster, returning true the first time it is seen
    pub fn register(&self, presto: &Presto) -> bool {
        let obj_ref = ObjectRef::from_obj(presto);
        let key = key(obj_ref.namespace.as_deref().unwrap_or_default(), &obj_ref.name);
        let added = self.entries.insert(key.clone(), obj_ref).is_none();
        if added {
            info!(cluster = %key, "Registered cluster for resync");
        }
        added
    }

    pub fn unregister(&self, namespace: &str, name: &str) -> bool {
        let removed = self.entries.remove(&key(namespace, name)).is_some();
        if removed {
            info!(cluster = %key(namespace, name), "Unregistered cluster from resync");
        }
        removed
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.entries.contains_key(&key(namespace, name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ObjectRef<Presto>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop every cluster the watch cache no longer holds
    pub fn prune(&self, cache: &Store<Presto>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, obj_ref| {
            let present = cache.get(obj_ref).is_some();
            if !present {
                info!(cluster = %key, "Cluster deleted, dropping from resync");
            }
            present
        });
        before - self.entries.len()
    }
}

/// Re-enqueue every registered cluster once per `interval` until the
/// receiving controller goes away
pub async fn run_resync(
    registry: Arc<ResyncRegistry>,
    cache: Store<Presto>,
    trigger: UnboundedSender<ObjectRef<Presto>>,
    interval: Duration,
) {
    info!(interval_secs = interval.as_secs(), "Starting resync loop");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        registry.prune(&cache);

        let clusters = registry.snapshot();
        debug!(count = clusters.len(), "Resyncing clusters");
        for obj_ref in clusters {
            if trigger.unbounded_send(obj_ref).is_err() {
                info!("Controller stopped, ending resync loop");
                return;
            }
        }
    }
}

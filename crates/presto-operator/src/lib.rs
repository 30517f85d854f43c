//! # Presto Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing Presto distributed SQL
//! clusters from a single `Presto` custom resource.
//!
//! ## Features
//!
//! - **Custom Resource Definition**: `Presto` (`falarica.io/v1alpha1`) describing
//!   coordinator and worker sizing, catalogs, the external service and extra volumes
//! - **Step-by-step Convergence**: one dependent resource created or updated per
//!   reconciliation, in dependency order
//! - **Generated Configuration**: `node.properties`, `config.properties`, `jvm.config`
//!   and catalog files rendered into ConfigMaps
//! - **Worker Autoscaling**: a HorizontalPodAutoscaler kept in step with the spec
//! - **Live Status**: coordinator pod state and CPU utilization refreshed on a
//!   fixed interval
//! - **Admission Check**: rejects changes to the coordinator CPU request
//! - **Observability**: Prometheus-compatible operator metrics and Kubernetes Events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use presto_operator::prelude::*;
//! use kube::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create Kubernetes client from default config
//!     let client = Client::try_default().await?;
//!
//!     // Run the operator controller, refreshing status every 10 seconds
//!     run_controller(client, None, Duration::from_secs(10)).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: Presto generation changes, owned Services, ConfigMaps and
//!    ReplicaSets, and a periodic resync of every known cluster
//! 2. **Identify**: assign the cluster a uuid on first sight; every dependent
//!    name and label derives from it
//! 3. **Converge**: walk the steps in order and stop at the first change
//! 4. **Observe**: once nothing changes, fold the coordinator pod phase and CPU
//!    usage into status
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: falarica.io/v1alpha1
//! kind: Presto
//! metadata:
//!   name: analytics
//! spec:
//!   coordinator:
//!     memoryLimit: 4Gi
//!     cpuLimit: "2"
//!   worker:
//!     memoryLimit: 8Gi
//!     cpuLimit: "1"
//!     count: 3
//!     autoscaling:
//!       enabled: true
//!       minReplicas: 2
//!       maxReplicas: 10
//!       targetCPUUtilizationPercentage: 70
//!   service:
//!     type: NodePort
//!     port: 8080
//! ```
//!
//! ## Metrics
//!
//! - `presto_operator_reconciliations_total` - Total reconciliation attempts
//! - `presto_operator_reconciliation_errors_total` - Reconciliation errors
//! - `presto_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `presto_operator_resource_mutations_total` - Dependent resource changes by kind and verb

pub mod autoscaling;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod health;
pub mod naming;
pub mod properties;
pub mod quantity;
pub mod resources;
pub mod resync;
pub mod status;
pub mod steps;
pub mod store;
pub mod webhook;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        reconcile_presto, run_controller, ControllerContext, ControllerMetrics, ReconcileOutcome,
    };
    pub use crate::crd::{
        AutoscalingSpec, CatalogList, ClusterState, CoordinatorSpec, NodeSpec, Presto,
        PrestoServiceSpec, PrestoSpec, PrestoStatus, PrestoVolume, WorkerSpec,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::resources::ResourceBuilder;
    pub use crate::resync::{ResyncRegistry, DEFAULT_RESYNC_INTERVAL};
    pub use crate::store::{ClusterStore, KubeStore};
}

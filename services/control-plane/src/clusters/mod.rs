//! Data-plane clusters.
//!
//! - [`model`]: the cluster row and its lifecycle state machine.
//! - [`service`]: persistence surface shared with the API layer.
//! - [`resources`]: the baseline manifests every cluster carries.
//! - [`manager`]: the `cluster` worker that drives clusters through their lifecycle.

pub mod manager;
pub mod model;
pub mod resources;
pub mod service;

pub use manager::{ClusterManager, ClusterManagerConfig};
pub use model::{Cluster, ClusterStatus, FindClusterCriteria};
pub use service::ClusterService;

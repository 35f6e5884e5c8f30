//! Outbound collaborators: the cluster provider, the identity provider and
//! the fleet-shard operator channel.
//!
//! The reconcilers only see these traits. Every call they make goes through
//! [`with_timeout`] so one stuck collaborator cannot hold a pass past the
//! lease window.

pub mod simulated;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kfm_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use simulated::{SimulatedClusterProvider, SimulatedFleetShard, SimulatedIdentityProvider};

/// Collaborator call errors. All of them are retried on the next pass.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            operation,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Run `fut`, failing with [`ProviderError::Timeout`] once `after` elapses.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { operation, after }),
    }
}

/// What the control plane asks the cluster provider to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Control-plane id; the provider keys create-if-absent on it.
    pub internal_id: String,
    pub cloud_provider: String,
    pub region: String,
    pub multi_az: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderClusterState {
    Pending,
    Installing,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub current_compute_nodes: u32,
    pub desired_compute_nodes: u32,
}

impl NodeInfo {
    pub fn is_scaling_up(&self) -> bool {
        self.current_compute_nodes < self.desired_compute_nodes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderClusterStatus {
    pub state: ProviderClusterState,
    /// Base DNS of the cluster, once known.
    pub dns: Option<String>,
    pub external_id: Option<String>,
    pub node_info: Option<NodeInfo>,
}

/// A named bundle of manifests applied to a cluster as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub name: String,
    pub resources: Vec<serde_json::Value>,
}

impl ResourceSet {
    /// Content hash; equal sets hash equal regardless of key order.
    pub fn hash(&self) -> SpecHash {
        SpecHash::from_json(&serde_json::json!({
            "name": self.name,
            "resources": self.resources,
        }))
    }
}

/// OAuth identity provider attached to a cluster's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProviderSpec {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer: String,
}

/// Provisions and tears down data-plane clusters.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Request a cluster. Returns the provider cluster id. Calling again
    /// with the same `internal_id` returns the existing id.
    async fn create(&self, request: &ClusterRequest) -> Result<String, ProviderError>;

    /// Provider cluster id created for `internal_id`, if one exists. Lets a
    /// row that never persisted its id still find the cluster to delete.
    async fn find_by_internal_id(&self, internal_id: &str) -> Result<Option<String>, ProviderError>;

    async fn get_status(&self, cluster_id: &str) -> Result<ProviderClusterStatus, ProviderError>;

    /// Start deleting. Returns true once the cluster is gone.
    async fn delete(&self, cluster_id: &str) -> Result<bool, ProviderError>;

    /// Apply (create or replace) every resource in the set.
    async fn apply_resources(&self, cluster_id: &str, resources: &ResourceSet) -> Result<(), ProviderError>;

    /// Install the fleet-shard operator add-on. Returns true once installed and ready.
    async fn install_operator(&self, cluster_id: &str) -> Result<bool, ProviderError>;

    /// Attach an identity provider (create-if-absent by name). Returns its id.
    async fn create_identity_provider(
        &self,
        cluster_id: &str,
        spec: &IdentityProviderSpec,
    ) -> Result<String, ProviderError>;
}

/// SSO server holding one OAuth client per cluster.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn issuer_uri(&self) -> String;

    /// Register a client. A second call with the same id returns the
    /// existing secret.
    async fn register_client(&self, client_id: &str, redirect_uri: &str) -> Result<String, ProviderError>;

    /// Remove a client. Removing an unknown client succeeds.
    async fn deregister_client(&self, client_id: &str) -> Result<(), ProviderError>;
}

/// Provisioning channel to the fleet-shard agent on a cluster.
#[async_trait]
pub trait FleetShardClient: Send + Sync {
    /// Provision the agent's service account and parameters. Returns true
    /// once the agent is ready.
    async fn provision(&self, cluster_id: &str) -> Result<bool, ProviderError>;

    async fn remove_service_account(&self, cluster_id: &str) -> Result<(), ProviderError>;

    /// Push drifted agent parameters.
    async fn reconcile_parameters(&self, cluster_id: &str) -> Result<(), ProviderError>;
}

/// The three collaborators a cluster reconciler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn ClusterProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub fleetshard: Arc<dyn FleetShardClient>,
}

impl Collaborators {
    /// In-process collaborators with default timings.
    pub fn simulated() -> Self {
        Self {
            provider: Arc::new(SimulatedClusterProvider::default()),
            identity: Arc::new(SimulatedIdentityProvider::new()),
            fleetshard: Arc::new(SimulatedFleetShard::default()),
        }
    }
}

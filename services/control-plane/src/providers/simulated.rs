//! In-process collaborators.
//!
//! Deterministic stand-ins for the cluster provider, the SSO server and the
//! fleet-shard channel. Dev mode runs against them; tests use the call
//! counters and the failure switches.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    ClusterProvider, ClusterRequest, FleetShardClient, IdentityProvider, IdentityProviderSpec,
    NodeInfo, ProviderClusterState, ProviderClusterStatus, ProviderError, ResourceSet,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Failure switches and call counters shared by every simulated collaborator.
#[derive(Debug, Default)]
struct Faults {
    failing: HashSet<&'static str>,
    latency: Option<Duration>,
    calls: HashMap<&'static str, usize>,
}

impl Faults {
    /// Count the call; return the configured latency and whether it should fail.
    fn enter(&mut self, operation: &'static str) -> (Option<Duration>, bool) {
        *self.calls.entry(operation).or_insert(0) += 1;
        (self.latency, self.failing.contains(operation))
    }
}

async fn simulate(faults: &Mutex<Faults>, operation: &'static str) -> Result<(), ProviderError> {
    let (latency, fail) = lock(faults).enter(operation);
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
    if fail {
        return Err(ProviderError::request(operation, "simulated failure"));
    }
    Ok(())
}

macro_rules! fault_controls {
    () => {
        /// Make every call to `operation` fail until [`Self::recover`].
        pub fn fail(&self, operation: &'static str) {
            lock(&self.faults).failing.insert(operation);
        }

        pub fn recover(&self, operation: &'static str) {
            lock(&self.faults).failing.remove(operation);
        }

        /// Delay every call by `latency`.
        pub fn set_latency(&self, latency: Option<Duration>) {
            lock(&self.faults).latency = latency;
        }

        /// Number of calls made to `operation`, failed ones included.
        pub fn calls(&self, operation: &str) -> usize {
            lock(&self.faults).calls.get(operation).copied().unwrap_or(0)
        }
    };
}

#[derive(Debug, Clone)]
struct SimCluster {
    region: String,
    polls: u32,
    state: Option<ProviderClusterState>,
    node_info: NodeInfo,
    operator_polls: u32,
    applied: HashMap<String, usize>,
    identity_providers: HashMap<String, String>,
    delete_polls: Option<u32>,
}

#[derive(Debug, Default)]
struct ProviderState {
    next_id: u64,
    by_internal_id: HashMap<String, String>,
    clusters: HashMap<String, SimCluster>,
    deleted: HashSet<String>,
}

/// Cluster provider that reports `Ready` after a fixed number of status polls.
#[derive(Debug)]
pub struct SimulatedClusterProvider {
    polls_until_ready: u32,
    polls_until_operator_ready: u32,
    polls_until_deleted: u32,
    state: Mutex<ProviderState>,
    faults: Mutex<Faults>,
}

impl Default for SimulatedClusterProvider {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl SimulatedClusterProvider {
    pub fn new(polls_until_ready: u32, polls_until_operator_ready: u32, polls_until_deleted: u32) -> Self {
        Self {
            polls_until_ready,
            polls_until_operator_ready,
            polls_until_deleted,
            state: Mutex::new(ProviderState::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    fault_controls!();

    /// Force a cluster's provider-side state (e.g. `Failed`).
    pub fn set_state(&self, cluster_id: &str, state: ProviderClusterState) {
        if let Some(cluster) = lock(&self.state).clusters.get_mut(cluster_id) {
            cluster.state = Some(state);
        }
    }

    pub fn set_node_info(&self, cluster_id: &str, node_info: NodeInfo) {
        if let Some(cluster) = lock(&self.state).clusters.get_mut(cluster_id) {
            cluster.node_info = node_info;
        }
    }

    /// Times `resource_set` was applied to `cluster_id`.
    pub fn applied(&self, cluster_id: &str, resource_set: &str) -> usize {
        lock(&self.state)
            .clusters
            .get(cluster_id)
            .and_then(|c| c.applied.get(resource_set).copied())
            .unwrap_or(0)
    }

    pub fn identity_providers(&self, cluster_id: &str) -> usize {
        lock(&self.state)
            .clusters
            .get(cluster_id)
            .map_or(0, |c| c.identity_providers.len())
    }

    /// Clusters currently existing at the provider.
    pub fn cluster_count(&self) -> usize {
        lock(&self.state).clusters.len()
    }

    pub fn is_deleted(&self, cluster_id: &str) -> bool {
        lock(&self.state).deleted.contains(cluster_id)
    }

    fn with_cluster<T>(
        &self,
        cluster_id: &str,
        f: impl FnOnce(&mut SimCluster) -> T,
    ) -> Result<T, ProviderError> {
        let mut state = lock(&self.state);
        let cluster = state
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| ProviderError::NotFound {
                kind: "cluster",
                id: cluster_id.to_string(),
            })?;
        Ok(f(cluster))
    }
}

#[async_trait]
impl ClusterProvider for SimulatedClusterProvider {
    async fn create(&self, request: &ClusterRequest) -> Result<String, ProviderError> {
        simulate(&self.faults, "create").await?;

        let mut state = lock(&self.state);
        if let Some(existing) = state.by_internal_id.get(&request.internal_id) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let cluster_id = format!("sim-{:04}", state.next_id);
        state
            .by_internal_id
            .insert(request.internal_id.clone(), cluster_id.clone());
        state.clusters.insert(
            cluster_id.clone(),
            SimCluster {
                region: request.region.clone(),
                polls: 0,
                state: None,
                node_info: NodeInfo {
                    current_compute_nodes: 3,
                    desired_compute_nodes: 3,
                },
                operator_polls: 0,
                applied: HashMap::new(),
                identity_providers: HashMap::new(),
                delete_polls: None,
            },
        );
        debug!(cluster_id = %cluster_id, internal_id = %request.internal_id, "Simulated cluster requested");
        Ok(cluster_id)
    }

    async fn find_by_internal_id(&self, internal_id: &str) -> Result<Option<String>, ProviderError> {
        simulate(&self.faults, "find_by_internal_id").await?;
        Ok(lock(&self.state).by_internal_id.get(internal_id).cloned())
    }

    async fn get_status(&self, cluster_id: &str) -> Result<ProviderClusterStatus, ProviderError> {
        simulate(&self.faults, "get_status").await?;

        let ready_after = self.polls_until_ready;
        self.with_cluster(cluster_id, |cluster| {
            cluster.polls += 1;
            let state = match &cluster.state {
                Some(forced) => forced.clone(),
                None if cluster.polls >= ready_after => ProviderClusterState::Ready,
                None if cluster.polls * 2 >= ready_after => ProviderClusterState::Installing,
                None => ProviderClusterState::Pending,
            };
            let ready = state == ProviderClusterState::Ready;
            ProviderClusterStatus {
                dns: ready.then(|| format!("{cluster_id}.{}.sim.example.com", cluster.region)),
                external_id: ready.then(|| format!("ext-{cluster_id}")),
                node_info: Some(cluster.node_info),
                state,
            }
        })
    }

    async fn delete(&self, cluster_id: &str) -> Result<bool, ProviderError> {
        simulate(&self.faults, "delete").await?;

        let mut state = lock(&self.state);
        if state.deleted.contains(cluster_id) {
            return Ok(true);
        }
        let Some(cluster) = state.clusters.get_mut(cluster_id) else {
            return Ok(true);
        };

        let polls = cluster.delete_polls.get_or_insert(0);
        *polls += 1;
        if *polls < self.polls_until_deleted {
            return Ok(false);
        }

        state.clusters.remove(cluster_id);
        state.by_internal_id.retain(|_, id| id != cluster_id);
        state.deleted.insert(cluster_id.to_string());
        Ok(true)
    }

    async fn apply_resources(&self, cluster_id: &str, resources: &ResourceSet) -> Result<(), ProviderError> {
        simulate(&self.faults, "apply_resources").await?;
        self.with_cluster(cluster_id, |cluster| {
            *cluster.applied.entry(resources.name.clone()).or_insert(0) += 1;
        })
    }

    async fn install_operator(&self, cluster_id: &str) -> Result<bool, ProviderError> {
        simulate(&self.faults, "install_operator").await?;
        let ready_after = self.polls_until_operator_ready;
        self.with_cluster(cluster_id, |cluster| {
            cluster.operator_polls += 1;
            cluster.operator_polls >= ready_after
        })
    }

    async fn create_identity_provider(
        &self,
        cluster_id: &str,
        spec: &IdentityProviderSpec,
    ) -> Result<String, ProviderError> {
        simulate(&self.faults, "create_identity_provider").await?;
        self.with_cluster(cluster_id, |cluster| {
            let next = cluster.identity_providers.len() + 1;
            cluster
                .identity_providers
                .entry(spec.name.clone())
                .or_insert_with(|| format!("idp-{cluster_id}-{next}"))
                .clone()
        })
    }
}

/// SSO server keeping clients in memory.
#[derive(Debug, Default)]
pub struct SimulatedIdentityProvider {
    clients: Mutex<HashMap<String, (String, String)>>,
    faults: Mutex<Faults>,
}

impl SimulatedIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fault_controls!();

    pub fn has_client(&self, client_id: &str) -> bool {
        lock(&self.clients).contains_key(client_id)
    }

    pub fn redirect_uri(&self, client_id: &str) -> Option<String> {
        lock(&self.clients).get(client_id).map(|(_, uri)| uri.clone())
    }
}

#[async_trait]
impl IdentityProvider for SimulatedIdentityProvider {
    fn issuer_uri(&self) -> String {
        "https://sso.sim.example.com/auth/realms/kfm".to_string()
    }

    async fn register_client(&self, client_id: &str, redirect_uri: &str) -> Result<String, ProviderError> {
        simulate(&self.faults, "register_client").await?;
        let mut clients = lock(&self.clients);
        let (secret, _) = clients
            .entry(client_id.to_string())
            .or_insert_with(|| (format!("secret-{client_id}"), redirect_uri.to_string()));
        Ok(secret.clone())
    }

    async fn deregister_client(&self, client_id: &str) -> Result<(), ProviderError> {
        simulate(&self.faults, "deregister_client").await?;
        lock(&self.clients).remove(client_id);
        Ok(())
    }
}

/// Fleet-shard channel that reports the agent ready after a fixed number of
/// provision calls.
#[derive(Debug)]
pub struct SimulatedFleetShard {
    calls_until_ready: u32,
    provisioned: Mutex<HashMap<String, u32>>,
    faults: Mutex<Faults>,
}

impl Default for SimulatedFleetShard {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedFleetShard {
    pub fn new(calls_until_ready: u32) -> Self {
        Self {
            calls_until_ready,
            provisioned: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    fault_controls!();

    /// True while a service account exists for `cluster_id`.
    pub fn has_service_account(&self, cluster_id: &str) -> bool {
        lock(&self.provisioned).contains_key(cluster_id)
    }
}

#[async_trait]
impl FleetShardClient for SimulatedFleetShard {
    async fn provision(&self, cluster_id: &str) -> Result<bool, ProviderError> {
        simulate(&self.faults, "provision").await?;
        let mut provisioned = lock(&self.provisioned);
        let calls = provisioned.entry(cluster_id.to_string()).or_insert(0);
        *calls += 1;
        Ok(*calls >= self.calls_until_ready)
    }

    async fn remove_service_account(&self, cluster_id: &str) -> Result<(), ProviderError> {
        simulate(&self.faults, "remove_service_account").await?;
        lock(&self.provisioned).remove(cluster_id);
        Ok(())
    }

    async fn reconcile_parameters(&self, _cluster_id: &str) -> Result<(), ProviderError> {
        simulate(&self.faults, "reconcile_parameters").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(internal_id: &str) -> ClusterRequest {
        ClusterRequest {
            internal_id: internal_id.into(),
            cloud_provider: "aws".into(),
            region: "us-east-1".into(),
            multi_az: true,
        }
    }

    #[tokio::test]
    async fn test_create_is_keyed_by_internal_id() {
        let provider = SimulatedClusterProvider::default();
        let a = provider.create(&request("cl_1")).await.unwrap();
        let again = provider.create(&request("cl_1")).await.unwrap();
        let b = provider.create(&request("cl_2")).await.unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(provider.cluster_count(), 2);
        assert_eq!(provider.calls("create"), 3);
    }

    #[tokio::test]
    async fn test_find_by_internal_id_until_deleted() {
        let provider = SimulatedClusterProvider::default();
        assert_eq!(provider.find_by_internal_id("cl_1").await.unwrap(), None);

        let id = provider.create(&request("cl_1")).await.unwrap();
        assert_eq!(
            provider.find_by_internal_id("cl_1").await.unwrap().as_deref(),
            Some(id.as_str())
        );

        assert!(provider.delete(&id).await.unwrap());
        assert_eq!(provider.find_by_internal_id("cl_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_progresses_to_ready() {
        let provider = SimulatedClusterProvider::new(3, 1, 1);
        let id = provider.create(&request("cl_1")).await.unwrap();

        let first = provider.get_status(&id).await.unwrap();
        assert_eq!(first.state, ProviderClusterState::Pending);
        assert!(first.dns.is_none());

        provider.get_status(&id).await.unwrap();
        let third = provider.get_status(&id).await.unwrap();
        assert_eq!(third.state, ProviderClusterState::Ready);
        assert!(third.dns.is_some());
    }

    #[tokio::test]
    async fn test_register_client_returns_existing_secret() {
        let idp = SimulatedIdentityProvider::new();
        let first = idp.register_client("kfm-cl_1", "https://a").await.unwrap();
        let second = idp.register_client("kfm-cl_1", "https://b").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(idp.redirect_uri("kfm-cl_1").as_deref(), Some("https://a"));
    }

    #[tokio::test]
    async fn test_failure_switch() {
        let fleetshard = SimulatedFleetShard::default();
        fleetshard.fail("provision");
        assert!(fleetshard.provision("sim-0001").await.is_err());
        fleetshard.recover("provision");
        assert!(fleetshard.provision("sim-0001").await.unwrap());
        assert_eq!(fleetshard.calls("provision"), 2);
    }
}

//! Cluster reconciler.
//!
//! One pass runs a fixed pipeline of sub-tasks. Each sub-task lists the
//! clusters currently in one status and tries to move every one of them a
//! single step forward:
//!
//! 1. Desired state: create rows for missing clusters and mark removed or
//!    surplus empty clusters for deprovisioning.
//! 2. `Accepted`: request the cluster from the provider.
//! 3. `Provisioning`: poll the provider until the cluster is ready or failed.
//! 4. `Provisioned`: DNS, identity provider, baseline resources, operator and
//!    fleet-shard agent. Every step checks persisted state first, so a pass
//!    cut short anywhere resumes without repeating finished work.
//! 5. `WaitingForOperator`: watch the provider for a failed cluster.
//! 6. Active (`Ready`, `ComputeScalingUp`, `Full`): resource drift, instance
//!    types, agent parameters, capacity, compute nodes, empty-cluster check.
//! 7. `Deprovisioning`: delete at the provider (or keep a region's last cluster).
//! 8. `Cleanup`: remove the SSO client and agent account, then soft delete.
//!
//! `WaitingForOperator -> Ready` is reported by the fleet-shard agent through
//! [`ClusterService::update_status`]. A provider that reports a cluster failed
//! moves it to `Failed` from any in-progress status.
//!
//! A failing entity never stops the pass. Its error is recorded and the row
//! keeps its status for the next pass.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kfm_id::ClusterId;
use kfm_reconcile::PassErrors;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::resources::baseline_resources;
use super::{Cluster, ClusterService, ClusterStatus, FindClusterCriteria};
use crate::config::{DataPlaneConfig, ScalingMode};
use crate::db::DbError;
use crate::instances::InstanceStore;
use crate::providers::{
    with_timeout, ClusterRequest, Collaborators, IdentityProviderSpec, ProviderClusterState,
    ProviderClusterStatus, ProviderError,
};
use crate::workers::{Worker, WorkerKind};

/// Name of the identity provider attached to every cluster.
pub const IDENTITY_PROVIDER_NAME: &str = "kfm-sso";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cluster {0} has no provider cluster id")]
    MissingClusterId(ClusterId),

    #[error("cluster {0} has no DNS name yet")]
    MissingDns(ClusterId),

    #[error("provider reports cluster {id} failed: {reason}")]
    ProviderFailed { id: ClusterId, reason: String },
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    pub interval: Duration,
    pub call_timeout: Duration,
    pub dataplane: DataPlaneConfig,
}

pub struct ClusterManager {
    clusters: Arc<dyn ClusterService>,
    instances: Arc<dyn InstanceStore>,
    collaborators: Collaborators,
    config: ClusterManagerConfig,
}

impl ClusterManager {
    pub fn new(
        clusters: Arc<dyn ClusterService>,
        instances: Arc<dyn InstanceStore>,
        collaborators: Collaborators,
        config: ClusterManagerConfig,
    ) -> Self {
        Self {
            clusters,
            instances,
            collaborators,
            config,
        }
    }

    /// Run every sub-task once.
    #[instrument(skip_all)]
    pub async fn reconcile_all(&self) -> PassErrors {
        let mut errors = PassErrors::new();

        errors.extend(self.reconcile_desired_state().await);

        for cluster in self.list("accepted", ClusterStatus::Accepted, &mut errors).await {
            let subject = Some(cluster.id.to_string());
            errors.record("accepted", subject, self.reconcile_accepted(cluster).await);
        }

        for cluster in self.list("provisioning", ClusterStatus::Provisioning, &mut errors).await {
            let subject = Some(cluster.id.to_string());
            errors.record("provisioning", subject, self.reconcile_provisioning(cluster).await);
        }

        for cluster in self.list("provisioned", ClusterStatus::Provisioned, &mut errors).await {
            let subject = Some(cluster.id.to_string());
            errors.record("provisioned", subject, self.reconcile_provisioned(cluster).await);
        }

        for cluster in self
            .list("waiting_for_operator", ClusterStatus::WaitingForOperator, &mut errors)
            .await
        {
            let subject = Some(cluster.id.to_string());
            errors.record(
                "waiting_for_operator",
                subject,
                self.reconcile_waiting_for_operator(cluster).await,
            );
        }

        errors.extend(self.reconcile_active().await);

        for cluster in self.list("deprovisioning", ClusterStatus::Deprovisioning, &mut errors).await {
            let subject = Some(cluster.id.to_string());
            errors.record("deprovisioning", subject, self.reconcile_deprovisioning(cluster).await);
        }

        for cluster in self.list("cleanup", ClusterStatus::Cleanup, &mut errors).await {
            let subject = Some(cluster.id.to_string());
            errors.record("cleanup", subject, self.reconcile_cleanup(cluster).await);
        }

        errors
    }

    async fn list(
        &self,
        step: &'static str,
        status: ClusterStatus,
        errors: &mut PassErrors,
    ) -> Vec<Cluster> {
        errors
            .record(step, None, self.clusters.list_by_status(status).await)
            .unwrap_or_default()
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        with_timeout(operation, self.config.call_timeout, fut).await
    }

    async fn transition(&self, cluster: &Cluster, to: ClusterStatus) -> ClusterResult<()> {
        self.clusters.update_status(&cluster.id, to).await?;
        info!(
            cluster_id = %cluster.id,
            from = %cluster.status,
            to = %to,
            "Cluster status changed"
        );
        Ok(())
    }

    fn scaling_mode(&self) -> ScalingMode {
        self.config.dataplane.scaling_mode()
    }

    // -------------------------------------------------------------------------
    // Desired state
    // -------------------------------------------------------------------------

    async fn reconcile_desired_state(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "desired_state";

        let mode = self.scaling_mode();
        if mode == ScalingMode::None {
            return errors;
        }

        let Some(existing) = errors.record(step, None, self.clusters.list_all().await) else {
            return errors;
        };
        let Some(hosted) = errors.record(step, None, self.instances.count_by_cluster().await) else {
            return errors;
        };

        match mode {
            ScalingMode::Manual => self.diff_manual(&existing, &hosted, &mut errors).await,
            ScalingMode::Auto => self.diff_auto(&existing, &hosted, &mut errors).await,
            ScalingMode::None => {}
        }
        errors
    }

    async fn diff_manual(
        &self,
        existing: &[Cluster],
        hosted: &HashMap<ClusterId, i64>,
        errors: &mut PassErrors,
    ) {
        let step = "desired_state";

        for configured in &self.config.dataplane.clusters {
            let subject = Some(configured.cluster_id.clone());
            let current = existing
                .iter()
                .find(|c| c.cluster_id.as_deref() == Some(configured.cluster_id.as_str()));

            match current {
                None => {
                    let mut cluster = Cluster::accepted(
                        &configured.cloud_provider,
                        &configured.region,
                        configured.multi_az,
                        configured.instance_limit,
                    )
                    .with_status(configured.status);
                    cluster.cluster_id = Some(configured.cluster_id.clone());
                    cluster.schedulable = configured.schedulable;
                    cluster.supported_instance_type = configured.supported_instance_type.clone();

                    if errors
                        .record(step, subject, self.clusters.create(&cluster).await)
                        .is_some()
                    {
                        info!(
                            cluster_id = %cluster.id,
                            provider_cluster_id = %configured.cluster_id,
                            status = %cluster.status,
                            "Registered configured cluster"
                        );
                    }
                }
                Some(current) => {
                    let mut updated = current.clone();
                    updated.schedulable = configured.schedulable;
                    updated.instance_limit = configured.instance_limit;
                    updated.supported_instance_type = configured.supported_instance_type.clone();
                    if updated != *current {
                        errors.record(step, subject, self.clusters.update(&updated).await);
                    }
                }
            }
        }

        let configured: HashSet<&str> = self
            .config
            .dataplane
            .clusters
            .iter()
            .map(|c| c.cluster_id.as_str())
            .collect();

        for cluster in existing.iter().filter(|c| !c.status.is_terminating()) {
            let listed = cluster
                .cluster_id
                .as_deref()
                .is_some_and(|id| configured.contains(id));
            if listed {
                continue;
            }
            self.remove_if_empty(cluster, hosted, errors).await;
        }
    }

    async fn diff_auto(
        &self,
        existing: &[Cluster],
        hosted: &HashMap<ClusterId, i64>,
        errors: &mut PassErrors,
    ) {
        let step = "desired_state";

        // A deprovisioning cluster still covers its region: if it is the
        // last one there it reverts to Ready instead of being replaced.
        let covering: Vec<&Cluster> = existing
            .iter()
            .filter(|c| !matches!(c.status, ClusterStatus::Failed | ClusterStatus::Cleanup))
            .collect();

        for provider in &self.config.dataplane.providers {
            for region in &provider.regions {
                let covered = covering
                    .iter()
                    .any(|c| c.cloud_provider == provider.name && c.region == region.name);
                if covered {
                    continue;
                }

                let mut cluster =
                    Cluster::accepted(&provider.name, &region.name, true, region.instance_limit);
                cluster.supported_instance_type = provider.supported_instance_type.clone();

                let subject = Some(format!("{}/{}", provider.name, region.name));
                if errors
                    .record(step, subject, self.clusters.create(&cluster).await)
                    .is_some()
                {
                    info!(
                        cluster_id = %cluster.id,
                        cloud_provider = %provider.name,
                        region = %region.name,
                        "Accepted cluster for uncovered region"
                    );
                }
            }
        }

        for cluster in existing.iter().filter(|c| !c.status.is_terminating()) {
            if self
                .config
                .dataplane
                .region(&cluster.cloud_provider, &cluster.region)
                .is_none()
            {
                self.remove_if_empty(cluster, hosted, errors).await;
            }
        }
    }

    /// Deprovision a cluster the config no longer wants, if nothing runs on it.
    async fn remove_if_empty(
        &self,
        cluster: &Cluster,
        hosted: &HashMap<ClusterId, i64>,
        errors: &mut PassErrors,
    ) {
        let count = hosted.get(&cluster.id).copied().unwrap_or(0);
        if count > 0 {
            warn!(
                cluster_id = %cluster.id,
                hosted = count,
                "Cluster removed from config still hosts instances; keeping it"
            );
            return;
        }
        if !cluster.status.can_transition_to(ClusterStatus::Deprovisioning) {
            debug!(
                cluster_id = %cluster.id,
                status = %cluster.status,
                "Cluster removed from config is mid-provisioning; deferring removal"
            );
            return;
        }
        errors.record(
            "desired_state",
            Some(cluster.id.to_string()),
            self.transition(cluster, ClusterStatus::Deprovisioning).await,
        );
    }

    // -------------------------------------------------------------------------
    // Provisioning pipeline
    // -------------------------------------------------------------------------

    async fn reconcile_accepted(&self, mut cluster: Cluster) -> ClusterResult<()> {
        if cluster.cluster_id.is_none() {
            let request = ClusterRequest {
                internal_id: cluster.id.to_string(),
                cloud_provider: cluster.cloud_provider.clone(),
                region: cluster.region.clone(),
                multi_az: cluster.multi_az,
            };
            let provider = &self.collaborators.provider;
            let cluster_id = self.call("create", provider.create(&request)).await?;

            cluster.cluster_id = Some(cluster_id);
            self.clusters.update(&cluster).await?;
        }

        self.transition(&cluster, ClusterStatus::Provisioning).await
    }

    /// Poll the provider for an in-progress cluster. A cluster the provider
    /// reports failed is moved to `Failed` and `None` is returned.
    async fn poll_in_progress(
        &self,
        cluster: &Cluster,
        cluster_id: &str,
    ) -> ClusterResult<Option<ProviderClusterStatus>> {
        let provider = &self.collaborators.provider;
        let status = self.call("get_status", provider.get_status(cluster_id)).await?;

        if let ProviderClusterState::Failed(reason) = &status.state {
            warn!(cluster_id = %cluster.id, reason = %reason, "Provider reported cluster failure");
            self.transition(cluster, ClusterStatus::Failed).await?;
            return Ok(None);
        }
        Ok(Some(status))
    }

    async fn reconcile_provisioning(&self, mut cluster: Cluster) -> ClusterResult<()> {
        let cluster_id = provider_id(&cluster)?;
        let Some(status) = self.poll_in_progress(&cluster, &cluster_id).await? else {
            return Ok(());
        };

        if status.state != ProviderClusterState::Ready {
            debug!(cluster_id = %cluster.id, state = ?status.state, "Cluster still provisioning");
            return Ok(());
        }

        cluster.external_id = status.external_id.or(cluster.external_id.take());
        cluster.cluster_dns = status.dns.or(cluster.cluster_dns.take());
        self.clusters.update(&cluster).await?;
        self.transition(&cluster, ClusterStatus::Provisioned).await
    }

    async fn reconcile_provisioned(&self, mut cluster: Cluster) -> ClusterResult<()> {
        let cluster_id = provider_id(&cluster)?;
        let provider = &self.collaborators.provider;

        let Some(status) = self.poll_in_progress(&cluster, &cluster_id).await? else {
            return Ok(());
        };
        if cluster.cluster_dns.is_none() {
            let dns = status.dns.ok_or(ClusterError::MissingDns(cluster.id))?;
            cluster.cluster_dns = Some(dns);
            self.clusters.update(&cluster).await?;
        }

        if cluster.identity_provider_id.is_none() {
            let idp_id = self.register_identity_provider(&cluster, &cluster_id).await?;
            cluster.identity_provider_id = Some(idp_id);
            self.clusters.update(&cluster).await?;
        }

        self.apply_resources_if_changed(&mut cluster).await?;

        let operator_ready = self
            .call("install_operator", provider.install_operator(&cluster_id))
            .await?;
        let fleetshard = &self.collaborators.fleetshard;
        let agent_ready = self
            .call("provision", fleetshard.provision(&cluster_id))
            .await?;

        if operator_ready && agent_ready {
            self.transition(&cluster, ClusterStatus::WaitingForOperator).await
        } else {
            debug!(
                cluster_id = %cluster.id,
                operator_ready,
                agent_ready,
                "Waiting for operator and agent installation"
            );
            Ok(())
        }
    }

    /// The agent reports readiness itself; only a provider failure is acted on here.
    async fn reconcile_waiting_for_operator(&self, cluster: Cluster) -> ClusterResult<()> {
        let cluster_id = provider_id(&cluster)?;
        self.poll_in_progress(&cluster, &cluster_id).await?;
        Ok(())
    }

    async fn register_identity_provider(
        &self,
        cluster: &Cluster,
        cluster_id: &str,
    ) -> ClusterResult<String> {
        let dns = cluster
            .cluster_dns
            .as_deref()
            .ok_or(ClusterError::MissingDns(cluster.id))?;
        let client_id = client_id(cluster);
        let callback = format!(
            "https://oauth-openshift.apps.{dns}/oauth2callback/{IDENTITY_PROVIDER_NAME}"
        );

        let identity = &self.collaborators.identity;
        let client_secret = self
            .call("register_client", identity.register_client(&client_id, &callback))
            .await?;

        let spec = IdentityProviderSpec {
            name: IDENTITY_PROVIDER_NAME.to_string(),
            client_id,
            client_secret,
            issuer: identity.issuer_uri(),
        };
        let provider = &self.collaborators.provider;
        let idp_id = self
            .call(
                "create_identity_provider",
                provider.create_identity_provider(cluster_id, &spec),
            )
            .await?;

        info!(cluster_id = %cluster.id, identity_provider_id = %idp_id, "Identity provider attached");
        Ok(idp_id)
    }

    /// Apply the baseline set unless the stored hash already matches.
    /// Returns true if resources were applied.
    async fn apply_resources_if_changed(&self, cluster: &mut Cluster) -> ClusterResult<bool> {
        let cluster_id = provider_id(cluster)?;
        let desired = baseline_resources(cluster, &self.config.dataplane.resources);
        let hash = desired.hash();

        if cluster.resources_hash.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        let provider = &self.collaborators.provider;
        self.call("apply_resources", provider.apply_resources(&cluster_id, &desired))
            .await?;

        cluster.resources_hash = Some(hash.to_string());
        self.clusters.update(cluster).await?;
        debug!(cluster_id = %cluster.id, resources_hash = %hash, "Baseline resources applied");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Active clusters
    // -------------------------------------------------------------------------

    async fn reconcile_active(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "active";

        let mut active = Vec::new();
        for status in ClusterStatus::ACTIVE {
            active.extend(self.list(step, status, &mut errors).await);
        }
        if active.is_empty() {
            return errors;
        }

        let Some(hosted) = errors.record(step, None, self.instances.count_by_cluster().await) else {
            return errors;
        };

        for cluster in active {
            self.reconcile_active_cluster(cluster, &hosted, &mut errors).await;
        }
        errors
    }

    async fn reconcile_active_cluster(
        &self,
        mut cluster: Cluster,
        hosted: &HashMap<ClusterId, i64>,
        errors: &mut PassErrors,
    ) {
        let step = "active";
        let id = cluster.id;
        let subject = move || Some(id.to_string());

        let cluster_id = match provider_id(&cluster) {
            Ok(id) => id,
            Err(e) => {
                errors.push(step, subject(), e);
                return;
            }
        };

        errors.record(step, subject(), self.apply_resources_if_changed(&mut cluster).await);

        let configured_types = self
            .config
            .dataplane
            .supported_instance_type(Some(cluster_id.as_str()), &cluster.cloud_provider)
            .map(str::to_string);
        if let Some(types) = configured_types {
            if types != cluster.supported_instance_type {
                cluster.supported_instance_type = types;
                errors.record(step, subject(), self.clusters.update(&cluster).await);
            }
        }

        let fleetshard = &self.collaborators.fleetshard;
        errors.record(
            step,
            subject(),
            self.call("reconcile_parameters", fleetshard.reconcile_parameters(&cluster_id))
                .await,
        );

        let count = hosted.get(&cluster.id).copied().unwrap_or(0);
        let provider = &self.collaborators.provider;
        let status = errors.record(
            step,
            subject(),
            self.call("get_status", provider.get_status(&cluster_id)).await,
        );
        if let Some(ProviderClusterState::Failed(reason)) = status.as_ref().map(|s| &s.state) {
            // Hosted instances keep running on what is left; an operator decides.
            warn!(
                cluster_id = %cluster.id,
                status = %cluster.status,
                reason = %reason,
                "Provider reports an active cluster failed"
            );
            errors.push(
                step,
                subject(),
                ClusterError::ProviderFailed {
                    id: cluster.id,
                    reason: reason.clone(),
                },
            );
        }
        let node_info = status.and_then(|status| status.node_info);

        let scaling_up = match node_info {
            Some(nodes) => nodes.is_scaling_up(),
            // Unknown node state: keep a scaling cluster where it is.
            None => cluster.status == ClusterStatus::ComputeScalingUp,
        };
        let target = if scaling_up {
            ClusterStatus::ComputeScalingUp
        } else if count >= i64::from(cluster.instance_limit) {
            ClusterStatus::Full
        } else {
            ClusterStatus::Ready
        };

        if target != cluster.status {
            if errors
                .record(step, subject(), self.transition(&cluster, target).await)
                .is_none()
            {
                return;
            }
            cluster.status = target;
        }

        if self.scaling_mode() == ScalingMode::Auto
            && cluster.status == ClusterStatus::Ready
            && count == 0
        {
            errors.record(
                step,
                subject(),
                self.remove_surplus_empty(&cluster, hosted).await,
            );
        }
    }

    /// Deprovision an empty cluster when another `Ready` cluster in the same
    /// provider, region and availability layout still has room. Siblings are re-read so two empty
    /// clusters never remove each other in the same pass.
    async fn remove_surplus_empty(
        &self,
        cluster: &Cluster,
        hosted: &HashMap<ClusterId, i64>,
    ) -> ClusterResult<()> {
        let criteria = FindClusterCriteria {
            multi_az: Some(cluster.multi_az),
            ..FindClusterCriteria::placement(
                &cluster.cloud_provider,
                &cluster.region,
                ClusterStatus::Ready,
            )
        };
        let siblings = self.clusters.find_all(&criteria).await?;

        let spare = siblings.iter().any(|sibling| {
            sibling.id != cluster.id
                && sibling.schedulable
                && hosted.get(&sibling.id).copied().unwrap_or(0) < i64::from(sibling.instance_limit)
        });
        if !spare {
            return Ok(());
        }

        info!(cluster_id = %cluster.id, "Empty cluster has a sibling with capacity; deprovisioning");
        self.transition(cluster, ClusterStatus::Deprovisioning).await
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    async fn reconcile_deprovisioning(&self, mut cluster: Cluster) -> ClusterResult<()> {
        if self.is_last_in_region(&cluster).await? {
            info!(
                cluster_id = %cluster.id,
                region = %cluster.region,
                "Last cluster in region; keeping it"
            );
            return self.transition(&cluster, ClusterStatus::Ready).await;
        }

        let provider = &self.collaborators.provider;
        if cluster.cluster_id.is_none() {
            // Created at the provider, but the id never made it to the row.
            let internal_id = cluster.id.to_string();
            let found = self
                .call("find_by_internal_id", provider.find_by_internal_id(&internal_id))
                .await?;
            if let Some(cluster_id) = found {
                info!(cluster_id = %cluster.id, provider_cluster_id = %cluster_id, "Recovered provider cluster id");
                cluster.cluster_id = Some(cluster_id);
                self.clusters.update(&cluster).await?;
            }
        }

        if let Some(cluster_id) = &cluster.cluster_id {
            let deleted = self.call("delete", provider.delete(cluster_id)).await?;
            if !deleted {
                debug!(cluster_id = %cluster.id, "Provider deletion in progress");
                return Ok(());
            }
        }

        self.transition(&cluster, ClusterStatus::Cleanup).await
    }

    /// Auto mode keeps one cluster per configured region. Only clusters that
    /// reached an active status once (they have DNS) are kept.
    async fn is_last_in_region(&self, cluster: &Cluster) -> ClusterResult<bool> {
        if self.scaling_mode() != ScalingMode::Auto || cluster.cluster_dns.is_none() {
            return Ok(false);
        }
        if self
            .config
            .dataplane
            .region(&cluster.cloud_provider, &cluster.region)
            .is_none()
        {
            return Ok(false);
        }

        let criteria = FindClusterCriteria {
            cloud_provider: Some(cluster.cloud_provider.clone()),
            region: Some(cluster.region.clone()),
            ..Default::default()
        };
        let others = self
            .clusters
            .find_all(&criteria)
            .await?
            .into_iter()
            .filter(|c| c.id != cluster.id && c.status.is_active())
            .count();
        Ok(others == 0)
    }

    async fn reconcile_cleanup(&self, cluster: Cluster) -> ClusterResult<()> {
        let identity = &self.collaborators.identity;
        self.call("deregister_client", identity.deregister_client(&client_id(&cluster)))
            .await?;

        if let Some(cluster_id) = &cluster.cluster_id {
            let fleetshard = &self.collaborators.fleetshard;
            self.call(
                "remove_service_account",
                fleetshard.remove_service_account(cluster_id),
            )
            .await?;
        }

        self.clusters.delete(&cluster.id).await?;
        info!(cluster_id = %cluster.id, "Cluster removed");
        Ok(())
    }
}

#[async_trait]
impl Worker for ClusterManager {
    fn kind(&self) -> &'static str {
        WorkerKind::Cluster.as_str()
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn reconcile(&self) -> PassErrors {
        self.reconcile_all().await
    }
}

fn provider_id(cluster: &Cluster) -> ClusterResult<String> {
    cluster
        .cluster_id
        .clone()
        .ok_or(ClusterError::MissingClusterId(cluster.id))
}

/// SSO client id for a cluster; stable across retries.
fn client_id(cluster: &Cluster) -> String {
    format!("kfm-{}", cluster.id)
}

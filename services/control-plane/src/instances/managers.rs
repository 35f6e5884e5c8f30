//! Instance reconcilers, one worker kind per lifecycle phase.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kfm_id::{ClusterId, InstanceId};
use kfm_reconcile::{Clock, PassErrors};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{Instance, InstanceStatus, InstanceStore};
use crate::clusters::{Cluster, ClusterService, ClusterStatus, FindClusterCriteria};
use crate::db::DbError;
use crate::workers::{Worker, WorkerKind};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("instance {0} is not placed on a cluster")]
    NotPlaced(InstanceId),

    #[error("hosting cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("hosting cluster {0} has no DNS name yet")]
    ClusterWithoutDns(ClusterId),
}

pub type InstanceResult<T> = Result<T, InstanceError>;

/// Lifecycle phase an [`InstanceManager`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    /// Place on a cluster.
    Accepted,
    /// Derive connection details from the hosting cluster.
    Preparing,
    /// Time out instances the agent never reports ready.
    Provisioning,
    /// Fail instances whose cluster disappeared.
    Ready,
    /// Finish deprovisioning and remove rows.
    Deleting,
}

impl InstancePhase {
    pub const ALL: [InstancePhase; 5] = [
        Self::Accepted,
        Self::Preparing,
        Self::Provisioning,
        Self::Ready,
        Self::Deleting,
    ];

    pub const fn worker_kind(&self) -> WorkerKind {
        match self {
            Self::Accepted => WorkerKind::AcceptedInstance,
            Self::Preparing => WorkerKind::PreparingInstance,
            Self::Provisioning => WorkerKind::ProvisioningInstance,
            Self::Ready => WorkerKind::ReadyInstance,
            Self::Deleting => WorkerKind::DeletingInstance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceManagerConfig {
    pub interval: Duration,
    pub accepted_timeout: Duration,
    pub provisioning_timeout: Duration,
}

pub struct InstanceManager {
    phase: InstancePhase,
    instances: Arc<dyn InstanceStore>,
    clusters: Arc<dyn ClusterService>,
    clock: Arc<dyn Clock>,
    config: InstanceManagerConfig,
}

impl InstanceManager {
    pub fn new(
        phase: InstancePhase,
        instances: Arc<dyn InstanceStore>,
        clusters: Arc<dyn ClusterService>,
        clock: Arc<dyn Clock>,
        config: InstanceManagerConfig,
    ) -> Self {
        Self {
            phase,
            instances,
            clusters,
            clock,
            config,
        }
    }

    /// One manager per phase, sharing stores and clock.
    pub fn all_phases(
        instances: Arc<dyn InstanceStore>,
        clusters: Arc<dyn ClusterService>,
        clock: Arc<dyn Clock>,
        config: InstanceManagerConfig,
    ) -> Vec<InstanceManager> {
        InstancePhase::ALL
            .into_iter()
            .map(|phase| {
                Self::new(
                    phase,
                    Arc::clone(&instances),
                    Arc::clone(&clusters),
                    Arc::clone(&clock),
                    config,
                )
            })
            .collect()
    }

    pub fn phase(&self) -> InstancePhase {
        self.phase
    }

    #[instrument(skip_all, fields(phase = ?self.phase))]
    pub async fn reconcile_all(&self) -> PassErrors {
        match self.phase {
            InstancePhase::Accepted => self.reconcile_accepted().await,
            InstancePhase::Preparing => self.reconcile_preparing().await,
            InstancePhase::Provisioning => self.reconcile_provisioning().await,
            InstancePhase::Ready => self.reconcile_ready().await,
            InstancePhase::Deleting => self.reconcile_deleting().await,
        }
    }

    async fn list(
        &self,
        step: &'static str,
        status: InstanceStatus,
        errors: &mut PassErrors,
    ) -> Vec<Instance> {
        errors
            .record(step, None, self.instances.list_by_status(status).await)
            .unwrap_or_default()
    }

    fn timed_out(&self, instance: &Instance, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        instance.age(self.clock.now()) > timeout
    }

    async fn fail(&self, instance: &Instance, reason: &str) -> InstanceResult<()> {
        self.instances.fail(&instance.id, reason).await?;
        warn!(instance_id = %instance.id, reason, "Instance failed");
        Ok(())
    }

    async fn reconcile_accepted(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "accepted_instance";

        let accepted = self.list(step, InstanceStatus::Accepted, &mut errors).await;
        if accepted.is_empty() {
            return errors;
        }

        let Some(mut hosted) = errors.record(step, None, self.instances.count_by_cluster().await) else {
            return errors;
        };
        let criteria = FindClusterCriteria {
            status: Some(ClusterStatus::Ready),
            schedulable: Some(true),
            ..Default::default()
        };
        let Some(ready) = errors.record(step, None, self.clusters.find_all(&criteria).await) else {
            return errors;
        };

        for instance in accepted {
            let subject = Some(instance.id.to_string());
            let result = self.place(instance, &ready, &mut hosted).await;
            errors.record(step, subject, result);
        }
        errors
    }

    /// Place on the least-loaded matching cluster, counting placements made
    /// earlier in the same pass.
    async fn place(
        &self,
        mut instance: Instance,
        ready: &[Cluster],
        hosted: &mut HashMap<ClusterId, i64>,
    ) -> InstanceResult<()> {
        let load = |cluster: &Cluster| hosted.get(&cluster.id).copied().unwrap_or(0);

        let target = ready
            .iter()
            .filter(|c| {
                c.cloud_provider == instance.cloud_provider
                    && c.region == instance.region
                    && c.multi_az == instance.multi_az
                    && c.supports_instance_type(&instance.instance_type)
                    && load(c) < i64::from(c.instance_limit)
            })
            .min_by_key(|c| (load(c), c.created_at))
            .map(|c| c.id);

        let Some(cluster_id) = target else {
            if self.timed_out(&instance, self.config.accepted_timeout) {
                let reason = format!(
                    "no cluster with capacity for {} instances in {}/{}",
                    instance.instance_type, instance.cloud_provider, instance.region
                );
                return self.fail(&instance, &reason).await;
            }
            debug!(instance_id = %instance.id, "No cluster with capacity yet");
            return Ok(());
        };

        instance.cluster_id = Some(cluster_id);
        self.instances.update(&instance).await?;
        self.instances
            .update_status(&instance.id, InstanceStatus::Preparing)
            .await?;
        *hosted.entry(cluster_id).or_insert(0) += 1;

        info!(instance_id = %instance.id, cluster_id = %cluster_id, "Instance placed");
        Ok(())
    }

    async fn reconcile_preparing(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "preparing_instance";

        for instance in self.list(step, InstanceStatus::Preparing, &mut errors).await {
            let subject = Some(instance.id.to_string());
            errors.record(step, subject, self.prepare(instance).await);
        }
        errors
    }

    async fn prepare(&self, mut instance: Instance) -> InstanceResult<()> {
        let cluster_id = instance
            .cluster_id
            .ok_or(InstanceError::NotPlaced(instance.id))?;
        let cluster = self
            .clusters
            .get(&cluster_id)
            .await?
            .ok_or(InstanceError::ClusterNotFound(cluster_id))?;
        let dns = cluster
            .cluster_dns
            .ok_or(InstanceError::ClusterWithoutDns(cluster_id))?;

        if instance.bootstrap_server_host.is_none() {
            instance.bootstrap_server_host = Some(bootstrap_host(&instance, &dns));
            self.instances.update(&instance).await?;
        }
        self.instances
            .update_status(&instance.id, InstanceStatus::Provisioning)
            .await?;
        debug!(instance_id = %instance.id, "Instance prepared");
        Ok(())
    }

    async fn reconcile_provisioning(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "provisioning_instance";

        for instance in self.list(step, InstanceStatus::Provisioning, &mut errors).await {
            if self.timed_out(&instance, self.config.provisioning_timeout) {
                let subject = Some(instance.id.to_string());
                let reason = "instance was not reported ready in time";
                errors.record(step, subject, self.fail(&instance, reason).await);
            }
        }
        errors
    }

    async fn reconcile_ready(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "ready_instance";

        let ready = self.list(step, InstanceStatus::Ready, &mut errors).await;
        if ready.is_empty() {
            return errors;
        }
        let Some(clusters) = errors.record(step, None, self.clusters.list_all().await) else {
            return errors;
        };
        let status_by_id: HashMap<ClusterId, ClusterStatus> =
            clusters.iter().map(|c| (c.id, c.status)).collect();

        for instance in ready {
            let reason = match instance.cluster_id.map(|id| (id, status_by_id.get(&id))) {
                Some((_, Some(ClusterStatus::Failed))) => "hosting cluster failed",
                Some((_, None)) => "hosting cluster no longer exists",
                None => "ready instance is not placed on a cluster",
                Some((_, Some(_))) => continue,
            };
            let subject = Some(instance.id.to_string());
            errors.record(step, subject, self.fail(&instance, reason).await);
        }
        errors
    }

    async fn reconcile_deleting(&self) -> PassErrors {
        let mut errors = PassErrors::new();
        let step = "deleting_instance";

        for instance in self.list(step, InstanceStatus::Deprovision, &mut errors).await {
            // Placed instances are torn down by the agent, which moves them on.
            if instance.cluster_id.is_some() {
                continue;
            }
            let subject = Some(instance.id.to_string());
            errors.record(
                step,
                subject,
                self.instances
                    .update_status(&instance.id, InstanceStatus::Deleting)
                    .await,
            );
        }

        for instance in self.list(step, InstanceStatus::Deleting, &mut errors).await {
            let subject = Some(instance.id.to_string());
            if errors
                .record(step, subject, self.instances.delete(&instance.id).await)
                .is_some()
            {
                info!(instance_id = %instance.id, "Instance removed");
            }
        }
        errors
    }
}

#[async_trait]
impl Worker for InstanceManager {
    fn kind(&self) -> &'static str {
        self.phase.worker_kind().as_str()
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn reconcile(&self) -> PassErrors {
        self.reconcile_all().await
    }
}

/// `{name}-{ulid}.kafka.{cluster dns}`, lowercased to stay a valid host name.
fn bootstrap_host(instance: &Instance, cluster_dns: &str) -> String {
    format!(
        "{}-{}.kafka.{}",
        instance.name,
        instance.id.ulid(),
        cluster_dns
    )
    .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_host_is_lowercase() {
        let instance = Instance::accepted("Orders", "alice", "org-1", "aws", "us-east-1", "standard");
        let host = bootstrap_host(&instance, "sim-0001.us-east-1.sim.example.com");
        assert_eq!(host, host.to_lowercase());
        assert!(host.starts_with("orders-"));
        assert!(host.ends_with(".kafka.sim-0001.us-east-1.sim.example.com"));
    }

    #[test]
    fn test_phase_kinds_are_distinct() {
        let kinds: std::collections::HashSet<_> = InstancePhase::ALL
            .iter()
            .map(|p| p.worker_kind().as_str())
            .collect();
        assert_eq!(kinds.len(), InstancePhase::ALL.len());
    }
}

//! Process-wide handles shared by every worker.

use std::sync::Arc;

use kfm_reconcile::Clock;

use crate::clusters::{ClusterManager, ClusterManagerConfig, ClusterService};
use crate::config::Config;
use crate::db::{
    Database, InMemoryClusterStore, InMemoryInstanceStore, InMemoryLeaseStore,
};
use crate::instances::{InstanceManager, InstanceManagerConfig, InstanceStore};
use crate::providers::Collaborators;
use crate::workers::{LeaseManager, LeaseStore, Worker, WorkerRuntime};

/// Store handles, backed by Postgres or by memory.
#[derive(Clone)]
pub struct AppState {
    pub leases: Arc<dyn LeaseStore>,
    pub clusters: Arc<dyn ClusterService>,
    pub instances: Arc<dyn InstanceStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn postgres(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(db.lease_store()),
            clusters: Arc::new(db.cluster_store()),
            instances: Arc::new(db.instance_store()),
            clock,
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(InMemoryLeaseStore::new(Arc::clone(&clock))),
            clusters: Arc::new(InMemoryClusterStore::new()),
            instances: Arc::new(InMemoryInstanceStore::new()),
            clock,
        }
    }

    /// Every worker this control plane runs: the cluster reconciler and one
    /// instance reconciler per phase.
    pub fn workers(&self, config: &Config, collaborators: Collaborators) -> Vec<Arc<dyn Worker>> {
        let interval = config.workers.lease.renew_interval;

        let cluster_manager = ClusterManager::new(
            Arc::clone(&self.clusters),
            Arc::clone(&self.instances),
            collaborators,
            ClusterManagerConfig {
                interval,
                call_timeout: config.workers.call_timeout,
                dataplane: config.dataplane.clone(),
            },
        );

        let instance_config = InstanceManagerConfig {
            interval,
            accepted_timeout: config.workers.accepted_timeout,
            provisioning_timeout: config.workers.provisioning_timeout,
        };

        let mut workers: Vec<Arc<dyn Worker>> = vec![Arc::new(cluster_manager)];
        workers.extend(
            InstanceManager::all_phases(
                Arc::clone(&self.instances),
                Arc::clone(&self.clusters),
                Arc::clone(&self.clock),
                instance_config,
            )
            .into_iter()
            .map(|manager| Arc::new(manager) as Arc<dyn Worker>),
        );
        workers
    }

    /// A runtime for `workers`, leasing as `config.replica_id`.
    pub fn runtime(&self, config: &Config, workers: Vec<Arc<dyn Worker>>) -> WorkerRuntime {
        let leases = LeaseManager::new(
            Arc::clone(&self.leases),
            config.replica_id,
            config.workers.lease.lease_duration,
        );
        WorkerRuntime::new(leases, workers)
    }
}

//! Leased background workers.
//!
//! A worker is one kind of reconciliation (clusters, accepted instances, ...)
//! with its own lease and interval. Every replica runs every worker kind, but
//! only the replica holding a kind's lease runs its passes:
//!
//! - [`lease`]: the lease table and the conditional-update acquisition.
//! - [`runtime`]: the per-kind polling loop, in-flight guard and shutdown.
//!
//! Worker implementations live with their domain (`clusters::manager`,
//! `instances::managers`).

pub mod lease;
pub mod runtime;

use std::time::Duration;

use async_trait::async_trait;
use kfm_reconcile::PassErrors;

pub use lease::{Lease, LeaseManager, LeaseStore};
pub use runtime::WorkerRuntime;

/// A periodic reconciliation job.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Lease type key. Each kind is leased independently.
    fn kind(&self) -> &'static str;

    /// Tick interval; also the lease renewal interval for this kind.
    fn interval(&self) -> Duration;

    /// Run one pass. Every step failure is returned, none aborts the pass.
    async fn reconcile(&self) -> PassErrors;
}

/// The worker kinds this control plane registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Cluster,
    AcceptedInstance,
    PreparingInstance,
    ProvisioningInstance,
    ReadyInstance,
    DeletingInstance,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::Cluster,
        WorkerKind::AcceptedInstance,
        WorkerKind::PreparingInstance,
        WorkerKind::ProvisioningInstance,
        WorkerKind::ReadyInstance,
        WorkerKind::DeletingInstance,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::AcceptedInstance => "accepted_instance",
            Self::PreparingInstance => "preparing_instance",
            Self::ProvisioningInstance => "provisioning_instance",
            Self::ReadyInstance => "ready_instance",
            Self::DeletingInstance => "deleting_instance",
        }
    }

    /// Lease types to seed before any worker starts.
    pub fn lease_types() -> Vec<&'static str> {
        Self::ALL.iter().map(WorkerKind::as_str).collect()
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_types_are_distinct() {
        let types = WorkerKind::lease_types();
        let unique: std::collections::HashSet<_> = types.iter().collect();
        assert_eq!(types.len(), unique.len());
        assert!(types.contains(&"cluster"));
        assert!(types.contains(&"accepted_instance"));
        assert!(types.contains(&"ready_instance"));
    }
}

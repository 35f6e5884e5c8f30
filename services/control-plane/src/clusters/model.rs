//! Data-plane cluster entity and its lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kfm_id::ClusterId;
use serde::{Deserialize, Serialize};

/// Instance types a cluster accepts when nothing else is configured.
pub const DEFAULT_SUPPORTED_INSTANCE_TYPE: &str = "standard,developer";

/// Lifecycle status of a data-plane cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterStatus {
    #[serde(rename = "cluster_accepted")]
    Accepted,
    #[serde(rename = "cluster_provisioning")]
    Provisioning,
    #[serde(rename = "cluster_provisioned")]
    Provisioned,
    #[serde(rename = "waiting_for_fleetshard_operator")]
    WaitingForOperator,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "compute_node_scaling_up")]
    ComputeScalingUp,
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "deprovisioning")]
    Deprovisioning,
    #[serde(rename = "cleanup")]
    Cleanup,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 10] = [
        Self::Accepted,
        Self::Provisioning,
        Self::Provisioned,
        Self::WaitingForOperator,
        Self::Ready,
        Self::ComputeScalingUp,
        Self::Full,
        Self::Failed,
        Self::Deprovisioning,
        Self::Cleanup,
    ];

    /// Statuses that count as a live cluster able to host instances.
    pub const ACTIVE: [ClusterStatus; 3] = [Self::Ready, Self::ComputeScalingUp, Self::Full];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "cluster_accepted",
            Self::Provisioning => "cluster_provisioning",
            Self::Provisioned => "cluster_provisioned",
            Self::WaitingForOperator => "waiting_for_fleetshard_operator",
            Self::Ready => "ready",
            Self::ComputeScalingUp => "compute_node_scaling_up",
            Self::Full => "full",
            Self::Failed => "failed",
            Self::Deprovisioning => "deprovisioning",
            Self::Cleanup => "cleanup",
        }
    }

    /// Position along the lifecycle. The active statuses share one rank.
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Provisioning => 1,
            Self::Provisioned => 2,
            Self::WaitingForOperator => 3,
            Self::Ready | Self::ComputeScalingUp | Self::Full => 4,
            Self::Deprovisioning => 5,
            Self::Cleanup => 6,
            Self::Failed => 7,
        }
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::ComputeScalingUp | Self::Full)
    }

    /// Statuses the desired-state diff and capacity checks treat as gone or going.
    pub const fn is_terminating(&self) -> bool {
        matches!(self, Self::Failed | Self::Deprovisioning | Self::Cleanup)
    }

    /// Lifecycle edges. Same-status is not an edge.
    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;

        match (*self, next) {
            (Accepted, Provisioning)
            | (Provisioning, Provisioned)
            | (Provisioned, WaitingForOperator)
            | (WaitingForOperator, Ready)
            | (Deprovisioning, Cleanup) => true,

            // lateral moves inside the active band
            (Ready | ComputeScalingUp | Full, Ready | ComputeScalingUp | Full) => *self != next,

            (Accepted | Ready | ComputeScalingUp | Full, Deprovisioning) => true,

            // sole cluster in its region is kept
            (Deprovisioning, Ready) => true,

            (from, Failed) => !matches!(from, Failed | Cleanup),

            _ => false,
        }
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: ClusterStatus) -> Vec<ClusterStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    /// True if moving to `next` goes back along the lifecycle.
    pub fn is_backward(&self, next: ClusterStatus) -> bool {
        next.rank() < self.rank()
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cluster status '{0}'")]
pub struct UnknownClusterStatus(pub String);

impl FromStr for ClusterStatus {
    type Err = UnknownClusterStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownClusterStatus(s.to_string()))
    }
}

/// A data-plane cluster row.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    /// Id assigned by the cluster provider once creation was requested.
    pub cluster_id: Option<String>,
    /// Provider-side external id, reported once installed.
    pub external_id: Option<String>,
    pub cloud_provider: String,
    pub region: String,
    pub multi_az: bool,
    pub status: ClusterStatus,
    pub identity_provider_id: Option<String>,
    pub cluster_dns: Option<String>,
    /// Comma-separated instance types, e.g. `standard,developer`.
    pub supported_instance_type: String,
    /// Maximum number of instances this cluster hosts.
    pub instance_limit: i32,
    /// Whether new instances may be placed here.
    pub schedulable: bool,
    /// Content hash of the last applied baseline resource set.
    pub resources_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// A new row for a cluster the control plane will create itself.
    pub fn accepted(
        cloud_provider: impl Into<String>,
        region: impl Into<String>,
        multi_az: bool,
        instance_limit: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ClusterId::new(),
            cluster_id: None,
            external_id: None,
            cloud_provider: cloud_provider.into(),
            region: region.into(),
            multi_az,
            status: ClusterStatus::Accepted,
            identity_provider_id: None,
            cluster_dns: None,
            supported_instance_type: DEFAULT_SUPPORTED_INSTANCE_TYPE.to_string(),
            instance_limit,
            schedulable: true,
            resources_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ClusterStatus) -> Self {
        self.status = status;
        self
    }

    pub fn supports_instance_type(&self, instance_type: &str) -> bool {
        self.supported_instance_type
            .split(',')
            .map(str::trim)
            .any(|t| t == instance_type)
    }
}

/// Filter for [`ClusterService::find_cluster`](super::ClusterService::find_cluster).
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindClusterCriteria {
    pub cloud_provider: Option<String>,
    pub region: Option<String>,
    pub multi_az: Option<bool>,
    pub status: Option<ClusterStatus>,
    pub schedulable: Option<bool>,
    /// Matches clusters whose supported list contains this type.
    pub supported_instance_type: Option<String>,
}

impl FindClusterCriteria {
    /// Same provider and region, in `status`.
    pub fn placement(cloud_provider: &str, region: &str, status: ClusterStatus) -> Self {
        Self {
            cloud_provider: Some(cloud_provider.to_string()),
            region: Some(region.to_string()),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, cluster: &Cluster) -> bool {
        self.cloud_provider
            .as_ref()
            .is_none_or(|p| *p == cluster.cloud_provider)
            && self.region.as_ref().is_none_or(|r| *r == cluster.region)
            && self.multi_az.is_none_or(|m| m == cluster.multi_az)
            && self.status.is_none_or(|s| s == cluster.status)
            && self.schedulable.is_none_or(|s| s == cluster.schedulable)
            && self
                .supported_instance_type
                .as_ref()
                .is_none_or(|t| cluster.supports_instance_type(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ClusterStatus::*;

    #[rstest]
    #[case(Accepted, Provisioning)]
    #[case(Provisioning, Provisioned)]
    #[case(Provisioned, WaitingForOperator)]
    #[case(WaitingForOperator, Ready)]
    #[case(Ready, Full)]
    #[case(Full, Ready)]
    #[case(Ready, ComputeScalingUp)]
    #[case(ComputeScalingUp, Ready)]
    #[case(Ready, Deprovisioning)]
    #[case(Deprovisioning, Ready)]
    #[case(Deprovisioning, Cleanup)]
    #[case(Provisioning, Failed)]
    #[case(Provisioned, Failed)]
    fn test_allowed_transitions(#[case] from: ClusterStatus, #[case] to: ClusterStatus) {
        assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
    }

    #[rstest]
    #[case(Provisioning, Accepted)]
    #[case(Ready, Provisioned)]
    #[case(Cleanup, Deprovisioning)]
    #[case(Failed, Provisioning)]
    #[case(Failed, Deprovisioning)]
    #[case(Cleanup, Failed)]
    #[case(Accepted, Ready)]
    #[case(Provisioning, Deprovisioning)]
    #[case(Ready, Ready)]
    fn test_rejected_transitions(#[case] from: ClusterStatus, #[case] to: ClusterStatus) {
        assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
    }

    #[test]
    fn test_only_documented_edges_go_backward() {
        for from in ClusterStatus::ALL {
            for to in ClusterStatus::ALL {
                if from.can_transition_to(to) && from.is_backward(to) {
                    assert_eq!((from, to), (Deprovisioning, Ready));
                }
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in ClusterStatus::ALL {
            assert_eq!(status.as_str().parse::<ClusterStatus>(), Ok(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("cluster_exploded".parse::<ClusterStatus>().is_err());
    }

    #[test]
    fn test_predecessors_of_deprovisioning() {
        let preds = ClusterStatus::predecessors(Deprovisioning);
        assert_eq!(preds, vec![Accepted, Ready, ComputeScalingUp, Full]);
    }

    #[test]
    fn test_supports_instance_type() {
        let mut cluster = Cluster::accepted("aws", "us-east-1", true, 10);
        assert!(cluster.supports_instance_type("developer"));
        cluster.supported_instance_type = "standard".into();
        assert!(!cluster.supports_instance_type("developer"));
    }

    #[test]
    fn test_criteria_matching() {
        let cluster = Cluster::accepted("aws", "us-east-1", true, 10).with_status(Ready);
        assert!(FindClusterCriteria::placement("aws", "us-east-1", Ready).matches(&cluster));
        assert!(!FindClusterCriteria::placement("gcp", "us-east-1", Ready).matches(&cluster));

        let criteria = FindClusterCriteria {
            supported_instance_type: Some("enterprise".into()),
            ..Default::default()
        };
        assert!(!criteria.matches(&cluster));
    }
}

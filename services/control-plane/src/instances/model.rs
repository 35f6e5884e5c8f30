//! Tenant stream instance entity and its lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kfm_id::{ClusterId, InstanceId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Accepted,
    Preparing,
    Provisioning,
    Ready,
    Deprovision,
    Deleting,
    Failed,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 7] = [
        Self::Accepted,
        Self::Preparing,
        Self::Provisioning,
        Self::Ready,
        Self::Deprovision,
        Self::Deleting,
        Self::Failed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Preparing => "preparing",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Deprovision => "deprovision",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        match (*self, next) {
            (Accepted, Preparing)
            | (Preparing, Provisioning)
            | (Provisioning, Ready)
            | (Deprovision, Deleting) => true,
            (Accepted | Preparing | Provisioning | Ready | Failed, Deprovision) => true,
            (Accepted | Preparing | Provisioning | Ready, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instance status '{0}'")]
pub struct UnknownInstanceStatus(pub String);

impl FromStr for InstanceStatus {
    type Err = UnknownInstanceStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownInstanceStatus(s.to_string()))
    }
}

/// A tenant stream instance row.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub owner: String,
    pub organisation_id: String,
    pub cloud_provider: String,
    pub region: String,
    pub multi_az: bool,
    /// `standard`, `developer`, ...; must be supported by the hosting cluster.
    pub instance_type: String,
    pub status: InstanceStatus,
    /// Hosting cluster, set once placed.
    pub cluster_id: Option<ClusterId>,
    pub bootstrap_server_host: Option<String>,
    pub desired_engine_version: String,
    pub actual_engine_version: Option<String>,
    pub desired_operator_version: String,
    pub actual_operator_version: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// A freshly accepted instance request.
    pub fn accepted(
        name: impl Into<String>,
        owner: impl Into<String>,
        organisation_id: impl Into<String>,
        cloud_provider: impl Into<String>,
        region: impl Into<String>,
        instance_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            name: name.into(),
            owner: owner.into(),
            organisation_id: organisation_id.into(),
            cloud_provider: cloud_provider.into(),
            region: region.into(),
            multi_az: true,
            instance_type: instance_type.into(),
            status: InstanceStatus::Accepted,
            cluster_id: None,
            bootstrap_server_host: None,
            desired_engine_version: "3.7.0".to_string(),
            actual_engine_version: None,
            desired_operator_version: "0.41.0".to_string(),
            actual_operator_version: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

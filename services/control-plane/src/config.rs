use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use kfm_id::ReplicaId;
use kfm_reconcile::{LeaseTiming, ReconcileError};
use serde::Deserialize;
use thiserror::Error;

use crate::clusters::model::DEFAULT_SUPPORTED_INSTANCE_TYPE;
use crate::clusters::ClusterStatus;
use crate::db::DbConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidVar { var: &'static str, value: String },

    #[error(transparent)]
    LeaseTiming(#[from] ReconcileError),

    #[error("failed to read data-plane config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse data-plane config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("data-plane config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    /// Use in-memory stores instead of Postgres.
    pub in_memory: bool,
    pub database: DbConfig,
    pub replica_id: ReplicaId,
    pub workers: WorkerSettings,
    pub dataplane: DataPlaneConfig,
    pub shutdown_timeout: Duration,
}

/// Timing shared by every worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub lease: LeaseTiming,
    /// Upper bound on any single collaborator call.
    pub call_timeout: Duration,
    /// Accepted instances that stay unplaced this long fail.
    pub accepted_timeout: Duration,
    /// Provisioning instances not ready after this long fail.
    pub provisioning_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease: LeaseTiming::default(),
            call_timeout: Duration::from_secs(20),
            accepted_timeout: Duration::from_secs(15 * 60),
            provisioning_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_level = std::env::var("KFM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let dev_mode = env_flag("KFM_DEV");
        let in_memory = env_flag("KFM_IN_MEMORY");
        let database = DbConfig::from_env();

        let replica_id = match std::env::var("KFM_REPLICA_ID") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                var: "KFM_REPLICA_ID",
                value: raw,
            })?,
            Err(_) => ReplicaId::new(),
        };

        let defaults = WorkerSettings::default();
        let renew_interval = env_secs("KFM_RECONCILE_INTERVAL_SECS", defaults.lease.renew_interval)?;
        let lease_duration = env_secs("KFM_LEASE_DURATION_SECS", defaults.lease.lease_duration)?;
        let workers = WorkerSettings {
            lease: LeaseTiming::new(renew_interval, lease_duration)?,
            call_timeout: env_secs("KFM_CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            accepted_timeout: env_secs("KFM_ACCEPTED_TIMEOUT_SECS", defaults.accepted_timeout)?,
            provisioning_timeout: env_secs(
                "KFM_PROVISIONING_TIMEOUT_SECS",
                defaults.provisioning_timeout,
            )?,
        };

        let dataplane = match std::env::var("KFM_DATAPLANE_CONFIG") {
            Ok(path) => DataPlaneConfig::load(Path::new(&path))?,
            Err(_) => DataPlaneConfig::default(),
        };

        let shutdown_timeout = env_secs("KFM_SHUTDOWN_TIMEOUT_SECS", Duration::from_secs(10))?;

        Ok(Self {
            log_level,
            dev_mode,
            in_memory,
            database,
            replica_id,
            workers,
            dataplane,
            shutdown_timeout,
        })
    }
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => u64::from_str(raw.trim())
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidVar { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// How the set of clusters is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// Clusters are listed explicitly in the config file.
    Manual,
    /// One cluster is created per configured provider region.
    Auto,
    /// The cluster set is left alone.
    None,
}

/// Data-plane cluster configuration, read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    pub manual_scaling: bool,
    pub auto_scaling: bool,
    pub clusters: Vec<ManualCluster>,
    pub providers: Vec<ProviderConfig>,
    #[serde(flatten)]
    pub resources: ResourceSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualCluster {
    /// Provider-assigned id of an existing cluster.
    pub cluster_id: String,
    pub cloud_provider: String,
    pub region: String,
    #[serde(default = "default_true")]
    pub multi_az: bool,
    #[serde(default = "default_true")]
    pub schedulable: bool,
    pub instance_limit: i32,
    #[serde(default = "default_instance_types")]
    pub supported_instance_type: String,
    #[serde(default = "default_manual_status")]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default = "default_instance_types")]
    pub supported_instance_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    pub name: String,
    pub instance_limit: i32,
}

/// Settings rendered into each cluster's baseline resources.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Registry pull secret copied into the operator namespaces, if any.
    pub image_pull_secret: Option<String>,
    pub observability_namespace: String,
    pub fleetshard_namespace: String,
    pub operator_namespace: String,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            image_pull_secret: None,
            observability_namespace: "kfm-observability".to_string(),
            fleetshard_namespace: "kfm-fleetshard".to_string(),
            operator_namespace: "kfm-operator".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_instance_types() -> String {
    DEFAULT_SUPPORTED_INSTANCE_TYPE.to_string()
}

fn default_manual_status() -> ClusterStatus {
    ClusterStatus::Provisioning
}

impl DataPlaneConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse()
    }

    /// Manual scaling wins when both flags are set.
    pub fn scaling_mode(&self) -> ScalingMode {
        if self.manual_scaling {
            ScalingMode::Manual
        } else if self.auto_scaling {
            ScalingMode::Auto
        } else {
            ScalingMode::None
        }
    }

    pub fn is_auto(&self) -> bool {
        self.scaling_mode() == ScalingMode::Auto
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.cluster_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cluster_id '{}'",
                    cluster.cluster_id
                )));
            }
            if cluster.instance_limit <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "cluster '{}': instance_limit must be positive",
                    cluster.cluster_id
                )));
            }
            if cluster.status.is_terminating() {
                return Err(ConfigError::Invalid(format!(
                    "cluster '{}': status '{}' cannot be configured",
                    cluster.cluster_id, cluster.status
                )));
            }
        }

        for provider in &self.providers {
            let mut regions = HashSet::new();
            for region in &provider.regions {
                if !regions.insert(region.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "provider '{}': duplicate region '{}'",
                        provider.name, region.name
                    )));
                }
                if region.instance_limit <= 0 {
                    return Err(ConfigError::Invalid(format!(
                        "provider '{}' region '{}': instance_limit must be positive",
                        provider.name, region.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn manual_cluster(&self, cluster_id: &str) -> Option<&ManualCluster> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn region(&self, provider: &str, region: &str) -> Option<&RegionConfig> {
        self.provider(provider)?
            .regions
            .iter()
            .find(|r| r.name == region)
    }

    /// Configured instance types for a cluster, if the config has an opinion.
    pub fn supported_instance_type(
        &self,
        cluster_id: Option<&str>,
        provider: &str,
    ) -> Option<&str> {
        match self.scaling_mode() {
            ScalingMode::Manual => cluster_id
                .and_then(|id| self.manual_cluster(id))
                .map(|c| c.supported_instance_type.as_str()),
            ScalingMode::Auto => self
                .provider(provider)
                .map(|p| p.supported_instance_type.as_str()),
            ScalingMode::None => None,
        }
    }
}

impl FromStr for DataPlaneConfig {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let config: DataPlaneConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANUAL: &str = r#"
        manual_scaling = true
        auto_scaling = true
        image_pull_secret = "pull-secret"

        [[clusters]]
        cluster_id = "abc123"
        cloud_provider = "aws"
        region = "us-east-1"
        instance_limit = 5

        [[clusters]]
        cluster_id = "def456"
        cloud_provider = "aws"
        region = "eu-west-1"
        instance_limit = 2
        schedulable = false
        supported_instance_type = "standard"
        status = "ready"
    "#;

    #[test]
    fn test_manual_takes_precedence() {
        let config: DataPlaneConfig = MANUAL.parse().unwrap();
        assert_eq!(config.scaling_mode(), ScalingMode::Manual);
        assert_eq!(config.clusters.len(), 2);

        let first = config.manual_cluster("abc123").unwrap();
        assert!(first.multi_az);
        assert!(first.schedulable);
        assert_eq!(first.status, ClusterStatus::Provisioning);
        assert_eq!(first.supported_instance_type, "standard,developer");

        let second = config.manual_cluster("def456").unwrap();
        assert_eq!(second.status, ClusterStatus::Ready);
        assert_eq!(
            config.supported_instance_type(Some("def456"), "aws"),
            Some("standard")
        );
        assert_eq!(config.resources.image_pull_secret.as_deref(), Some("pull-secret"));
        assert_eq!(config.resources.fleetshard_namespace, "kfm-fleetshard");
    }

    #[test]
    fn test_auto_providers() {
        let config: DataPlaneConfig = r#"
            auto_scaling = true

            [[providers]]
            name = "aws"
            regions = [{ name = "us-east-1", instance_limit = 3 }]
        "#
        .parse()
        .unwrap();

        assert!(config.is_auto());
        assert_eq!(config.region("aws", "us-east-1").unwrap().instance_limit, 3);
        assert!(config.region("aws", "eu-west-1").is_none());
        assert!(config.region("gcp", "us-east-1").is_none());
    }

    #[test]
    fn test_empty_config_means_no_scaling() {
        let config: DataPlaneConfig = "".parse().unwrap();
        assert_eq!(config.scaling_mode(), ScalingMode::None);
        assert_eq!(config.supported_instance_type(Some("x"), "aws"), None);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let duplicate = r#"
            [[clusters]]
            cluster_id = "a"
            cloud_provider = "aws"
            region = "r"
            instance_limit = 1

            [[clusters]]
            cluster_id = "a"
            cloud_provider = "aws"
            region = "r"
            instance_limit = 1
        "#;
        assert!(matches!(
            duplicate.parse::<DataPlaneConfig>(),
            Err(ConfigError::Invalid(_))
        ));

        let zero_limit = r#"
            [[clusters]]
            cluster_id = "a"
            cloud_provider = "aws"
            region = "r"
            instance_limit = 0
        "#;
        assert!(zero_limit.parse::<DataPlaneConfig>().is_err());

        let bad_status = r#"
            [[clusters]]
            cluster_id = "a"
            cloud_provider = "aws"
            region = "r"
            instance_limit = 1
            status = "exploded"
        "#;
        assert!(matches!(
            bad_status.parse::<DataPlaneConfig>(),
            Err(ConfigError::Parse(_))
        ));
    }
}

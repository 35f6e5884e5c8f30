//! Baseline resources every data-plane cluster carries.

use serde_json::{json, Value};

use super::Cluster;
use crate::config::ResourceSettings;
use crate::providers::ResourceSet;

/// Name of the set; the provider applies and tracks it under this name.
pub const BASELINE_RESOURCE_SET: &str = "kfm-baseline";

/// Namespaces, RBAC and observability wiring for `cluster`, plus the image
/// pull secret when one is configured.
pub fn baseline_resources(cluster: &Cluster, settings: &ResourceSettings) -> ResourceSet {
    let namespaces = [
        settings.operator_namespace.as_str(),
        settings.fleetshard_namespace.as_str(),
        settings.observability_namespace.as_str(),
    ];

    let mut resources: Vec<Value> = namespaces
        .iter()
        .map(|name| namespace(name, cluster))
        .collect();

    resources.push(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": { "name": "kfm-fleetshard-admin" },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": "cluster-admin",
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": "fleetshard-agent",
            "namespace": settings.fleetshard_namespace,
        }],
    }));

    resources.push(json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": {
            "name": "kfm-instances",
            "namespace": settings.observability_namespace,
        },
        "spec": {
            "namespaceSelector": { "any": true },
            "selector": { "matchLabels": { "app.kubernetes.io/managed-by": "kfm-operator" } },
            "endpoints": [{ "port": "metrics", "interval": "30s" }],
        },
    }));

    if let Some(secret) = &settings.image_pull_secret {
        for ns in [&settings.operator_namespace, &settings.fleetshard_namespace] {
            resources.push(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "type": "kubernetes.io/dockerconfigjson",
                "metadata": { "name": "kfm-pull-secret", "namespace": ns },
                "data": { ".dockerconfigjson": secret },
            }));
        }
    }

    ResourceSet {
        name: BASELINE_RESOURCE_SET.to_string(),
        resources,
    }
}

fn namespace(name: &str, cluster: &Cluster) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": {
                "kfm.dev/cluster-id": cluster.id.to_string(),
                "kfm.dev/cloud-provider": cluster.cloud_provider,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_secret_changes_hash() {
        let cluster = Cluster::accepted("aws", "us-east-1", true, 5);
        let mut settings = ResourceSettings::default();
        let without = baseline_resources(&cluster, &settings);

        settings.image_pull_secret = Some("c2VjcmV0".into());
        let with = baseline_resources(&cluster, &settings);

        assert_eq!(with.resources.len(), without.resources.len() + 2);
        assert_ne!(with.hash(), without.hash());
        assert_eq!(without.hash(), baseline_resources(&cluster, &ResourceSettings::default()).hash());
    }
}

//! Two replicas running the full worker set over shared in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use kfm_control_plane::clusters::{ClusterService, ClusterStatus};
use kfm_control_plane::config::{
    Config, DataPlaneConfig, ProviderConfig, RegionConfig, WorkerSettings,
};
use kfm_control_plane::db::DbConfig;
use kfm_control_plane::instances::{Instance, InstanceStatus, InstanceStore};
use kfm_control_plane::providers::Collaborators;
use kfm_control_plane::state::AppState;
use kfm_control_plane::workers::{LeaseStore, WorkerKind};
use kfm_id::ReplicaId;
use kfm_reconcile::{Clock, LeaseTiming, SystemClock};

fn replica_config() -> Config {
    Config {
        log_level: "debug".into(),
        dev_mode: true,
        in_memory: true,
        database: DbConfig::default(),
        replica_id: ReplicaId::new(),
        workers: WorkerSettings {
            lease: LeaseTiming::new(Duration::from_millis(50), Duration::from_millis(200)).unwrap(),
            call_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        dataplane: DataPlaneConfig {
            auto_scaling: true,
            providers: vec![ProviderConfig {
                name: "aws".into(),
                regions: vec![RegionConfig {
                    name: "us-east-1".into(),
                    instance_limit: 10,
                }],
                supported_instance_type: "standard,developer".into(),
            }],
            ..Default::default()
        },
        shutdown_timeout: Duration::from_secs(5),
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_replicas_drive_a_region_without_duplicating_work() {
    let state = AppState::in_memory(Arc::new(SystemClock));
    state.leases.seed(&WorkerKind::lease_types()).await.unwrap();
    let collaborators = Collaborators::simulated();

    let configs = [replica_config(), replica_config()];
    let mut runtimes: Vec<_> = configs
        .iter()
        .map(|config| {
            let workers = state.workers(config, collaborators.clone());
            state.runtime(config, workers)
        })
        .collect();
    for runtime in &mut runtimes {
        runtime.start();
        assert!(runtime.is_running("cluster"));
    }

    let clusters = state.clusters.clone();
    eventually("cluster waiting for operator", || {
        let clusters = clusters.clone();
        async move {
            clusters
                .list_by_status(ClusterStatus::WaitingForOperator)
                .await
                .unwrap()
                .len()
                == 1
        }
    })
    .await;

    let all = state.clusters.list_all().await.unwrap();
    assert_eq!(all.len(), 1, "a second replica duplicated cluster creation");
    state
        .clusters
        .update_status(&all[0].id, ClusterStatus::Ready)
        .await
        .unwrap();

    let instance = Instance::accepted("orders", "alice", "org-1", "aws", "us-east-1", "standard");
    state.instances.create(&instance).await.unwrap();

    let instances = state.instances.clone();
    let id = instance.id;
    eventually("instance provisioning", || {
        let instances = instances.clone();
        async move {
            instances
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|i| i.status == InstanceStatus::Provisioning)
        }
    })
    .await;

    let lease = state.leases.get("cluster").await.unwrap().unwrap();
    let holder = lease.leader_id.unwrap();
    assert!(configs.iter().any(|c| c.replica_id == holder));

    for runtime in &mut runtimes {
        runtime.stop().await;
        assert!(!runtime.is_running("cluster"));
    }

    // Stopped replicas hand their leases back.
    let now = state.clock.now();
    for kind in WorkerKind::lease_types() {
        let lease = state.leases.get(kind).await.unwrap().unwrap();
        assert!(lease.is_available(now), "{kind} still leased after shutdown");
    }
}

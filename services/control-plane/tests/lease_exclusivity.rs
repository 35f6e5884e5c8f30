//! Lease exclusivity and handover timing against the in-memory lease store.

use std::sync::Arc;
use std::time::Duration;

use kfm_control_plane::db::InMemoryLeaseStore;
use kfm_control_plane::workers::{LeaseManager, LeaseStore};
use kfm_id::ReplicaId;
use kfm_reconcile::{LeaseTiming, ManualClock};
use proptest::prelude::*;

const KIND: &str = "cluster";

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

#[derive(Debug, Clone)]
enum Step {
    /// Replica `i` tries to acquire or renew.
    Try(usize),
    /// Replica `i` releases.
    Release(usize),
    /// Time moves forward.
    Advance(u64),
}

fn step(replicas: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (0..replicas).prop_map(Step::Try),
        1 => (0..replicas).prop_map(Step::Release),
        3 => (0u64..20_000).prop_map(Step::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn at_most_one_replica_holds_the_lease(steps in prop::collection::vec(step(4), 1..200)) {
        block_on(async {
            let clock = ManualClock::default();
            let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone())));
            store.seed(&[KIND]).await.unwrap();

            let replicas: Vec<ReplicaId> = (0..4).map(|_| ReplicaId::new()).collect();
            let duration = Duration::from_secs(10);

            for step in steps {
                match step {
                    Step::Try(i) => {
                        let held = store
                            .try_acquire_or_renew(KIND, &replicas[i], duration)
                            .await
                            .unwrap();
                        let lease = store.get(KIND).await.unwrap().unwrap();
                        prop_assert_eq!(held, lease.is_held_by(&replicas[i], clock.now_for_test()));
                    }
                    Step::Release(i) => store.release(KIND, &replicas[i]).await.unwrap(),
                    Step::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                }

                let now = clock.now_for_test();
                let lease = store.get(KIND).await.unwrap().unwrap();
                let holders = replicas.iter().filter(|r| lease.is_held_by(r, now)).count();
                prop_assert!(holders <= 1, "{holders} replicas hold the lease at once");
            }
            Ok(())
        })?;
    }

    #[test]
    fn handover_happens_within_one_interval_after_expiry(
        phase_secs in 0u64..10,
        missed_before_crash in 0u64..3,
    ) {
        let timing = LeaseTiming::new(Duration::from_secs(10), Duration::from_secs(40)).unwrap();

        block_on(async {
            let clock = ManualClock::default();
            let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone())));
            store.seed(&[KIND]).await.unwrap();

            let old = LeaseManager::new(store.clone(), ReplicaId::new(), timing.lease_duration);
            let new = LeaseManager::new(store.clone(), ReplicaId::new(), timing.lease_duration);

            for _ in 0..=missed_before_crash {
                prop_assert!(old.is_leader(KIND).await);
                clock.advance(timing.renew_interval);
            }
            // The old holder's last renewal happened one interval ago; it now stops.
            let last_renewal = clock.now_for_test() - chrono::Duration::seconds(10);

            clock.advance(Duration::from_secs(phase_secs));
            loop {
                let elapsed = (clock.now_for_test() - last_renewal).to_std().unwrap();
                if new.is_leader(KIND).await {
                    prop_assert!(elapsed >= timing.lease_duration, "took over after {elapsed:?}");
                    prop_assert!(elapsed <= timing.handover_bound(), "took over after {elapsed:?}");
                    break;
                }
                prop_assert!(elapsed <= timing.handover_bound(), "no handover after {elapsed:?}");
                clock.advance(timing.renew_interval);
            }
            Ok(())
        })?;
    }
}

/// Small extension so tests can read the manual clock without importing the trait.
trait NowForTest {
    fn now_for_test(&self) -> chrono::DateTime<chrono::Utc>;
}

impl NowForTest for ManualClock {
    fn now_for_test(&self) -> chrono::DateTime<chrono::Utc> {
        kfm_reconcile::Clock::now(self)
    }
}

#[tokio::test]
async fn live_holder_keeps_the_lease_through_contention() {
    let clock = ManualClock::default();
    let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone())));
    store.seed(&[KIND]).await.unwrap();

    let holder = LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_secs(30));
    let others: Vec<_> = (0..3)
        .map(|_| LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_secs(30)))
        .collect();

    for _ in 0..20 {
        assert!(holder.is_leader(KIND).await);
        for other in &others {
            assert!(!other.is_leader(KIND).await);
        }
        clock.advance(Duration::from_secs(10));
    }
}

#[tokio::test]
async fn unreachable_store_means_not_leader_this_tick() {
    let clock = ManualClock::default();
    let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone())));
    store.seed(&[KIND]).await.unwrap();
    let holder = LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_secs(30));

    assert!(holder.is_leader(KIND).await);
    store.set_unavailable(true);
    assert!(!holder.is_leader(KIND).await);

    // Still within the lease: the holder picks up where it left off.
    store.set_unavailable(false);
    clock.advance(Duration::from_secs(10));
    assert!(holder.is_leader(KIND).await);
}

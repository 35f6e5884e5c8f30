//! Periodic worker runtime.
//!
//! Each registered worker gets its own polling task. On every tick the task
//! tries to acquire or renew the worker's lease; if it holds the lease and
//! no pass of that worker is running in this process, it spawns one.
//! Passes run in their own task so the lease keeps being renewed while a
//! long pass is underway.
//!
//! Worker kinds share nothing: a stuck pass of one kind never delays the
//! ticks of another.

use std::sync::Arc;
use std::time::Instant;

use kfm_id::WorkerId;
use kfm_reconcile::InFlight;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::{LeaseManager, Worker};

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another replica holds the lease (or the datastore was unreachable).
    NotLeader,
    /// Leader, but the previous pass has not finished yet.
    PassInFlight,
    /// Leader, and a new pass was spawned.
    Started,
}

/// Runs registered workers until stopped.
pub struct WorkerRuntime {
    leases: LeaseManager,
    slots: Vec<WorkerSlot>,
}

struct WorkerSlot {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    in_flight: InFlight,
    running: Option<RunningWorker>,
}

struct RunningWorker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerRuntime {
    pub fn new(leases: LeaseManager, workers: Vec<Arc<dyn Worker>>) -> Self {
        let slots = workers
            .into_iter()
            .map(|worker| WorkerSlot {
                id: WorkerId::new(),
                worker,
                in_flight: InFlight::new(),
                running: None,
            })
            .collect();

        Self { leases, slots }
    }

    /// Spawn a polling task for every worker that is not already running.
    pub fn start(&mut self) {
        for slot in &mut self.slots {
            if slot.running.is_some() {
                continue;
            }

            let (shutdown, shutdown_rx) = watch::channel(false);
            let worker_loop = WorkerLoop {
                id: slot.id,
                worker: Arc::clone(&slot.worker),
                leases: self.leases.clone(),
                in_flight: slot.in_flight.clone(),
                pass: None,
            };
            let task = tokio::spawn(worker_loop.run(shutdown_rx));
            slot.running = Some(RunningWorker { shutdown, task });
        }

        info!(
            replica_id = %self.leases.replica_id(),
            workers = self.slots.len(),
            "Worker runtime started"
        );
    }

    /// Signal every worker, then wait for each to finish its in-flight pass
    /// and release its lease.
    pub async fn stop(&mut self) {
        let running: Vec<_> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.running.take().map(|r| (slot.worker.kind(), r)))
            .collect();

        for (_, worker) in &running {
            let _ = worker.shutdown.send(true);
        }

        for (kind, worker) in running {
            if let Err(e) = worker.task.await {
                error!(worker_kind = kind, error = %e, "Worker task panicked");
            }
        }

        info!("Worker runtime stopped");
    }

    pub fn is_running(&self, kind: &str) -> bool {
        self.slot(kind).is_some_and(|slot| slot.running.is_some())
    }

    /// True while a pass of `kind` is executing in this process.
    pub fn is_in_flight(&self, kind: &str) -> bool {
        self.slot(kind).is_some_and(|slot| slot.in_flight.is_active())
    }

    /// Registered workers as `(id, kind)` pairs.
    pub fn workers(&self) -> impl Iterator<Item = (WorkerId, &'static str)> + '_ {
        self.slots.iter().map(|slot| (slot.id, slot.worker.kind()))
    }

    fn slot(&self, kind: &str) -> Option<&WorkerSlot> {
        self.slots.iter().find(|slot| slot.worker.kind() == kind)
    }
}

/// The polling state of one worker kind in this replica.
struct WorkerLoop {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    leases: LeaseManager,
    in_flight: InFlight,
    pass: Option<JoinHandle<()>>,
}

impl WorkerLoop {
    #[instrument(skip_all, fields(worker_id = %self.id, worker_kind = self.worker.kind()))]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.worker.kind();
        info!(
            interval_ms = self.worker.interval().as_millis() as u64,
            "Starting worker"
        );

        let mut ticker = tokio::time::interval(self.worker.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Worker shutting down");
                        break;
                    }
                }
            }
        }

        // Release only after the pass is done so the next leader never overlaps it.
        if let Some(pass) = self.pass.take() {
            if let Err(e) = pass.await {
                error!(error = %e, "Reconciliation pass panicked");
            }
        }

        self.leases.release(kind).await;

        info!("Worker stopped");
    }

    async fn tick(&mut self) -> TickOutcome {
        let kind = self.worker.kind();

        if !self.leases.is_leader(kind).await {
            return TickOutcome::NotLeader;
        }

        let Some(guard) = self.in_flight.try_begin() else {
            debug!(worker_kind = kind, "Previous pass still running, skipping tick");
            return TickOutcome::PassInFlight;
        };

        // The previous pass released the flag, so its task is done or about to be.
        if let Some(previous) = self.pass.take() {
            if let Err(e) = previous.await {
                error!(worker_kind = kind, error = %e, "Reconciliation pass panicked");
            }
        }

        let worker = Arc::clone(&self.worker);
        self.pass = Some(tokio::spawn(async move {
            let _guard = guard;
            run_pass(worker.as_ref()).await;
        }));

        TickOutcome::Started
    }
}

#[instrument(skip_all, fields(worker_kind = worker.kind()))]
async fn run_pass(worker: &dyn Worker) {
    let started = Instant::now();
    let errors = worker.reconcile().await;
    let failures = errors.len();

    for failure in errors {
        warn!(
            step = failure.step,
            subject = failure.subject.as_deref().unwrap_or("-"),
            error = %failure.message,
            "Reconciliation step failed"
        );
    }

    debug!(
        failures,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Reconciliation pass complete"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use kfm_id::ReplicaId;
    use kfm_reconcile::{ManualClock, PassErrors, SystemClock};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::db::InMemoryLeaseStore;
    use crate::workers::LeaseStore;

    /// Worker whose passes block until a permit is added to `gate`.
    struct GatedWorker {
        gate: Arc<Semaphore>,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl GatedWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Worker for GatedWorker {
        fn kind(&self) -> &'static str {
            "gated"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn reconcile(&self) -> PassErrors {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            PassErrors::new()
        }
    }

    /// Worker that tracks how many of its passes run at once, across replicas.
    struct CountingWorker {
        current: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        passes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn kind(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn reconcile(&self) -> PassErrors {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(8)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.passes.fetch_add(1, Ordering::SeqCst);
            PassErrors::new()
        }
    }

    async fn leases_for(kind: &str, store: &Arc<InMemoryLeaseStore>) -> LeaseManager {
        store.seed(&[kind]).await.unwrap();
        LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_millis(60))
    }

    fn worker_loop(worker: Arc<dyn Worker>, leases: LeaseManager) -> WorkerLoop {
        WorkerLoop {
            id: WorkerId::new(),
            worker,
            leases,
            in_flight: InFlight::new(),
            pass: None,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_refused() {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(ManualClock::default())));
        let worker = GatedWorker::new();
        let mut wl = worker_loop(worker.clone(), leases_for("gated", &store).await);

        assert_eq!(wl.tick().await, TickOutcome::Started);
        wait_until(|| worker.started.load(Ordering::SeqCst) == 1).await;

        assert_eq!(wl.tick().await, TickOutcome::PassInFlight);
        assert_eq!(wl.tick().await, TickOutcome::PassInFlight);
        assert!(wl.in_flight.is_active());
        assert_eq!(worker.started.load(Ordering::SeqCst), 1);

        worker.gate.add_permits(1);
        let flag = wl.in_flight.clone();
        wait_until(|| !flag.is_active()).await;

        assert_eq!(wl.tick().await, TickOutcome::Started);
        wait_until(|| worker.started.load(Ordering::SeqCst) == 2).await;
        worker.gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_non_leader_never_starts_pass() {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(ManualClock::default())));
        let holder = leases_for("gated", &store).await;
        assert!(holder.is_leader("gated").await);

        let worker = GatedWorker::new();
        let other = LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_millis(60));
        let mut wl = worker_loop(worker.clone(), other);

        assert_eq!(wl.tick().await, TickOutcome::NotLeader);
        assert_eq!(worker.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_pass_and_releases_lease() {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
        let worker = GatedWorker::new();
        let leases = leases_for("gated", &store).await;
        let replica = *leases.replica_id();

        let mut runtime = WorkerRuntime::new(leases, vec![worker.clone() as Arc<dyn Worker>]);
        runtime.start();
        assert!(runtime.is_running("gated"));

        wait_until(|| worker.started.load(Ordering::SeqCst) == 1).await;
        assert!(runtime.is_in_flight("gated"));

        let gate = worker.gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(1);
        });
        runtime.stop().await;

        assert_eq!(worker.finished.load(Ordering::SeqCst), 1);
        assert!(!runtime.is_running("gated"));
        assert!(!runtime.is_in_flight("gated"));

        let lease = store.get("gated").await.unwrap().unwrap();
        assert_eq!(lease.leader_id, Some(replica));
        assert!(lease.is_available(chrono::Utc::now()));
    }

    #[tokio::test]
    async fn test_replicas_never_run_the_same_kind_concurrently() {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
        store.seed(&["counting"]).await.unwrap();

        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let mut runtimes: Vec<WorkerRuntime> = (0..3)
            .map(|_| {
                let worker = Arc::new(CountingWorker {
                    current: current.clone(),
                    max_seen: max_seen.clone(),
                    passes: passes.clone(),
                });
                let leases =
                    LeaseManager::new(store.clone(), ReplicaId::new(), Duration::from_millis(30));
                WorkerRuntime::new(leases, vec![worker as Arc<dyn Worker>])
            })
            .collect();

        for runtime in &mut runtimes {
            runtime.start();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        for runtime in &mut runtimes {
            runtime.stop().await;
        }

        assert!(passes.load(Ordering::SeqCst) > 0);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}

//! Fleet control plane.
//!
//! Runs the leased background workers that drive data-plane clusters and
//! tenant instances toward their desired state. Every replica runs every
//! worker kind; leases decide which replica actually reconciles each kind.

use std::sync::Arc;

use anyhow::{bail, Result};
use kfm_control_plane::{
    config,
    db::Database,
    providers::Collaborators,
    state::AppState,
    workers::{LeaseStore, WorkerKind},
};
use kfm_reconcile::SystemClock;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to KFM_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        replica_id = %config.replica_id,
        scaling_mode = ?config.dataplane.scaling_mode(),
        renew_interval_secs = config.workers.lease.renew_interval.as_secs(),
        lease_duration_secs = config.workers.lease.lease_duration.as_secs(),
        "Starting fleet control plane"
    );

    if !config.dev_mode {
        bail!("only simulated collaborators are available; set KFM_DEV=1 to run");
    }

    let clock = Arc::new(SystemClock);
    let state = if config.in_memory {
        info!("Using in-memory stores");
        AppState::in_memory(clock)
    } else {
        let db = match Database::connect(&config.database).await {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "Failed to connect to database");
                return Err(e.into());
            }
        };

        if let Err(e) = db.health_check().await {
            error!(error = %e, "Database health check failed");
            return Err(e.into());
        }

        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
        AppState::postgres(&db, clock)
    };

    state.leases.seed(&WorkerKind::lease_types()).await?;

    let workers = state.workers(&config, Collaborators::simulated());
    let mut runtime = state.runtime(&config, workers);
    for (worker_id, kind) in runtime.workers() {
        info!(worker_id = %worker_id, worker_kind = kind, "Registered worker");
    }
    runtime.start();

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if tokio::time::timeout(config.shutdown_timeout, runtime.stop())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Workers did not shut down in time; leases will expire on their own"
        );
    }

    info!("Control plane shutdown complete");
    Ok(())
}

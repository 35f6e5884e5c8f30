//! Fleet control plane library.
//!
//! The `control-plane` binary wires these modules together; the library
//! surface exists for integration tests.
//!
//! - [`workers`]: leader leases and the periodic worker runtime
//! - [`clusters`]: data-plane cluster lifecycle and its reconciler
//! - [`instances`]: tenant instance lifecycle and its per-phase reconcilers
//! - [`providers`]: outbound collaborator contracts and simulated implementations
//! - [`db`]: Postgres and in-memory stores

pub mod clusters;
pub mod config;
pub mod db;
pub mod instances;
pub mod providers;
pub mod state;
pub mod workers;

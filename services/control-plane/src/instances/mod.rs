//! Tenant stream instances.
//!
//! Instances follow a smaller lifecycle than clusters, reconciled by one
//! worker per phase. All phases share [`managers::InstanceManager`].

pub mod managers;
pub mod model;
pub mod service;

pub use managers::{InstanceManager, InstanceManagerConfig, InstancePhase};
pub use model::{Instance, InstanceStatus};
pub use service::InstanceStore;

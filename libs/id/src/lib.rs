//! # kfm-id
//!
//! Typed identifiers for the fleet control plane.
//!
//! Every identifier the control plane mints is a ULID with a short type
//! prefix: `{prefix}_{ulid}`. The prefix keeps a cluster id from ever being
//! passed where an instance id is expected, and the ULID keeps rows
//! sortable by creation time.
//!
//! Examples:
//! - `cl_01HV4Z2WQXKJNM8GPQY6VBKC3D` (data-plane cluster)
//! - `kfk_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (tenant stream instance)
//! - `rep_01HV4Z4NYPLTRS0JTUA8XDME5F` (control-plane replica, the leaseholder)
//!
//! Identifiers assigned by external systems (the cluster provider's own
//! cluster id, identity-provider ids) are opaque strings and do not live here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

//! ID definitions for every entity the control plane mints.

use crate::define_id;

// =============================================================================
// Data plane
// =============================================================================

define_id!(
    /// Internal id of a data-plane cluster row.
    ClusterId,
    "cl"
);
define_id!(
    /// Tenant stream instance hosted on a data-plane cluster.
    InstanceId,
    "kfk"
);

// =============================================================================
// Coordination
// =============================================================================

define_id!(
    /// One running control-plane process; recorded as the lease holder.
    ReplicaId,
    "rep"
);
define_id!(
    /// In-process worker object. Unique per replica and worker kind.
    WorkerId,
    "wrk"
);
define_id!(
    /// Primary key of a lease row.
    LeaseId,
    "lse"
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cluster_id_roundtrip() {
        let id = ClusterId::new();
        let parsed: ClusterId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("cl_"));
    }

    #[test]
    fn test_prefix_mismatch_rejected() {
        let instance = InstanceId::new().to_string();
        let err = ClusterId::parse(&instance).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        assert_eq!(
            ReplicaId::parse("rep01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(crate::IdError::MissingSeparator)
        );
    }

    #[test]
    fn test_empty_and_invalid_ulid() {
        assert_eq!(WorkerId::parse(""), Err(crate::IdError::Empty));
        assert!(matches!(
            WorkerId::parse("wrk_not-a-ulid"),
            Err(crate::IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = InstanceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = ClusterId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ClusterId::new();
        assert!(first < second);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            ClusterId::PREFIX,
            InstanceId::PREFIX,
            ReplicaId::PREFIX,
            WorkerId::PREFIX,
            LeaseId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn parse_never_accepts_foreign_prefix(prefix in "[a-z]{1,6}") {
            prop_assume!(prefix != ClusterId::PREFIX);
            let raw = format!("{prefix}_{}", crate::Ulid::new());
            prop_assert!(ClusterId::parse(&raw).is_err());
        }
    }
}

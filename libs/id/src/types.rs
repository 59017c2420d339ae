//! Typed ID definitions for scheduler resources.

use crate::define_id;

// =============================================================================
// Scheduling Scope
// =============================================================================

define_id!(PoolId, "pool");
define_id!(HostId, "host");

// =============================================================================
// Workloads
// =============================================================================

define_id!(ServiceId, "svc");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_host_id_roundtrip() {
        let id = HostId::new();
        let parsed: HostId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_service_id_prefix() {
        let id = ServiceId::new();
        assert!(id.to_string().starts_with("svc_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<HostId, _> = "svc_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<PoolId, _> = "pool01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<PoolId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<ServiceId, _> = "svc_not-a-ulid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = PoolId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: PoolId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [PoolId::PREFIX, HostId::PREFIX, ServiceId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn ids_never_contain_reserved_characters(raw in any::<u128>()) {
            let host = HostId::from_ulid(crate::Ulid(raw)).to_string();
            let svc = ServiceId::from_ulid(crate::Ulid(raw)).to_string();
            prop_assert!(!host.contains('-') && !host.contains('/'));
            prop_assert!(!svc.contains('-') && !svc.contains('/'));
        }
    }
}

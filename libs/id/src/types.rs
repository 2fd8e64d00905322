//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Workloads
// =============================================================================

define_id!(WorkloadId, 8);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::IdError;

    #[test]
    fn test_workload_id_format() {
        let id = WorkloadId::from_bytes([0x3f, 0x9a, 0x0c, 0x1b, 0xe4, 0x7d, 0x28, 0x56]);
        assert_eq!(id.to_string(), "3f9a0c1be47d2856");
        assert_eq!(WorkloadId::parse("3f9a0c1be47d2856").unwrap(), id);
    }

    #[test]
    fn test_workload_id_empty() {
        let err = WorkloadId::parse("").unwrap_err();
        assert!(err.is_empty());
    }

    #[test]
    fn test_workload_id_wrong_length() {
        assert_eq!(
            WorkloadId::parse("abc").unwrap_err(),
            IdError::InvalidLength {
                expected: 16,
                actual: 3
            }
        );
    }

    #[test]
    fn test_workload_id_rejects_uppercase() {
        assert_eq!(
            WorkloadId::parse("3F9a0c1be47d2856").unwrap_err(),
            IdError::InvalidCharacter {
                found: 'F',
                offset: 1
            }
        );
    }

    #[test]
    fn test_workload_id_json() {
        let id = WorkloadId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: WorkloadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_generate_unique_skips_taken_ids() {
        let mut taken = HashSet::new();
        for _ in 0..32 {
            let id = WorkloadId::generate_unique(|c| taken.contains(c)).unwrap();
            assert!(taken.insert(id));
        }
    }

    #[test]
    fn test_generate_unique_gives_up() {
        let err = WorkloadId::generate_unique(|_| true).unwrap_err();
        assert_eq!(
            err,
            IdError::Exhausted {
                attempts: WorkloadId::MAX_ATTEMPTS
            }
        );
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_display(bytes in any::<[u8; 8]>()) {
            let id = WorkloadId::from_bytes(bytes);
            prop_assert_eq!(id.to_string().parse::<WorkloadId>().unwrap(), id);
        }

        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = WorkloadId::parse(&s);
        }
    }
}

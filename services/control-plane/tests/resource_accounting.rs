//! Accounting invariants under arbitrary alloc/free sequences.

use corral_control_plane::resources::{
    ProviderDecl, ResourceLedger, ResourceRequest, UnitKind,
};
use proptest::prelude::*;

const USERS: [&str; 4] = ["w1", "w2", "w3", "w4"];

#[derive(Debug, Clone)]
enum Op {
    Alloc { user: usize, amount: u64 },
    Free { user: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..USERS.len(), 0u64..6).prop_map(|(user, amount)| Op::Alloc { user, amount }),
        (0..USERS.len()).prop_map(|user| Op::Free { user }),
    ]
}

fn ledger(kind: UnitKind, total: u64) -> ResourceLedger {
    let mut ledger = ResourceLedger::new();
    ledger
        .add_providers(&[ProviderDecl {
            resource_type: "r".into(),
            provider: "n1".into(),
            unit_kind: kind,
            total,
        }])
        .unwrap();
    ledger
}

fn apply(ledger: &mut ResourceLedger, op: &Op) {
    // Rejections are expected; the invariants must hold either way.
    let _ = match op {
        Op::Alloc { user, amount } => {
            ledger.alloc(&[ResourceRequest::new("r", "n1", USERS[*user], *amount)])
        }
        Op::Free { user } => ledger.free(&[ResourceRequest::new("r", "n1", USERS[*user], 0)]),
    };
}

proptest! {
    #[test]
    fn free_plus_used_is_total(
        kind in prop_oneof![Just(UnitKind::Fluid), Just(UnitKind::Discrete)],
        ops in prop::collection::vec(op(), 1..40),
    ) {
        let mut ledger = ledger(kind, 10);
        for op in &ops {
            apply(&mut ledger, op);
            let p = ledger.provider("r", "n1").unwrap();
            prop_assert_eq!(p.free + p.used, p.total);
            prop_assert_eq!(p.used, p.users.values().map(|u| u.used).sum::<u64>());
        }
    }

    #[test]
    fn discrete_bits_match_user_indexes(ops in prop::collection::vec(op(), 1..40)) {
        let mut ledger = ledger(UnitKind::Discrete, 12);
        for op in &ops {
            apply(&mut ledger, op);
            let p = ledger.provider("r", "n1").unwrap();
            let held: u64 = p.users.values().map(|u| u.indexes.len() as u64).sum();
            prop_assert_eq!(p.bitmap().count_ones(), held);
            for user in p.users.values() {
                for index in &user.indexes {
                    prop_assert!(p.bitmap().is_set(*index));
                }
            }
            prop_assert!(ledger.check().is_ok());
        }
    }

    #[test]
    fn repeat_alloc_consumes_once(amount in 1u64..5) {
        let mut ledger = ledger(UnitKind::Fluid, 10);
        let request = [ResourceRequest::new("r", "n1", "w1", amount)];
        let first = ledger.alloc(&request).unwrap();
        let second = ledger.alloc(&request).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(ledger.provider("r", "n1").unwrap().free, 10 - amount);
    }
}

#[test]
fn test_mixed_batch_mutates_nothing() {
    let mut ledger = ResourceLedger::new();
    ledger
        .add_providers(&[
            ProviderDecl {
                resource_type: "cpu".into(),
                provider: "n1".into(),
                unit_kind: UnitKind::Fluid,
                total: 4,
            },
            ProviderDecl {
                resource_type: "memory".into(),
                provider: "n1".into(),
                unit_kind: UnitKind::Fluid,
                total: 1024,
            },
        ])
        .unwrap();

    let result = ledger.alloc(&[
        ResourceRequest::new("cpu", "n1", "w1", 2),
        ResourceRequest::new("memory", "n1", "w1", 2048),
    ]);

    assert!(result.is_err());
    assert_eq!(ledger.provider("cpu", "n1").unwrap().free, 4);
    assert_eq!(ledger.provider("memory", "n1").unwrap().free, 1024);
}

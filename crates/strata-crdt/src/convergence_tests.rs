//! Randomized convergence checks across every model.
//!
//! Two replicas start from a shared history, each applies its own local
//! edits under a distinct actor, and then one merges the other's data. The
//! other side replays the returned delta and both must end up identical.

use proptest::prelude::*;
use proptest::test_runner::Config;

use crate::count::{CountOperation, CrdtCount, VersionRange};
use crate::model::{CrdtChange, CrdtModel};
use crate::set::{CrdtSet, SetOperation};
use crate::singleton::{CrdtSingleton, SingletonOperation};

// =============================================================================
// Local edit scripts
// =============================================================================

#[derive(Clone, Debug)]
enum Edit {
    Add(u8),
    Remove(u8),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0u8..6).prop_map(Edit::Add),
        1 => (0u8..6).prop_map(Edit::Remove),
    ]
}

fn script(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit(), 0..max)
}

/// Apply `edits` as `actor`; every edit a replica makes locally is valid.
fn run_set_script(set: &mut CrdtSet<String>, actor: &str, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Add(id) => {
                let op = SetOperation::Add {
                    actor: actor.into(),
                    clock: set.version_map().incremented(actor),
                    added: format!("item-{id}"),
                };
                assert!(set.apply_operation(&op).unwrap());
            }
            Edit::Remove(id) => {
                let id = format!("item-{id}");
                if set.contains(&id) {
                    let op = SetOperation::Remove {
                        actor: actor.into(),
                        clock: set.version_map(),
                        removed: id,
                    };
                    assert!(set.apply_operation(&op).unwrap());
                }
            }
        }
    }
}

fn run_singleton_script(singleton: &mut CrdtSingleton<String>, actor: &str, edits: &[Edit]) {
    for edit in edits {
        let op = match edit {
            Edit::Add(id) => SingletonOperation::Update {
                actor: actor.into(),
                clock: singleton.version_map().incremented(actor),
                value: format!("item-{id}"),
            },
            Edit::Remove(_) => SingletonOperation::Clear {
                actor: actor.into(),
                clock: singleton.version_map(),
            },
        };
        assert!(singleton.apply_operation(&op).unwrap());
    }
}

fn replay<M: CrdtModel>(
    model: &mut M,
    change: &CrdtChange<M::Data, M::Operation>,
) -> Result<(), TestCaseError> {
    match change {
        CrdtChange::Operations(ops) => {
            for op in ops {
                prop_assert!(model.apply_operation(op).unwrap(), "rejected {:?}", op);
            }
        }
        CrdtChange::Data(data) => model.update_data(data.clone()),
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(Config {
        cases: 128,
        ..Config::default()
    })]

    #[test]
    fn set_replicas_converge(
        shared in script(6),
        left in script(10),
        right in script(10),
    ) {
        let mut a = CrdtSet::new();
        run_set_script(&mut a, "S", &shared);
        let mut b = a.clone();
        run_set_script(&mut a, "A", &left);
        run_set_script(&mut b, "B", &right);

        let changes = a.merge(&b.data()).unwrap();
        replay(&mut b, &changes.other_change)?;
        prop_assert_eq!(a.data(), b.data());
    }

    #[test]
    fn set_merge_is_idempotent(edits in script(12)) {
        let mut set = CrdtSet::new();
        run_set_script(&mut set, "A", &edits);
        let snapshot = set.data();
        let changes = set.merge(&snapshot).unwrap();
        prop_assert!(changes.model_change.is_empty());
        prop_assert!(changes.other_change.is_empty());
        prop_assert_eq!(set.data(), snapshot);
    }

    #[test]
    fn add_only_merge_simplifies_to_one_add_each(
        shared in script(6),
        ids in prop::collection::btree_set(10u8..40, 1..8),
    ) {
        let mut ahead = CrdtSet::new();
        run_set_script(&mut ahead, "S", &shared);
        let mut behind = ahead.clone();
        let adds: Vec<Edit> = ids.iter().copied().map(Edit::Add).collect();
        run_set_script(&mut ahead, "A", &adds);

        let changes = ahead.merge(&behind.data()).unwrap();
        let ops = changes.other_change.operations().unwrap();
        prop_assert_eq!(ops.len(), adds.len());
        prop_assert!(
            ops.iter().all(|op| matches!(op, SetOperation::Add { .. })),
            "expected only Add operations"
        );
        replay(&mut behind, &changes.other_change)?;
        prop_assert_eq!(ahead.data(), behind.data());
    }

    #[test]
    fn singleton_replicas_converge(
        shared in script(4),
        left in script(6),
        right in script(6),
    ) {
        let mut a = CrdtSingleton::new();
        run_singleton_script(&mut a, "S", &shared);
        let mut b = a.clone();
        run_singleton_script(&mut a, "A", &left);
        run_singleton_script(&mut b, "B", &right);

        let changes = a.merge(&b.data()).unwrap();
        replay(&mut b, &changes.other_change)?;
        prop_assert_eq!(a.data(), b.data());
        prop_assert_eq!(a.particle_view(), b.particle_view());
    }

    #[test]
    fn counter_replicas_converge(
        shared in prop::collection::vec(1u64..50, 0..4),
        left in prop::collection::vec(1u64..50, 0..6),
        right in prop::collection::vec(1u64..50, 0..6),
    ) {
        fn bump(count: &mut CrdtCount, actor: &str, deltas: &[u64]) {
            for &value in deltas {
                let from = count.version_map().get(actor);
                let op = CountOperation::MultiIncrement {
                    actor: actor.into(),
                    version: VersionRange::new(from, from + 1),
                    value,
                };
                assert!(count.apply_operation(&op).unwrap());
            }
        }

        let mut a = CrdtCount::new();
        bump(&mut a, "S", &shared);
        let mut b = a.clone();
        bump(&mut a, "A", &left);
        bump(&mut b, "B", &right);

        let expected: u64 = shared.iter().chain(&left).chain(&right).sum();
        let changes = a.merge(&b.data()).unwrap();
        replay(&mut b, &changes.other_change)?;
        prop_assert_eq!(a.data(), b.data());
        prop_assert_eq!(a.particle_view(), expected);
    }
}

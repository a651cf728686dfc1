//! Randomized sweeps of the universal handle invariants: weak severing,
//! the dependent closure, and relocation correctness after a full cycle.

use proptest::prelude::*;

use holdfast::test_utils::{run_gc_cycle, TestHeap, TestRuntime};
use holdfast::{HandleConfig, HandleStore, HandleType, ObjectPtr, PromotionHooks};

const OBJECT_STRIDE: usize = 0x100;

fn object(id: usize) -> ObjectPtr {
    ObjectPtr::from_usize(0x10_0000 + id * OBJECT_STRIDE)
}

#[derive(Debug, Clone)]
struct Population {
    /// (object id, survives tracing)
    weak_short: Vec<(usize, bool)>,
    weak_long: Vec<(usize, bool)>,
    strong: Vec<usize>,
    pinned: Vec<usize>,
    /// (primary id, secondary id, primary survives)
    dependent: Vec<(usize, usize, bool)>,
    /// object ids with a planned relocation to id + relocation_offset
    relocated: Vec<usize>,
}

fn population() -> impl Strategy<Value = Population> {
    (
        prop::collection::vec((0..32usize, any::<bool>()), 0..8),
        prop::collection::vec((32..64usize, any::<bool>()), 0..8),
        prop::collection::vec(64..96usize, 0..8),
        prop::collection::vec(96..128usize, 0..4),
        prop::collection::vec((128..160usize, 160..192usize, any::<bool>()), 0..6),
        prop::collection::vec(0..192usize, 0..16),
    )
        .prop_map(
            |(weak_short, weak_long, strong, pinned, dependent, relocated)| Population {
                weak_short,
                weak_long,
                strong,
                pinned,
                dependent,
                relocated,
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn full_cycle_preserves_handle_invariants(pop in population()) {
        let store = HandleStore::new(HandleConfig::default()).unwrap();
        let heap = TestHeap::new(1);
        let runtime = TestRuntime::new();
        let relocation_offset = 0x80_0000;

        let mut weak_handles = Vec::new();
        for &(id, survives) in pop.weak_short.iter() {
            let handle = store.create_handle(HandleType::WeakShort, object(id)).unwrap();
            if survives {
                heap.mark_promoted(object(id));
            }
            weak_handles.push((handle, id));
        }
        for &(id, survives) in pop.weak_long.iter() {
            let handle = store.create_handle(HandleType::WeakLong, object(id)).unwrap();
            if survives {
                heap.mark_promoted(object(id));
            }
            weak_handles.push((handle, id));
        }

        let mut strong_handles = Vec::new();
        for &id in pop.strong.iter() {
            strong_handles.push((store.create_handle(HandleType::Strong, object(id)).unwrap(), id));
        }
        let mut pinned_handles = Vec::new();
        for &id in pop.pinned.iter() {
            pinned_handles.push((store.create_handle(HandleType::Pinned, object(id)).unwrap(), id));
        }
        let mut dependent_handles = Vec::new();
        for &(primary, secondary, survives) in pop.dependent.iter() {
            let handle = store
                .create_dependent_handle(object(primary), object(secondary))
                .unwrap();
            if survives {
                heap.mark_promoted(object(primary));
            }
            dependent_handles.push((handle, primary, secondary, survives));
        }

        for &id in pop.relocated.iter() {
            let from = object(id);
            let to = ObjectPtr::from_usize(from.as_usize() + relocation_offset);
            heap.plan_relocation(from, to);
        }
        let planned: std::collections::HashSet<usize> = pop.relocated.iter().copied().collect();
        let final_address = |id: usize| {
            if planned.contains(&id) && !pop.pinned.contains(&id) {
                ObjectPtr::from_usize(object(id).as_usize() + relocation_offset)
            } else {
                object(id)
            }
        };

        run_gc_cycle(&store, &heap, &runtime, 2, 2, 1);

        // Weak handles: severed iff the referent did not survive; the
        // survivors track relocation. The same id can appear under both
        // weak strengths, so the oracle is the source of truth.
        for (handle, id) in weak_handles {
            if heap.is_promoted(object(id)) {
                prop_assert_eq!(handle.object(), final_address(id));
            } else {
                prop_assert!(handle.object().is_null());
            }
        }

        // Strong handles always survive at the post-GC address.
        for (handle, id) in strong_handles {
            prop_assert!(heap.is_promoted(object(id)));
            prop_assert_eq!(handle.object(), final_address(id));
        }

        // Pinned referents keep their pre-GC address.
        for (handle, id) in pinned_handles {
            prop_assert_eq!(handle.object(), object(id));
        }

        // Dependent closure: promoted(primary) implies promoted(secondary);
        // dead primaries clear both words.
        for (handle, primary, secondary, survives) in dependent_handles {
            if heap.is_promoted(object(primary)) {
                prop_assert!(heap.is_promoted(object(secondary)));
                prop_assert_eq!(handle.object(), final_address(primary));
            } else {
                let _ = survives;
                prop_assert!(handle.object().is_null());
                prop_assert_eq!(handle.extra_info(), 0);
            }
        }
    }

    #[test]
    fn weak_interior_offsets_survive_any_relocation(
        base in 1usize..1000,
        offset in 0usize..0x100,
        delta in 1usize..0x1000,
        survives in any::<bool>(),
    ) {
        let store = HandleStore::new(HandleConfig::default()).unwrap();
        let heap = TestHeap::new(1);
        let runtime = TestRuntime::new();

        let from = ObjectPtr::from_usize(base * 0x1000);
        let handle = store
            .create_weak_interior_handle(from, from.as_usize() + offset)
            .unwrap();
        if survives {
            heap.mark_promoted(from);
        }
        heap.plan_relocation(from, ObjectPtr::from_usize(from.as_usize() + delta * 8));

        run_gc_cycle(&store, &heap, &runtime, 2, 2, 1);

        if survives {
            prop_assert_eq!(
                handle.extra_info() - handle.object().as_usize(),
                offset,
                "interior offset must be preserved",
            );
        } else {
            prop_assert!(handle.object().is_null());
        }
    }
}

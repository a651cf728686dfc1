//! Shared test fixtures: a scripted collector, a scripted interop
//! runtime, an event-recording sink, and drivers that run phases across
//! parallel workers the way a real collector would.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::bridge::BridgeProcessingArgs;
use crate::hooks::{HandleEventSink, PromoteFlags, PromotionHooks, RootFlags, RuntimeHooks};
use crate::store::HandleStore;
use crate::types::{ObjectPtr, ScanContext};

/// A scripted promotion oracle and relocator.
///
/// Tests pre-plan relocations and optionally pre-mark promoted objects;
/// `promote` marks (unless auto-marking is disabled), applies the planned
/// relocation, and honors pinning by cancelling the referent's pending
/// move.
///
/// # Examples
///
/// ```
/// use holdfast::test_utils::TestHeap;
/// use holdfast::{ObjectPtr, PromotionHooks, PromoteFlags, ScanContext};
///
/// let heap = TestHeap::new(1);
/// heap.plan_relocation(ObjectPtr::from_usize(0x100), ObjectPtr::from_usize(0x900));
///
/// let mut obj = ObjectPtr::from_usize(0x100);
/// heap.promote(&mut obj, &ScanContext::solo(), PromoteFlags::empty());
/// assert_eq!(obj.as_usize(), 0x900);
/// assert!(heap.is_promoted(ObjectPtr::from_usize(0x100)));
/// ```
pub struct TestHeap {
    promoted: DashSet<usize>,
    relocations: DashMap<usize, usize>,
    pinned: DashSet<usize>,
    promoted_bytes: Vec<AtomicUsize>,
    promote_calls: AtomicUsize,
    auto_mark: AtomicBool,
    /// Bytes charged per first-time promotion.
    pub object_size: usize,
}

impl TestHeap {
    pub fn new(workers: usize) -> TestHeap {
        TestHeap {
            promoted: DashSet::new(),
            relocations: DashMap::new(),
            pinned: DashSet::new(),
            promoted_bytes: (0..workers.max(1)).map(|_| AtomicUsize::new(0)).collect(),
            promote_calls: AtomicUsize::new(0),
            auto_mark: AtomicBool::new(true),
            object_size: 64,
        }
    }

    /// Pre-mark an object as promoted, as if tracing had reached it.
    pub fn mark_promoted(&self, obj: ObjectPtr) {
        self.promoted.insert(obj.as_usize());
    }

    /// Plan to move `from` to `to` during relocation.
    pub fn plan_relocation(&self, from: ObjectPtr, to: ObjectPtr) {
        self.relocations.insert(from.as_usize(), to.as_usize());
    }

    /// When disabled, `promote` relocates but leaves the promoted set to
    /// the test: the oracle stays exactly as scripted.
    pub fn set_auto_mark(&self, enabled: bool) {
        self.auto_mark.store(enabled, Ordering::Relaxed);
    }

    pub fn was_pinned(&self, obj: ObjectPtr) -> bool {
        self.pinned.contains(&obj.as_usize())
    }

    pub fn promote_calls(&self) -> usize {
        self.promote_calls.load(Ordering::Relaxed)
    }
}

impl PromotionHooks for TestHeap {
    fn is_promoted(&self, obj: ObjectPtr) -> bool {
        obj.is_null() || self.promoted.contains(&obj.as_usize())
    }

    fn promote(&self, obj: &mut ObjectPtr, sc: &ScanContext, flags: PromoteFlags) {
        if obj.is_null() {
            return;
        }
        self.promote_calls.fetch_add(1, Ordering::Relaxed);
        if self.auto_mark.load(Ordering::Relaxed) && self.promoted.insert(obj.as_usize()) {
            self.promoted_bytes[sc.thread_number % self.promoted_bytes.len()]
                .fetch_add(self.object_size, Ordering::Relaxed);
        }
        if flags.contains(PromoteFlags::PINNED) {
            self.pinned.insert(obj.as_usize());
            self.relocations.remove(&obj.as_usize());
        } else if let Some(to) = self.relocations.get(&obj.as_usize()) {
            let to = *to;
            // Both addresses name the same promoted object.
            self.promoted.insert(to);
            *obj = ObjectPtr::from_usize(to);
        }
    }

    fn promoted_bytes(&self, worker: usize) -> usize {
        self.promoted_bytes[worker % self.promoted_bytes.len()].load(Ordering::Relaxed)
    }
}

/// A scripted interop runtime recording every callback it receives.
#[derive(Default)]
pub struct TestRuntime {
    /// Referents whose external reference count holds them alive.
    pub live_ref_counts: DashSet<usize>,
    /// Async-pinned payload graph: promoting a key walks to its value.
    pub async_pinned_children: DashMap<usize, usize>,
    walked_async: Mutex<Vec<usize>>,
    bridge_args: Mutex<Vec<BridgeProcessingArgs>>,
    syncblock_scans: AtomicUsize,
}

impl TestRuntime {
    pub fn new() -> TestRuntime {
        TestRuntime::default()
    }

    pub fn walked_async(&self) -> Vec<usize> {
        self.walked_async.lock().clone()
    }

    pub fn bridge_args(&self) -> Vec<BridgeProcessingArgs> {
        self.bridge_args.lock().clone()
    }

    pub fn syncblock_scans(&self) -> usize {
        self.syncblock_scans.load(Ordering::Relaxed)
    }
}

impl RuntimeHooks for TestRuntime {
    fn ref_counted_is_live(&self, obj: ObjectPtr) -> bool {
        self.live_ref_counts.contains(&obj.as_usize())
    }

    fn walk_async_pinned(&self, obj: ObjectPtr, sc: &ScanContext, heap: &dyn PromotionHooks) {
        self.walked_async.lock().push(obj.as_usize());
        if let Some(child) = self.async_pinned_children.get(&obj.as_usize()) {
            let mut child = ObjectPtr::from_usize(*child);
            heap.promote(&mut child, sc, PromoteFlags::empty());
        }
    }

    fn trigger_bridge_processing(&self, args: &BridgeProcessingArgs) {
        self.bridge_args.lock().push(args.clone());
    }

    fn syncblock_weak_scan(&self, _sc: &ScanContext, _heap: &dyn PromotionHooks) {
        self.syncblock_scans.fetch_add(1, Ordering::Relaxed);
    }
}

/// One recorded root visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootEvent {
    pub primary: ObjectPtr,
    pub secondary: ObjectPtr,
    pub flags: RootFlags,
    pub is_dependent: bool,
}

/// Event sink that records every visit for later assertions.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<RootEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> CollectingEventSink {
        CollectingEventSink::default()
    }

    pub fn events(&self) -> Vec<RootEvent> {
        self.events.lock().clone()
    }
}

impl HandleEventSink for CollectingEventSink {
    fn visit_root(
        &self,
        primary: ObjectPtr,
        secondary: ObjectPtr,
        flags: RootFlags,
        is_dependent: bool,
        _sc: &ScanContext,
    ) {
        self.events.lock().push(RootEvent {
            primary,
            secondary,
            flags,
            is_dependent,
        });
    }
}

/// Run `f` once per stop-the-world worker, each with its own
/// [`ScanContext`], and wait for all of them. This is the phase barrier
/// a real collector would impose.
pub fn run_workers<F>(thread_count: usize, f: F)
where
    F: Fn(&ScanContext) + Sync,
{
    rayon::scope(|scope| {
        for thread_number in 0..thread_count {
            let f = &f;
            scope.spawn(move |_| {
                let sc = ScanContext::worker(thread_number, thread_count);
                f(&sc);
            });
        }
    });
}

/// Drive the full handle phase order of one stop-the-world GC: pin,
/// strong (+ ref-counted), the dependent promotion loop, weak-long check,
/// weak-short check, dependent clearing, pinned relocation, normal
/// relocation, interior/dependent relocation, age.
pub fn run_gc_cycle(
    store: &HandleStore,
    heap: &TestHeap,
    runtime: &TestRuntime,
    condemned: u32,
    max_gen: u32,
    thread_count: usize,
) {
    run_workers(thread_count, |sc| {
        store.trace_pinning_roots(condemned, max_gen, sc, heap, Some(runtime));
    });
    run_workers(thread_count, |sc| {
        store.trace_normal_roots(condemned, max_gen, sc, heap, Some(runtime));
    });
    if condemned >= max_gen {
        run_workers(thread_count, |sc| {
            store.scan_sized_ref_handles(max_gen, max_gen, sc, heap);
        });
    }
    run_workers(thread_count, |sc| {
        store.prepare_dependent_scan(condemned, max_gen, sc);
    });
    // The collector's outer fixed point: rescan while any worker promoted.
    loop {
        let any_promotions = AtomicBool::new(false);
        run_workers(thread_count, |sc| {
            if store.scan_dependent_handles_for_promotion(sc, heap) {
                any_promotions.store(true, Ordering::Release);
            }
        });
        if !any_promotions.load(Ordering::Acquire) {
            break;
        }
    }
    run_workers(thread_count, |sc| {
        store.check_reachable(condemned, max_gen, sc, heap, Some(runtime));
    });
    run_workers(thread_count, |sc| {
        store.check_alive(condemned, max_gen, sc, heap, Some(runtime));
    });
    run_workers(thread_count, |sc| {
        store.scan_dependent_handles_for_clearing(condemned, max_gen, sc, heap);
    });
    run_workers(thread_count, |sc| {
        store.update_pinned_pointers(condemned, max_gen, sc, heap, Some(runtime));
    });
    run_workers(thread_count, |sc| {
        store.update_pointers(condemned, max_gen, sc, heap, Some(runtime));
    });
    run_workers(thread_count, |sc| {
        store.scan_weak_interior_pointers_for_relocation(condemned, max_gen, sc, heap);
    });
    run_workers(thread_count, |sc| {
        store.scan_dependent_handles_for_relocation(condemned, max_gen, sc, heap);
    });
    run_workers(thread_count, |sc| {
        store.age_handles(condemned, max_gen, sc);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_pins_cancel_relocation() {
        let heap = TestHeap::new(1);
        let obj = ObjectPtr::from_usize(0x100);
        heap.plan_relocation(obj, ObjectPtr::from_usize(0x200));

        let mut pinned = obj;
        heap.promote(&mut pinned, &ScanContext::solo(), PromoteFlags::PINNED);
        assert_eq!(pinned, obj);
        assert!(heap.was_pinned(obj));

        let mut again = obj;
        heap.promote(&mut again, &ScanContext::solo(), PromoteFlags::empty());
        assert_eq!(again, obj, "cancelled relocation must not come back");
    }

    #[test]
    fn test_heap_counts_promoted_bytes_once() {
        let heap = TestHeap::new(2);
        let sc = ScanContext::worker(1, 2);
        let mut obj = ObjectPtr::from_usize(0x100);
        heap.promote(&mut obj, &sc, PromoteFlags::empty());
        heap.promote(&mut obj, &sc, PromoteFlags::empty());
        assert_eq!(heap.promoted_bytes(1), heap.object_size);
        assert_eq!(heap.promoted_bytes(0), 0);
    }

    #[test]
    fn workers_all_run() {
        let counter = AtomicUsize::new(0);
        run_workers(4, |sc| {
            assert!(sc.thread_number < sc.thread_count);
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }
}

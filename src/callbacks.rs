//! Per-type scan callbacks: the behaviour that makes each handle type
//! what it is.
//!
//! Every callback receives the slot being visited, the worker's scan
//! context, and a [`ScanEnv`] carrying the collector's promotion hooks
//! plus whatever the current phase threads through (dependent context,
//! variable-strength mask, bridge accumulator, event sink).

use tracing::trace;

use crate::bridge::BridgeAccumulator;
use crate::dependent::DhContext;
use crate::hooks::{HandleEventSink, PromoteFlags, PromotionHooks, RootFlags, RuntimeHooks};
use crate::slots::HandleSlot;
use crate::types::{HandleType, ObjectPtr, ScanContext, StrengthMask};

/// A per-slot scan procedure.
pub type HandleScanProc = fn(&HandleSlot, &ScanContext, &ScanEnv<'_>);

/// Phase-scoped environment threaded through a dispatcher call.
pub struct ScanEnv<'a> {
    pub heap: &'a dyn PromotionHooks,
    pub runtime: Option<&'a dyn RuntimeHooks>,
    pub dh: Option<&'a DhContext>,
    /// Strengths a variable handle must intersect for the inner callback
    /// to run.
    pub variable_mask: StrengthMask,
    /// Callback delegated to by [`variable_dispatch`].
    pub variable_inner: Option<HandleScanProc>,
    pub bridge: Option<&'a BridgeAccumulator>,
    pub events: Option<&'a dyn HandleEventSink>,
}

impl<'a> ScanEnv<'a> {
    pub fn new(heap: &'a dyn PromotionHooks) -> Self {
        ScanEnv {
            heap,
            runtime: None,
            dh: None,
            variable_mask: StrengthMask::empty(),
            variable_inner: None,
            bridge: None,
            events: None,
        }
    }

    pub fn with_runtime(mut self, runtime: Option<&'a dyn RuntimeHooks>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_dependent_context(mut self, dh: &'a DhContext) -> Self {
        self.dh = Some(dh);
        self
    }

    pub fn with_variable_dispatch(mut self, mask: StrengthMask, inner: HandleScanProc) -> Self {
        self.variable_mask = mask;
        self.variable_inner = Some(inner);
        self
    }

    pub fn with_bridge(mut self, bridge: &'a BridgeAccumulator) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_events(mut self, events: &'a dyn HandleEventSink) -> Self {
        self.events = Some(events);
        self
    }
}

/// Promote through the slot's primary word, writing back a relocated
/// address. A store-back that loses to a racing mutator write is dropped;
/// the mutator's write barrier covers the value it stored.
fn promote_through_slot(
    slot: &HandleSlot,
    sc: &ScanContext,
    env: &ScanEnv<'_>,
    flags: PromoteFlags,
) -> ObjectPtr {
    let old = slot.load_object();
    if old.is_null() {
        return old;
    }
    let mut obj = old;
    env.heap.promote(&mut obj, sc, flags);
    if obj != old {
        slot.cas_object(old, obj);
    }
    obj
}

/// Strong handles (and strong-scanned sized refs, variable handles, and
/// cross references): promote the referent.
pub fn promote_object(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    promote_through_slot(slot, sc, env, PromoteFlags::empty());
}

/// Pinned handles: promote with the pinning flag so the referent keeps
/// its address for the rest of the cycle.
pub fn pin_object(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let obj = slot.load_object();
    if !obj.is_null() {
        trace!(obj = obj.as_usize(), "handle causes pinning");
    }
    promote_through_slot(slot, sc, env, PromoteFlags::PINNED);
}

/// Async-pinned handles: promote, then let the runtime walk the roots
/// reachable only through the pinned payload.
pub fn pin_async_object(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let obj = promote_through_slot(slot, sc, env, PromoteFlags::empty());
    if obj.is_null() {
        return;
    }
    if let Some(runtime) = env.runtime {
        runtime.walk_async_pinned(obj, sc, env.heap);
    }
}

/// Ref-counted handles: promote only when the interop runtime says the
/// external count is holding the referent alive. Never runs concurrently
/// with mutators.
pub fn promote_ref_counted(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    assert!(
        !sc.concurrent,
        "ref-counted handles must not be scanned concurrently"
    );
    let obj = slot.load_object();
    if obj.is_null() || env.heap.is_promoted(obj) {
        return;
    }
    let Some(runtime) = env.runtime else {
        return;
    };
    if runtime.ref_counted_is_live(obj) {
        let mut tmp = obj;
        env.heap.promote(&mut tmp, sc, PromoteFlags::empty());
        // The mark phase never relocates, so the temporary must be
        // untouched; the slot is rewritten in the update phase.
        debug_assert_eq!(tmp, obj);
    }
}

/// Weak handles: sever the reference when the referent was not promoted.
pub fn check_promoted(slot: &HandleSlot, _sc: &ScanContext, env: &ScanEnv<'_>) {
    let obj = slot.load_object();
    if obj.is_null() || env.heap.is_promoted(obj) {
        return;
    }
    trace!(obj = obj.as_usize(), "severing weak handle to unreachable object");
    slot.cas_object(obj, ObjectPtr::NULL);
}

/// Dependent handles, promotion pass: a promoted primary drags its
/// secondary along; an unpromoted primary forces another round.
pub fn promote_dependent(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let Some(dh) = env.dh else {
        debug_assert!(false, "dependent scan without a context");
        return;
    };
    let primary = slot.load_object();
    if primary.is_null() {
        return;
    }
    if env.heap.is_promoted(primary) {
        let secondary = ObjectPtr::from_usize(slot.load_extra());
        if !env.heap.is_promoted(secondary) {
            trace!(secondary = secondary.as_usize(), "promoting dependent secondary");
            let mut obj = secondary;
            env.heap.promote(&mut obj, sc, PromoteFlags::empty());
            slot.store_extra(obj.as_usize());
            // A promoted secondary may itself be the primary of another
            // handle, possibly on another worker's stripe; flag a rescan.
            dh.note_promotion();
        }
    } else {
        dh.note_unpromoted_primary();
    }
}

/// Dependent handles, clearing pass: null both words of every handle
/// whose primary did not survive.
pub fn clear_dependent(slot: &HandleSlot, _sc: &ScanContext, env: &ScanEnv<'_>) {
    let primary = slot.load_object();
    if !env.heap.is_promoted(primary) {
        trace!(primary = primary.as_usize(), "clearing dead dependent handle");
        slot.store_object(ObjectPtr::NULL);
        slot.store_extra(0);
    } else {
        debug_assert!(
            env.heap.is_promoted(ObjectPtr::from_usize(slot.load_extra())),
            "promoted primary left an unpromoted secondary behind",
        );
    }
}

/// Relocation pass for non-pinning handles.
pub fn update_pointer(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    promote_through_slot(slot, sc, env, PromoteFlags::empty());
}

/// Relocation pass for pinning handles.
pub fn update_pointer_pinned(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    promote_through_slot(slot, sc, env, PromoteFlags::PINNED);
}

/// Relocation pass for weak interior pointers: shift the stored interior
/// address by however far the primary moved.
pub fn update_weak_interior(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let old = slot.load_object();
    if old.is_null() {
        return;
    }
    let new = promote_through_slot(slot, sc, env, PromoteFlags::empty());
    if new.is_null() {
        return;
    }
    let delta = new.as_usize().wrapping_sub(old.as_usize());
    if delta != 0 {
        let interior = slot.load_extra();
        slot.store_extra(interior.wrapping_add(delta));
    }
}

/// Relocation pass for dependent handles: both words follow their
/// objects.
pub fn update_dependent(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    promote_through_slot(slot, sc, env, PromoteFlags::empty());
    let secondary = ObjectPtr::from_usize(slot.load_extra());
    if secondary.is_null() {
        return;
    }
    let mut obj = secondary;
    env.heap.promote(&mut obj, sc, PromoteFlags::empty());
    if obj != secondary {
        slot.store_extra(obj.as_usize());
    }
}

/// Sized-ref handles on a major collection: bracket the promotion with
/// the worker's promoted-byte counter and record the difference.
pub fn calculate_sized_ref_size(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let begin = env.heap.promoted_bytes(sc.thread_number);
    promote_through_slot(slot, sc, env, PromoteFlags::empty());
    let end = env.heap.promoted_bytes(sc.thread_number);
    slot.store_extra(end - begin);
}

/// Variable handles: read the dynamic strength bits and delegate to the
/// phase's inner callback when they intersect the enable mask.
pub fn variable_dispatch(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let Some(inner) = env.variable_inner else {
        debug_assert!(false, "variable scan without an inner callback");
        return;
    };
    let strength = StrengthMask::from_bits_truncate(slot.load_extra() as u32);
    if strength.intersects(env.variable_mask) {
        inner(slot, sc, env);
    }
}

/// Cross-reference handles: register unpromoted primaries with the
/// bridge processor.
pub fn collect_bridge_object(slot: &HandleSlot, _sc: &ScanContext, env: &ScanEnv<'_>) {
    let Some(bridge) = env.bridge else {
        return;
    };
    let primary = slot.load_object();
    if !primary.is_null() && !env.heap.is_promoted(primary) {
        bridge.register(primary, slot.load_extra());
    }
}

/// Diagnostic walk: report the slot to the event sink with root flags
/// composed from the handle type.
pub fn report_root(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let Some(events) = env.events else {
        return;
    };
    let Some(ty) = slot.handle_type() else {
        return;
    };
    let mut flags = RootFlags::empty();
    let mut is_dependent = false;
    match ty {
        HandleType::Dependent => is_dependent = true,
        HandleType::WeakShort | HandleType::WeakLong | HandleType::WeakNativeInterop => {
            flags |= RootFlags::WEAK;
        }
        HandleType::WeakInteriorPointer => {
            flags |= RootFlags::WEAK | RootFlags::INTERIOR;
        }
        HandleType::Strong | HandleType::SizedRef | HandleType::CrossReference => {}
        HandleType::Pinned | HandleType::AsyncPinned => flags |= RootFlags::PINNING,
        HandleType::Variable => {
            let strength = StrengthMask::from_bits_truncate(slot.load_extra() as u32);
            if strength.intersects(StrengthMask::WEAK_SHORT | StrengthMask::WEAK_LONG) {
                flags |= RootFlags::WEAK;
            }
            if strength.contains(StrengthMask::PINNED) {
                flags |= RootFlags::PINNING;
            }
        }
        HandleType::RefCounted => {
            flags |= RootFlags::REF_COUNTED;
            let obj = slot.load_object();
            if !obj.is_null() {
                let live = env
                    .runtime
                    .map(|rt| rt.ref_counted_is_live(obj))
                    .unwrap_or(true);
                if !live {
                    flags |= RootFlags::WEAK;
                }
            }
        }
    }
    let secondary = if is_dependent {
        ObjectPtr::from_usize(slot.load_extra())
    } else {
        ObjectPtr::NULL
    };
    events.visit_root(slot.load_object(), secondary, flags, is_dependent, sc);
}

/// Diagnostic walk over dependent handles: only pairs with a live
/// secondary are interesting to report.
pub fn report_dependent_root(slot: &HandleSlot, sc: &ScanContext, env: &ScanEnv<'_>) {
    let primary = slot.load_object();
    let secondary = slot.load_extra();
    debug_assert!(
        secondary == 0 || !primary.is_null(),
        "non-null secondary requires a non-null primary",
    );
    if !primary.is_null() && secondary != 0 {
        report_root(slot, sc, env);
    }
}

//! Interfaces supplied and observed by the host runtime.
//!
//! The handle subsystem never traces, marks, or moves objects itself.
//! Everything it needs from the collector and the interop runtime comes
//! through the traits here, and everything diagnostics need from it goes
//! out through [`HandleEventSink`].

use bitflags::bitflags;

use crate::bridge::BridgeProcessingArgs;
use crate::types::{ObjectPtr, ScanContext};

bitflags! {
    /// Flags passed to [`PromotionHooks::promote`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PromoteFlags: u32 {
        /// The referent must not be relocated during this GC.
        const PINNED = 1 << 0;
    }
}

bitflags! {
    /// Root classification reported to the event sink, composed from the
    /// handle type being visited.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RootFlags: u32 {
        const WEAK = 1 << 0;
        const PINNING = 1 << 1;
        const REF_COUNTED = 1 << 2;
        const INTERIOR = 1 << 3;
    }
}

/// The collector's promotion oracle and relocation callback.
///
/// `is_promoted` must treat the null reference as trivially promoted;
/// callbacks rely on that to skip cleared slots without special cases.
pub trait PromotionHooks: Send + Sync {
    /// Whether the collector has already promoted `obj` in this cycle.
    fn is_promoted(&self, obj: ObjectPtr) -> bool;

    /// Mark `obj` reachable and, during relocation phases, rewrite it to
    /// the referent's post-GC address. With [`PromoteFlags::PINNED`] the
    /// referent must keep its current address for the rest of the cycle.
    fn promote(&self, obj: &mut ObjectPtr, sc: &ScanContext, flags: PromoteFlags);

    /// Bytes promoted so far by the given worker. Consumed by the
    /// sized-ref size calculation.
    fn promoted_bytes(&self, worker: usize) -> usize {
        let _ = worker;
        0
    }
}

/// Callbacks into the wider runtime for the handle types whose semantics
/// it owns. Every method has a conservative default so hosts without
/// interop features can supply an empty impl.
pub trait RuntimeHooks: Send + Sync {
    /// Whether a ref-counted handle's referent is currently held alive by
    /// its external reference count.
    fn ref_counted_is_live(&self, obj: ObjectPtr) -> bool {
        let _ = obj;
        true
    }

    /// Reach the additional roots stored inside an async-pinned payload,
    /// promoting each through `heap`.
    fn walk_async_pinned(&self, obj: ObjectPtr, sc: &ScanContext, heap: &dyn PromotionHooks) {
        let _ = (obj, sc, heap);
    }

    /// Hand the collected cross-reference graph to the foreign collector.
    fn trigger_bridge_processing(&self, args: &BridgeProcessingArgs) {
        let _ = args;
    }

    /// Scan the host's syncblock weak-pointer cache. Invoked by exactly
    /// one elected worker per GC.
    fn syncblock_weak_scan(&self, sc: &ScanContext, heap: &dyn PromotionHooks) {
        let _ = (sc, heap);
    }
}

/// Sink for per-visit root events consumed by profilers and telemetry.
pub trait HandleEventSink: Send + Sync {
    /// One live handle visited during a diagnostic walk. `secondary` is
    /// non-null only when `is_dependent` is set.
    fn visit_root(
        &self,
        primary: ObjectPtr,
        secondary: ObjectPtr,
        flags: RootFlags,
        is_dependent: bool,
        sc: &ScanContext,
    );
}

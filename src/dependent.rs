//! Dependent-handle scan contexts and the promotion fixed point.
//!
//! A dependent handle models "secondary is live iff primary is live"
//! without a strong back-edge: the secondary sits in the extra-info word,
//! so the table's own structure can never form a cycle. The dataflow is
//! closed by rescanning until no further secondary promotions happen.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Per-worker state for the dependent-handle promotion scan.
///
/// Each heap worker owns exactly one context for the duration of a GC;
/// the flags are written from that worker's scan callbacks only.
pub struct DhContext {
    condemned: AtomicU32,
    max_gen: AtomicU32,
    promoted_this_round: AtomicBool,
    unpromoted_primaries: AtomicBool,
    rounds: AtomicU32,
}

impl DhContext {
    pub(crate) fn new() -> DhContext {
        DhContext {
            condemned: AtomicU32::new(0),
            max_gen: AtomicU32::new(0),
            promoted_this_round: AtomicBool::new(false),
            unpromoted_primaries: AtomicBool::new(false),
            rounds: AtomicU32::new(0),
        }
    }

    /// Reset the context at the start of a GC's dependent phase.
    pub(crate) fn prepare(&self, condemned: u32, max_gen: u32) {
        self.condemned.store(condemned, Ordering::Relaxed);
        self.max_gen.store(max_gen, Ordering::Relaxed);
        self.promoted_this_round.store(false, Ordering::Relaxed);
        self.unpromoted_primaries.store(false, Ordering::Relaxed);
        self.rounds.store(0, Ordering::Relaxed);
    }

    pub(crate) fn condemned(&self) -> u32 {
        self.condemned.load(Ordering::Relaxed)
    }

    pub(crate) fn max_gen(&self) -> u32 {
        self.max_gen.load(Ordering::Relaxed)
    }

    /// Record that this round promoted a secondary.
    pub fn note_promotion(&self) {
        self.promoted_this_round.store(true, Ordering::Release);
    }

    /// Record that this round saw a live primary that is not (yet)
    /// promoted.
    pub fn note_unpromoted_primary(&self) {
        self.unpromoted_primaries.store(true, Ordering::Release);
    }

    fn begin_round(&self) {
        self.promoted_this_round.store(false, Ordering::Relaxed);
        self.unpromoted_primaries.store(false, Ordering::Relaxed);
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    fn promoted_this_round(&self) -> bool {
        self.promoted_this_round.load(Ordering::Acquire)
    }

    fn unpromoted_primaries(&self) -> bool {
        self.unpromoted_primaries.load(Ordering::Acquire)
    }

    /// Rounds executed by the most recent fixed-point scan.
    pub fn rounds(&self) -> u32 {
        self.rounds.load(Ordering::Relaxed)
    }
}

/// Run `scan_pass` until neither rescan condition holds: at least one
/// unpromoted primary remains *and* the last round promoted something
/// (which could have promoted such a primary). Returns whether any round
/// promoted a secondary; the collector ORs the per-worker results into
/// its outer fixed point, since a secondary promoted here can satisfy a
/// dependent primary on another worker's stripe.
pub(crate) fn run_promotion_fixpoint(ctx: &DhContext, mut scan_pass: impl FnMut()) -> bool {
    let mut any_promotions = false;
    loop {
        ctx.begin_round();
        scan_pass();
        if ctx.promoted_this_round() {
            any_promotions = true;
        }
        if !(ctx.unpromoted_primaries() && ctx.promoted_this_round()) {
            return any_promotions;
        }
    }
}

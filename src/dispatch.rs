//! The scan dispatcher: walks the directory, selects CPU slots by
//! striding across heap-worker identity, and drives the table scan with a
//! typed callback.

use bitflags::bitflags;

use crate::bucket::HandleBucket;
use crate::callbacks::{HandleScanProc, ScanEnv};
use crate::directory::BucketDirectory;
use crate::slots::HandleTable;
use crate::types::{ScanContext, TypeMask};

bitflags! {
    /// Modifiers for a dispatcher call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanFlags: u32 {
        /// The collector is running concurrently with mutators; callbacks
        /// must tolerate racing object reads.
        const ASYNC = 1 << 0;
        /// The callback consumes the slot's extra-info word.
        const EXTRA_INFO = 1 << 1;
        /// Not a visiting pass: update the age map instead.
        const AGE = 1 << 2;
    }
}

impl ScanFlags {
    /// Default synchronous scan.
    pub const NORMAL: ScanFlags = ScanFlags::empty();

    pub(crate) fn for_context(sc: &ScanContext) -> ScanFlags {
        if sc.concurrent {
            ScanFlags::ASYNC
        } else {
            ScanFlags::NORMAL
        }
    }
}

/// One dispatcher call: which types to visit, the generation window, and
/// the scan modifiers.
#[derive(Debug, Clone, Copy)]
pub struct ScanSpec {
    pub types: TypeMask,
    pub condemned: u32,
    pub max_gen: u32,
    pub flags: ScanFlags,
}

/// Striding start/step for a parallel phase. With more than one CPU slot
/// each worker takes the tables `w, w + thread_count, ...`, partitioning
/// the bucket; single-slot stores collapse to worker zero's view.
fn stride(slot_count: usize, sc: &ScanContext) -> (usize, usize) {
    if slot_count > 1 {
        (sc.thread_number, sc.thread_count.max(1))
    } else {
        (0, 1)
    }
}

/// Visit the tables this worker is responsible for in every bucket.
pub(crate) fn for_each_striped_table(
    directory: &BucketDirectory,
    slot_count: usize,
    sc: &ScanContext,
    mut f: impl FnMut(&HandleTable),
) {
    let (start, step) = stride(slot_count, sc);
    directory.for_each_bucket(|_, bucket: &HandleBucket| {
        let mut cpu = start;
        while cpu < slot_count {
            f(bucket.table(cpu));
            cpu += step;
        }
    });
}

/// Visit every table in every bucket. Used by the single-threaded entry
/// points (profiler walks, interop enumeration, bridge collection).
pub(crate) fn for_each_table(
    directory: &BucketDirectory,
    slot_count: usize,
    mut f: impl FnMut(&HandleTable),
) {
    directory.for_each_bucket(|_, bucket: &HandleBucket| {
        for cpu in 0..slot_count {
            f(bucket.table(cpu));
        }
    });
}

/// Drive `proc` over every matching handle in this worker's stripe.
pub(crate) fn scan_handles(
    directory: &BucketDirectory,
    slot_count: usize,
    sc: &ScanContext,
    spec: ScanSpec,
    proc: HandleScanProc,
    env: &ScanEnv<'_>,
) {
    for_each_striped_table(directory, slot_count, sc, |table| {
        table.scan(spec.types, spec.condemned, spec.max_gen, spec.flags, &mut |slot| {
            proc(slot, sc, env)
        });
    });
}

/// Drive `proc` over every matching handle in every table, ignoring the
/// striding discipline.
pub(crate) fn scan_handles_all_tables(
    directory: &BucketDirectory,
    slot_count: usize,
    sc: &ScanContext,
    spec: ScanSpec,
    proc: HandleScanProc,
    env: &ScanEnv<'_>,
) {
    for_each_table(directory, slot_count, |table| {
        table.scan(spec.types, spec.condemned, spec.max_gen, spec.flags, &mut |slot| {
            proc(slot, sc, env)
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn striding_partitions_tables_across_workers() {
        let slot_count = 8;
        let thread_count = 3;
        let mut visited = vec![0usize; slot_count];
        for worker in 0..thread_count {
            let sc = ScanContext::worker(worker, thread_count);
            let (start, step) = stride(slot_count, &sc);
            let mut cpu = start;
            while cpu < slot_count {
                visited[cpu] += 1;
                cpu += step;
            }
        }
        assert!(visited.iter().all(|&n| n == 1), "{visited:?}");
    }

    #[test]
    fn single_slot_store_collapses_to_worker_zero() {
        for worker in 0..4 {
            let sc = ScanContext::worker(worker, 4);
            assert_eq!(stride(1, &sc), (0, 1));
        }
    }

    #[test]
    fn surplus_workers_get_empty_stripes() {
        let sc = ScanContext::worker(5, 8);
        let (start, step) = stride(2, &sc);
        assert!(start >= 2);
        let _ = step;
    }
}

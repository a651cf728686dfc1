//! The handle-table primitive: one CPU slot's worth of handle storage.
//!
//! A [`HandleTable`] owns fixed-size blocks of slots. Blocks never move
//! once published, so a [`Handle`] (the address of one slot) stays stable
//! for the handle's lifetime. The block vector is RCU-swapped on growth,
//! which lets background scans walk a consistent snapshot while mutators
//! allocate; freed slots recycle through a lock-free queue.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::dispatch::ScanFlags;
use crate::error::{HandleError, HandleResult};
use crate::types::{HandleType, ObjectPtr, TypeMask};

/// Slots added per growth step.
const SLOTS_PER_BLOCK: usize = 64;

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;

/// One handle slot: the primary object word, the extra-info word, and the
/// bookkeeping the scan loop filters on.
pub struct HandleSlot {
    primary: AtomicUsize,
    extra: AtomicUsize,
    state: AtomicU8,
    type_code: AtomicU8,
    age: AtomicU8,
    /// Owning bucket index and CPU slot, set at allocation.
    home_bucket: AtomicU32,
    home_cpu: AtomicU32,
}

impl HandleSlot {
    fn new() -> Self {
        HandleSlot {
            primary: AtomicUsize::new(0),
            extra: AtomicUsize::new(0),
            state: AtomicU8::new(STATE_FREE),
            type_code: AtomicU8::new(0),
            age: AtomicU8::new(0),
            home_bucket: AtomicU32::new(0),
            home_cpu: AtomicU32::new(0),
        }
    }

    pub fn handle_type(&self) -> Option<HandleType> {
        HandleType::from_code(self.type_code.load(Ordering::Relaxed))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LIVE
    }

    pub(crate) fn load_object(&self) -> ObjectPtr {
        ObjectPtr::from_usize(self.primary.load(Ordering::Acquire))
    }

    pub(crate) fn store_object(&self, obj: ObjectPtr) {
        self.primary.store(obj.as_usize(), Ordering::Release);
    }

    /// Store-back used by scan callbacks. Fails (and is dropped) if a
    /// concurrent mutator raced in a different value; the mutator's write
    /// barrier covers the new referent.
    pub(crate) fn cas_object(&self, old: ObjectPtr, new: ObjectPtr) -> bool {
        self.primary
            .compare_exchange(
                old.as_usize(),
                new.as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn load_extra(&self) -> usize {
        self.extra.load(Ordering::Acquire)
    }

    pub(crate) fn store_extra(&self, word: usize) {
        self.extra.store(word, Ordering::Release);
    }

    pub(crate) fn cas_extra(&self, old: usize, new: usize) -> Result<usize, usize> {
        self.extra
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub(crate) fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    pub(crate) fn set_age(&self, age: u8) {
        self.age.store(age, Ordering::Relaxed);
    }

    pub(crate) fn home(&self) -> (u32, u32) {
        (
            self.home_bucket.load(Ordering::Relaxed),
            self.home_cpu.load(Ordering::Relaxed),
        )
    }
}

/// An opaque, copyable identifier for one live handle slot.
///
/// A handle is a non-owning view into its table: it stays valid until it
/// is destroyed or its bucket is torn down, and tearing down a bucket
/// with handles still in use is the host's contract violation, not ours.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    slot: NonNull<HandleSlot>,
}

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub(crate) fn from_slot(slot: &HandleSlot) -> Handle {
        Handle {
            slot: NonNull::from(slot),
        }
    }

    pub(crate) fn slot(&self) -> &HandleSlot {
        // The slot lives inside a block that is never freed while its
        // bucket is installed; see the type-level contract above.
        unsafe { self.slot.as_ref() }
    }

    /// Read the primary object reference.
    pub fn object(&self) -> ObjectPtr {
        self.slot().load_object()
    }

    /// Store the primary object reference.
    ///
    /// A non-null store re-youngs the slot so the next minor collection
    /// rescans it; this is the table-side half of the write barrier.
    pub fn set_object(&self, obj: ObjectPtr) {
        let slot = self.slot();
        if !obj.is_null() {
            slot.set_age(0);
        }
        slot.store_object(obj);
    }

    /// Read the extra-info word.
    pub fn extra_info(&self) -> usize {
        self.slot().load_extra()
    }

    /// Store the extra-info word.
    pub fn set_extra_info(&self, word: usize) {
        self.slot().store_extra(word)
    }

    /// The handle's type. Panics on a slot that has been freed and not
    /// reallocated, which is already undefined use of the handle.
    pub fn handle_type(&self) -> HandleType {
        self.slot()
            .handle_type()
            .expect("handle refers to a freed slot")
    }
}

/// A fixed block of slots. Blocks are allocated once and shared by `Arc`,
/// so slot addresses survive table growth.
struct SlotBlock {
    slots: Box<[HandleSlot]>,
}

impl SlotBlock {
    fn new(len: usize) -> Arc<SlotBlock> {
        Arc::new(SlotBlock {
            slots: (0..len).map(|_| HandleSlot::new()).collect(),
        })
    }

    fn contains(&self, slot: *const HandleSlot) -> bool {
        let base = self.slots.as_ptr();
        let end = unsafe { base.add(self.slots.len()) };
        slot >= base && slot < end
    }
}

/// One CPU slot's handle storage inside a bucket.
pub struct HandleTable {
    cpu_index: u32,
    bucket_index: AtomicU32,
    blocks: ArcSwap<Vec<Arc<SlotBlock>>>,
    free_slots: SegQueue<Handle>,
    grow_lock: Mutex<()>,
    capacity: AtomicUsize,
    live_handles: AtomicUsize,
    max_handles: usize,
}

impl HandleTable {
    pub(crate) fn new(cpu_index: u32, max_handles: usize) -> Arc<HandleTable> {
        Arc::new(HandleTable {
            cpu_index,
            bucket_index: AtomicU32::new(0),
            blocks: ArcSwap::from_pointee(Vec::new()),
            free_slots: SegQueue::new(),
            grow_lock: Mutex::new(()),
            capacity: AtomicUsize::new(0),
            live_handles: AtomicUsize::new(0),
            max_handles,
        })
    }

    pub(crate) fn set_bucket_index(&self, index: u32) {
        self.bucket_index.store(index, Ordering::Release);
    }

    pub fn live_handle_count(&self) -> usize {
        self.live_handles.load(Ordering::Relaxed)
    }

    /// Allocate a slot of the given type.
    pub(crate) fn allocate(
        &self,
        ty: HandleType,
        obj: ObjectPtr,
        extra: usize,
    ) -> HandleResult<Handle> {
        let handle = loop {
            if let Some(handle) = self.free_slots.pop() {
                break handle;
            }
            self.grow()?;
        };
        let slot = handle.slot();
        slot.type_code.store(ty.code(), Ordering::Relaxed);
        slot.set_age(0);
        let bucket = self.bucket_index.load(Ordering::Acquire);
        slot.home_bucket.store(bucket, Ordering::Relaxed);
        slot.home_cpu.store(self.cpu_index, Ordering::Relaxed);
        slot.store_extra(extra);
        slot.store_object(obj);
        slot.state.store(STATE_LIVE, Ordering::Release);
        self.live_handles.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Return a slot to the free list. The slot's contents are cleared
    /// before it becomes reusable.
    pub(crate) fn free(&self, handle: Handle) {
        let slot = handle.slot();
        slot.state.store(STATE_FREE, Ordering::Release);
        slot.store_object(ObjectPtr::NULL);
        slot.store_extra(0);
        self.live_handles.fetch_sub(1, Ordering::Relaxed);
        self.free_slots.push(handle);
    }

    fn grow(&self) -> HandleResult<()> {
        let _guard = self.grow_lock.lock();
        if !self.free_slots.is_empty() {
            return Ok(());
        }
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity.saturating_add(SLOTS_PER_BLOCK) > self.max_handles {
            return Err(HandleError::HandleExhausted);
        }
        let block = SlotBlock::new(SLOTS_PER_BLOCK);
        self.blocks.rcu(|blocks| {
            let mut next = Vec::with_capacity(blocks.len() + 1);
            next.extend(blocks.iter().cloned());
            next.push(Arc::clone(&block));
            next
        });
        self.capacity.store(capacity + SLOTS_PER_BLOCK, Ordering::Relaxed);
        for slot in block.slots.iter() {
            self.free_slots.push(Handle::from_slot(slot));
        }
        Ok(())
    }

    /// Whether `handle` addresses a slot owned by this table.
    pub(crate) fn owns(&self, handle: Handle) -> bool {
        let raw = handle.slot() as *const HandleSlot;
        self.blocks.load().iter().any(|block| block.contains(raw))
    }

    /// Visit every live slot whose type is in `types` and whose age is in
    /// the condemned range. With [`ScanFlags::AGE`] the pass updates the
    /// age map instead of invoking the visitor.
    pub(crate) fn scan(
        &self,
        types: TypeMask,
        condemned: u32,
        max_gen: u32,
        flags: ScanFlags,
        visitor: &mut dyn FnMut(&HandleSlot),
    ) {
        let aging = flags.contains(ScanFlags::AGE);
        let blocks = self.blocks.load();
        for block in blocks.iter() {
            for slot in block.slots.iter() {
                if !self.slot_matches(slot, types, Some(condemned)) {
                    continue;
                }
                if aging {
                    let age = slot.age();
                    if (age as u32) < max_gen {
                        slot.set_age(age + 1);
                    }
                } else {
                    visitor(slot);
                }
            }
        }
    }

    /// Visit every live slot of a matching type regardless of age.
    pub(crate) fn enumerate(&self, types: TypeMask, visitor: &mut dyn FnMut(&HandleSlot)) {
        let blocks = self.blocks.load();
        for block in blocks.iter() {
            for slot in block.slots.iter() {
                if self.slot_matches(slot, types, None) {
                    visitor(slot);
                }
            }
        }
    }

    /// Reset the ages of matching condemned-range slots to zero.
    pub(crate) fn rejuvenate(&self, types: TypeMask, condemned: u32) {
        let blocks = self.blocks.load();
        for block in blocks.iter() {
            for slot in block.slots.iter() {
                if self.slot_matches(slot, types, Some(condemned)) {
                    slot.set_age(0);
                }
            }
        }
    }

    /// Structural audit of matching slots. Violations are precondition
    /// failures and abort the process.
    pub(crate) fn verify(&self, types: TypeMask, condemned: u32, max_gen: u32) {
        let blocks = self.blocks.load();
        for block in blocks.iter() {
            for slot in block.slots.iter() {
                if !self.slot_matches(slot, types, Some(condemned)) {
                    continue;
                }
                assert!(
                    (slot.age() as u32) <= max_gen,
                    "handle age {} exceeds max generation {}",
                    slot.age(),
                    max_gen,
                );
                if slot.handle_type() == Some(HandleType::Dependent)
                    && slot.load_object().is_null()
                {
                    assert_eq!(
                        slot.load_extra(),
                        0,
                        "dependent handle with cleared primary still holds a secondary",
                    );
                }
            }
        }
    }

    fn slot_matches(&self, slot: &HandleSlot, types: TypeMask, condemned: Option<u32>) -> bool {
        if !slot.is_live() {
            return false;
        }
        let Some(ty) = slot.handle_type() else {
            return false;
        };
        if !types.contains_type(ty) {
            return false;
        }
        match condemned {
            Some(limit) => (slot.age() as u32) <= limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_recycles_slots() {
        let table = HandleTable::new(0, usize::MAX);
        let a = table
            .allocate(HandleType::Strong, ObjectPtr::from_usize(0x100), 0)
            .unwrap();
        assert_eq!(a.object().as_usize(), 0x100);
        assert_eq!(table.live_handle_count(), 1);

        table.free(a);
        assert_eq!(table.live_handle_count(), 0);

        let b = table
            .allocate(HandleType::WeakShort, ObjectPtr::from_usize(0x200), 0)
            .unwrap();
        assert_eq!(b.handle_type(), HandleType::WeakShort);
        assert_eq!(b.extra_info(), 0);
    }

    #[test]
    fn capacity_ceiling_reports_exhaustion() {
        let table = HandleTable::new(0, SLOTS_PER_BLOCK);
        for i in 0..SLOTS_PER_BLOCK {
            table
                .allocate(HandleType::Strong, ObjectPtr::from_usize(0x1000 + i), 0)
                .unwrap();
        }
        let err = table
            .allocate(HandleType::Strong, ObjectPtr::from_usize(0x9000), 0)
            .unwrap_err();
        assert_eq!(err, HandleError::HandleExhausted);
    }

    #[test]
    fn scan_filters_type_and_generation() {
        let table = HandleTable::new(0, usize::MAX);
        let strong = table
            .allocate(HandleType::Strong, ObjectPtr::from_usize(0x10), 0)
            .unwrap();
        let weak = table
            .allocate(HandleType::WeakShort, ObjectPtr::from_usize(0x20), 0)
            .unwrap();
        strong.slot().set_age(2);

        let mut seen = Vec::new();
        table.scan(
            TypeMask::STRONG | TypeMask::WEAK_SHORT,
            1,
            2,
            ScanFlags::empty(),
            &mut |slot| seen.push(slot.load_object().as_usize()),
        );
        assert_eq!(seen, vec![0x20]);
        let _ = weak;
    }

    #[test]
    fn age_pass_saturates_at_max_generation() {
        let table = HandleTable::new(0, usize::MAX);
        let h = table
            .allocate(HandleType::Strong, ObjectPtr::from_usize(0x10), 0)
            .unwrap();
        for _ in 0..4 {
            table.scan(TypeMask::STRONG, 2, 2, ScanFlags::AGE, &mut |_| {});
        }
        assert_eq!(h.slot().age(), 2);

        table.rejuvenate(TypeMask::STRONG, 2);
        assert_eq!(h.slot().age(), 0);
    }

    #[test]
    fn non_null_store_re_youngs_slot() {
        let table = HandleTable::new(0, usize::MAX);
        let h = table
            .allocate(HandleType::WeakLong, ObjectPtr::from_usize(0x10), 0)
            .unwrap();
        h.slot().set_age(2);
        h.set_object(ObjectPtr::from_usize(0x20));
        assert_eq!(h.slot().age(), 0);

        h.slot().set_age(2);
        h.set_object(ObjectPtr::NULL);
        assert_eq!(h.slot().age(), 2);
    }

    #[test]
    #[should_panic(expected = "dependent handle with cleared primary")]
    fn verify_rejects_half_cleared_dependent() {
        let table = HandleTable::new(0, usize::MAX);
        let h = table
            .allocate(HandleType::Dependent, ObjectPtr::NULL, 0x30)
            .unwrap();
        let _ = h;
        table.verify(TypeMask::DEPENDENT, 2, 2);
    }
}

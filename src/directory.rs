//! The bucket directory: a linked chain of fixed-size chunks mapping
//! dense indices to live buckets.
//!
//! The head chunk is embedded in the directory; further chunks are
//! heap-allocated and appended by compare-and-swap, so mutators creating
//! buckets never block each other. Slots transition only `empty ->
//! occupied` (CAS) or `occupied -> empty` (store, issued from
//! collector-quiescent paths), never directly between two occupants.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::bucket::HandleBucket;
use crate::error::HandleResult;

struct BucketChunk {
    slots: Box<[AtomicPtr<HandleBucket>]>,
    /// Cumulative index ceiling covered up to and including this chunk.
    max_index: u32,
    next: AtomicPtr<BucketChunk>,
}

impl BucketChunk {
    fn new(capacity: usize, max_index: u32) -> BucketChunk {
        BucketChunk {
            slots: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            max_index,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn base(&self) -> u32 {
        self.max_index - self.slots.len() as u32
    }
}

/// Directory of live buckets. Owns its chunks and one strong reference to
/// every installed bucket.
pub struct BucketDirectory {
    head: BucketChunk,
    capacity: usize,
}

impl BucketDirectory {
    pub(crate) fn new(chunk_capacity: usize) -> BucketDirectory {
        let capacity = chunk_capacity.max(1);
        BucketDirectory {
            head: BucketChunk::new(capacity, capacity as u32),
            capacity,
        }
    }

    /// Install `bucket` into the first empty slot, growing the chain if
    /// every slot is occupied. Returns the bucket's dense index.
    pub(crate) fn acquire_slot(&self, bucket: &Arc<HandleBucket>) -> HandleResult<u32> {
        loop {
            let mut walk = &self.head;
            loop {
                for (i, slot) in walk.slots.iter().enumerate() {
                    if !slot.load(Ordering::Acquire).is_null() {
                        continue;
                    }
                    let index = walk.base() + i as u32;
                    // Stamp the candidate index before publication so the
                    // bucket is fully formed the instant the CAS lands.
                    bucket.set_index(index);
                    let raw = Arc::into_raw(Arc::clone(bucket)) as *mut HandleBucket;
                    match slot.compare_exchange(
                        ptr::null_mut(),
                        raw,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(index),
                        Err(_) => {
                            // Another thread won this slot; keep scanning.
                            unsafe { drop(Arc::from_raw(raw)) };
                        }
                    }
                }
                let next = walk.next.load(Ordering::Acquire);
                if next.is_null() {
                    break;
                }
                walk = unsafe { &*next };
            }
            self.append_chunk(walk);
        }
    }

    /// Append a fresh chunk after `last`. If a rival installs one first
    /// the fresh chunk is discarded and the rival's chain is used.
    fn append_chunk(&self, last: &BucketChunk) {
        let fresh = Box::into_raw(Box::new(BucketChunk::new(
            self.capacity,
            last.max_index + self.capacity as u32,
        )));
        if last
            .next
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unsafe { drop(Box::from_raw(fresh)) };
        }
    }

    fn chunk_for(&self, index: u32) -> Option<(&BucketChunk, usize)> {
        let mut walk = &self.head;
        loop {
            if index < walk.max_index {
                return Some((walk, (index - walk.base()) as usize));
            }
            let next = walk.next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            walk = unsafe { &*next };
        }
    }

    /// Remove `bucket` from its slot. Idempotent: returns `false` when
    /// the slot no longer holds this bucket.
    pub(crate) fn remove(&self, bucket: &HandleBucket) -> bool {
        let index = bucket.index();
        let Some((chunk, offset)) = self.chunk_for(index) else {
            return false;
        };
        let expected = bucket as *const HandleBucket as *mut HandleBucket;
        match chunk.slots[offset].compare_exchange(
            expected,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(raw) => {
                unsafe { drop(Arc::from_raw(raw)) };
                true
            }
            Err(_) => false,
        }
    }

    /// Run `f` against the bucket at `index`, if one is installed.
    pub(crate) fn with_bucket<R>(
        &self,
        index: u32,
        f: impl FnOnce(&HandleBucket) -> R,
    ) -> Option<R> {
        let (chunk, offset) = self.chunk_for(index)?;
        let raw = chunk.slots[offset].load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            Some(f(unsafe { &*raw }))
        }
    }

    /// Walk chunks head-to-tail, yielding every occupied slot.
    pub(crate) fn for_each_bucket(&self, mut f: impl FnMut(u32, &HandleBucket)) {
        let mut walk = &self.head;
        loop {
            for (i, slot) in walk.slots.iter().enumerate() {
                let raw = slot.load(Ordering::Acquire);
                if !raw.is_null() {
                    f(walk.base() + i as u32, unsafe { &*raw });
                }
            }
            let next = walk.next.load(Ordering::Acquire);
            if next.is_null() {
                return;
            }
            walk = unsafe { &*next };
        }
    }

    /// Number of chunks in the chain.
    pub fn chunk_count(&self) -> usize {
        let mut count = 1;
        let mut next = self.head.next.load(Ordering::Acquire);
        while !next.is_null() {
            count += 1;
            next = unsafe { &*next }.next.load(Ordering::Acquire);
        }
        count
    }

    /// Number of occupied slots.
    pub fn bucket_count(&self) -> usize {
        let mut count = 0;
        self.for_each_bucket(|_, _| count += 1);
        count
    }
}

impl Drop for BucketDirectory {
    fn drop(&mut self) {
        // Release the directory's bucket references, then free the
        // heap-allocated chunks. The embedded head frees with `self`.
        let mut chunk = &self.head;
        loop {
            for slot in chunk.slots.iter() {
                let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
                if !raw.is_null() {
                    unsafe { drop(Arc::from_raw(raw)) };
                }
            }
            let next = chunk.next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            chunk = unsafe { &*next };
        }
        let mut raw = self.head.next.swap(ptr::null_mut(), Ordering::AcqRel);
        while !raw.is_null() {
            let boxed = unsafe { Box::from_raw(raw) };
            raw = boxed.next.load(Ordering::Acquire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bucket() -> Arc<HandleBucket> {
        HandleBucket::new(1, usize::MAX).unwrap()
    }

    #[test]
    fn indices_are_dense_and_stable() {
        let dir = BucketDirectory::new(4);
        for expected in 0..4 {
            let bucket = new_bucket();
            assert_eq!(dir.acquire_slot(&bucket).unwrap(), expected);
            assert_eq!(bucket.index(), expected);
        }
        assert_eq!(dir.chunk_count(), 1);
    }

    #[test]
    fn growth_appends_chunks_with_increasing_ceilings() {
        let dir = BucketDirectory::new(2);
        let buckets: Vec<_> = (0..5)
            .map(|_| {
                let b = new_bucket();
                dir.acquire_slot(&b).unwrap();
                b
            })
            .collect();
        assert_eq!(dir.chunk_count(), 3);
        assert_eq!(dir.bucket_count(), 5);
        assert_eq!(buckets[4].index(), 4);
    }

    #[test]
    fn removed_slots_are_reused_densely() {
        let dir = BucketDirectory::new(4);
        let first = new_bucket();
        let second = new_bucket();
        dir.acquire_slot(&first).unwrap();
        dir.acquire_slot(&second).unwrap();

        assert!(dir.remove(&first));
        assert!(!dir.remove(&first), "removal must be idempotent");

        let third = new_bucket();
        assert_eq!(dir.acquire_slot(&third).unwrap(), 0);
        assert_eq!(dir.bucket_count(), 2);
    }

    #[test]
    fn lookup_by_index_crosses_chunks() {
        let dir = BucketDirectory::new(1);
        for _ in 0..3 {
            dir.acquire_slot(&new_bucket()).unwrap();
        }
        assert_eq!(dir.with_bucket(2, |b| b.index()), Some(2));
        assert_eq!(dir.with_bucket(9, |b| b.index()), None);
    }
}

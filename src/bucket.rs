//! Buckets: the CPU fan-out of handle tables behind one directory index.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::HandleResult;
use crate::slots::{Handle, HandleTable};

/// A set of handle tables, one per CPU slot, presenting a single
/// identity to clients. All tables in a bucket share the bucket's index.
pub struct HandleBucket {
    tables: Box<[Arc<HandleTable>]>,
    index: AtomicU32,
}

impl HandleBucket {
    pub(crate) fn new(slot_count: usize, max_handles_per_table: usize) -> HandleResult<Arc<Self>> {
        let tables = (0..slot_count)
            .map(|cpu| HandleTable::new(cpu as u32, max_handles_per_table))
            .collect();
        Ok(Arc::new(HandleBucket {
            tables,
            index: AtomicU32::new(0),
        }))
    }

    /// The bucket's directory index.
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    /// Assign the directory index to the bucket and every table in it.
    pub(crate) fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
        for table in self.tables.iter() {
            table.set_bucket_index(index);
        }
    }

    pub(crate) fn table(&self, cpu: usize) -> &Arc<HandleTable> {
        &self.tables[cpu]
    }

    /// Total live handles across the bucket's tables.
    pub fn live_handle_count(&self) -> usize {
        self.tables.iter().map(|t| t.live_handle_count()).sum()
    }

    /// Whether `handle` lives in one of this bucket's tables.
    pub fn contains(&self, handle: Handle) -> bool {
        self.tables.iter().any(|table| table.owns(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandleType, ObjectPtr};

    #[test]
    fn index_propagates_to_all_tables() {
        let bucket = HandleBucket::new(3, usize::MAX).unwrap();
        bucket.set_index(7);
        assert_eq!(bucket.index(), 7);

        let handle = bucket
            .table(2)
            .allocate(HandleType::Strong, ObjectPtr::from_usize(0x40), 0)
            .unwrap();
        assert_eq!(handle.slot().home(), (7, 2));
    }

    #[test]
    fn contains_distinguishes_buckets() {
        let a = HandleBucket::new(1, usize::MAX).unwrap();
        let b = HandleBucket::new(1, usize::MAX).unwrap();
        let handle = a
            .table(0)
            .allocate(HandleType::Pinned, ObjectPtr::from_usize(0x50), 0)
            .unwrap();
        assert!(a.contains(handle));
        assert!(!b.contains(handle));
    }
}

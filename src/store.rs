//! The handle store: lifecycle orchestration and the mutator-facing
//! handle API.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bucket::HandleBucket;
use crate::dependent::DhContext;
use crate::directory::BucketDirectory;
use crate::error::{HandleError, HandleResult};
use crate::slots::Handle;
use crate::types::{HandleConfig, HandleType, ObjectPtr, ScanContext, StrengthMask};

static GLOBAL_STORE: OnceCell<HandleStore> = OnceCell::new();

/// The process-wide meeting point between the collector's scan phases and
/// every non-stack root in the system.
///
/// # Examples
///
/// ```
/// use holdfast::{HandleConfig, HandleStore, HandleType, ObjectPtr};
///
/// let store = HandleStore::new(HandleConfig::default()).unwrap();
/// let handle = store
///     .create_handle(HandleType::Strong, ObjectPtr::from_usize(0x1000))
///     .unwrap();
/// assert_eq!(handle.object().as_usize(), 0x1000);
/// store.destroy_handle(handle);
/// ```
pub struct HandleStore {
    config: HandleConfig,
    slot_count: usize,
    directory: BucketDirectory,
    global_bucket: Arc<HandleBucket>,
    dh_contexts: Box<[DhContext]>,
    pub(crate) syncblock_rendezvous: AtomicUsize,
}

impl HandleStore {
    /// Build a store: head directory chunk, the global bucket with one
    /// table per CPU slot, and the dependent-scan context array. Any
    /// failure drops every structure built so far.
    pub fn new(config: HandleConfig) -> HandleResult<HandleStore> {
        let slot_count = config.slot_count();
        let directory = BucketDirectory::new(config.initial_chunk_capacity);
        let global_bucket = HandleBucket::new(slot_count, config.max_handles_per_table)?;
        directory.acquire_slot(&global_bucket)?;
        let dh_contexts = (0..slot_count).map(|_| DhContext::new()).collect();
        Ok(HandleStore {
            config,
            slot_count,
            directory,
            global_bucket,
            dh_contexts,
            syncblock_rendezvous: AtomicUsize::new(0),
        })
    }

    /// Initialise the process-wide store. Fails with `InvalidArgument` if
    /// one was already installed.
    pub fn init_global(config: HandleConfig) -> HandleResult<&'static HandleStore> {
        let mut fresh = false;
        let store = GLOBAL_STORE.get_or_try_init(|| {
            fresh = true;
            HandleStore::new(config)
        })?;
        if fresh {
            Ok(store)
        } else {
            Err(HandleError::InvalidArgument)
        }
    }

    /// The process-wide store, initialised on first use with the default
    /// configuration.
    pub fn global() -> &'static HandleStore {
        GLOBAL_STORE.get_or_init(|| {
            HandleStore::new(HandleConfig::default()).expect("default handle store")
        })
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Number of handle tables per bucket.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn directory(&self) -> &BucketDirectory {
        &self.directory
    }

    /// The bucket created at initialisation.
    pub fn global_bucket(&self) -> &Arc<HandleBucket> {
        &self.global_bucket
    }

    /// Create a bucket and install it into the directory.
    pub fn create_bucket(&self) -> HandleResult<Arc<HandleBucket>> {
        let bucket = HandleBucket::new(self.slot_count, self.config.max_handles_per_table)?;
        self.directory.acquire_slot(&bucket)?;
        Ok(bucket)
    }

    /// Remove a bucket from the directory and release the directory's
    /// reference to it. Idempotent on "already removed". The caller must
    /// be collector-quiescent; tables die when the last `Arc` drops.
    pub fn destroy_bucket(&self, bucket: &Arc<HandleBucket>) {
        self.directory.remove(bucket);
    }

    /// The CPU slot a freshly created handle lands in.
    fn home_slot(&self) -> usize {
        if self.slot_count == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.slot_count
    }

    pub(crate) fn worker_slot(&self, sc: &ScanContext) -> usize {
        if self.slot_count > 1 {
            sc.thread_number % self.slot_count
        } else {
            0
        }
    }

    /// The dependent-scan context owned by this worker.
    pub fn dependent_context(&self, sc: &ScanContext) -> &DhContext {
        &self.dh_contexts[self.worker_slot(sc)]
    }

    fn allocate(
        &self,
        ty: HandleType,
        obj: ObjectPtr,
        extra: usize,
    ) -> HandleResult<Handle> {
        self.allocate_on(self.home_slot(), ty, obj, extra)
    }

    fn allocate_on(
        &self,
        heap_number: usize,
        ty: HandleType,
        obj: ObjectPtr,
        extra: usize,
    ) -> HandleResult<Handle> {
        if !self.config.enabled_types.contains_type(ty) {
            return Err(HandleError::InvalidArgument);
        }
        self.global_bucket
            .table(heap_number % self.slot_count)
            .allocate(ty, obj, extra)
            .map_err(|err| match err {
                HandleError::HandleExhausted => HandleError::OutOfResources,
                other => other,
            })
    }

    /// Create a handle of the given type on the current thread's home
    /// table.
    pub fn create_handle(&self, ty: HandleType, obj: ObjectPtr) -> HandleResult<Handle> {
        self.allocate(ty, obj, 0)
    }

    /// Create a handle on an explicit home heap's table. Used by hosts
    /// that affinitise handles to the allocating thread's heap.
    pub fn create_handle_on_heap(
        &self,
        heap_number: usize,
        ty: HandleType,
        obj: ObjectPtr,
    ) -> HandleResult<Handle> {
        self.allocate_on(heap_number, ty, obj, 0)
    }

    /// Create a dependent handle: `secondary` stays alive exactly as long
    /// as `primary` does.
    pub fn create_dependent_handle(
        &self,
        primary: ObjectPtr,
        secondary: ObjectPtr,
    ) -> HandleResult<Handle> {
        self.allocate(HandleType::Dependent, primary, secondary.as_usize())
    }

    /// Create a variable-strength handle. The strength must be drawn from
    /// the closed set.
    pub fn create_variable_handle(
        &self,
        obj: ObjectPtr,
        strength: StrengthMask,
    ) -> HandleResult<Handle> {
        if !StrengthMask::is_valid_bits(strength.bits()) {
            return Err(HandleError::InvalidArgument);
        }
        self.allocate(HandleType::Variable, obj, strength.bits() as usize)
    }

    /// Create a weak interior pointer handle: `interior` must equal the
    /// referent's base plus a fixed offset, which is preserved across
    /// relocation.
    pub fn create_weak_interior_handle(
        &self,
        obj: ObjectPtr,
        interior: usize,
    ) -> HandleResult<Handle> {
        self.allocate(HandleType::WeakInteriorPointer, obj, interior)
    }

    /// Create a cross-reference handle carrying a context word for the
    /// foreign collector.
    pub fn create_cross_reference_handle(
        &self,
        obj: ObjectPtr,
        context: usize,
    ) -> HandleResult<Handle> {
        self.allocate(HandleType::CrossReference, obj, context)
    }

    /// Destroy a handle, returning its slot to the owning table. A handle
    /// whose bucket was already torn down is a no-op.
    pub fn destroy_handle(&self, handle: Handle) {
        let (bucket_index, cpu) = handle.slot().home();
        let _ = self.directory.with_bucket(bucket_index, |bucket| {
            bucket.table(cpu as usize).free(handle);
        });
    }

    /// Read a dependent handle's secondary object.
    pub fn dependent_secondary(&self, handle: Handle) -> ObjectPtr {
        debug_assert_eq!(handle.handle_type(), HandleType::Dependent);
        ObjectPtr::from_usize(handle.extra_info())
    }

    /// Store a dependent handle's secondary object. A non-null store
    /// re-youngs the slot, same as a primary store.
    pub fn set_dependent_secondary(&self, handle: Handle, secondary: ObjectPtr) {
        debug_assert_eq!(handle.handle_type(), HandleType::Dependent);
        if !secondary.is_null() {
            handle.slot().set_age(0);
        }
        handle.set_extra_info(secondary.as_usize());
    }

    /// Read a variable handle's dynamic strength.
    pub fn variable_handle_strength(&self, handle: Handle) -> StrengthMask {
        debug_assert_eq!(handle.handle_type(), HandleType::Variable);
        StrengthMask::from_bits_truncate(handle.extra_info() as u32)
    }

    /// Change a variable handle's dynamic strength. An invalid strength
    /// is a programming error; the operation is a validated no-op.
    pub fn update_variable_handle_strength(&self, handle: Handle, strength: StrengthMask) {
        debug_assert_eq!(handle.handle_type(), HandleType::Variable);
        if !StrengthMask::is_valid_bits(strength.bits()) {
            debug_assert!(false, "invalid variable handle strength");
            return;
        }
        handle.set_extra_info(strength.bits() as usize);
    }

    /// Atomically swap a variable handle's strength from `old` to `new`.
    /// Returns the strength observed before the exchange.
    pub fn compare_exchange_variable_handle_strength(
        &self,
        handle: Handle,
        old: StrengthMask,
        new: StrengthMask,
    ) -> StrengthMask {
        debug_assert_eq!(handle.handle_type(), HandleType::Variable);
        debug_assert!(
            StrengthMask::is_valid_bits(old.bits()) && StrengthMask::is_valid_bits(new.bits()),
            "invalid variable handle strength",
        );
        let observed = match handle
            .slot()
            .cas_extra(old.bits() as usize, new.bits() as usize)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        };
        StrengthMask::from_bits_truncate(observed as u32)
    }

    /// Whether `handle` lives in any bucket of this store.
    pub fn contains(&self, handle: Handle) -> bool {
        let mut found = false;
        self.directory.for_each_bucket(|_, bucket| {
            if !found && bucket.contains(handle) {
                found = true;
            }
        });
        found
    }

    /// Number of chunks in the bucket directory.
    pub fn directory_chunk_count(&self) -> usize {
        self.directory.chunk_count()
    }

    /// Number of buckets installed in the directory.
    pub fn bucket_count(&self) -> usize {
        self.directory.bucket_count()
    }

    /// Total live handles across the store.
    pub fn live_handle_count(&self) -> usize {
        let mut total = 0;
        self.directory.for_each_bucket(|_, bucket| {
            total += bucket.live_handle_count();
        });
        total
    }
}

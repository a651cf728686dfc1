//! Core value types shared across the handle subsystem.

use bitflags::bitflags;

/// A raw reference to a managed heap object, or null.
///
/// The handle table never dereferences these words; it only stores them,
/// hands them to the collector's promotion callback, and compares them
/// against null. Interpreting the address is entirely the host's business.
///
/// # Examples
///
/// ```
/// use holdfast::ObjectPtr;
///
/// let obj = ObjectPtr::from_usize(0x1000);
/// assert!(!obj.is_null());
/// assert_eq!(obj.as_usize(), 0x1000);
/// assert!(ObjectPtr::NULL.is_null());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectPtr(usize);

impl ObjectPtr {
    /// The null object reference.
    pub const NULL: ObjectPtr = ObjectPtr(0);

    pub fn from_usize(raw: usize) -> Self {
        ObjectPtr(raw)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.0)
    }
}

/// The closed set of handle types.
///
/// The discriminants double as the slot type codes stored in handle
/// tables, so the ordering here is load-bearing for [`TypeMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleType {
    /// Weak reference, severed as soon as the referent is unreachable by
    /// ordinary tracing (does not track resurrection).
    WeakShort = 0,
    /// Weak reference that survives until finalization is complete.
    WeakLong = 1,
    /// Keeps the referent alive.
    Strong = 2,
    /// Keeps the referent alive and ineligible for relocation.
    Pinned = 3,
    /// Strength chosen at runtime from [`StrengthMask`], stored in the
    /// handle's extra-info word.
    Variable = 4,
    /// Strength resolved per GC by the interop runtime's reference count.
    RefCounted = 5,
    /// Primary/secondary pair: the secondary lives exactly as long as the
    /// primary does.
    Dependent = 6,
    /// Pinned handle whose referent owns a payload with further roots the
    /// runtime must walk.
    AsyncPinned = 7,
    /// Strong handle whose extra-info word accumulates the promoted bytes
    /// attributable to its referent.
    SizedRef = 8,
    /// Weak handle paired with a native interop object in extra info.
    WeakNativeInterop = 9,
    /// Weak handle whose extra-info word is an interior pointer kept at a
    /// fixed offset from the referent across relocation.
    WeakInteriorPointer = 10,
    /// Root bridged into a foreign collector's object graph.
    CrossReference = 11,
}

impl HandleType {
    /// Number of handle types.
    pub const COUNT: usize = 12;

    /// Every type, in type-code order.
    pub const ALL: [HandleType; Self::COUNT] = [
        HandleType::WeakShort,
        HandleType::WeakLong,
        HandleType::Strong,
        HandleType::Pinned,
        HandleType::Variable,
        HandleType::RefCounted,
        HandleType::Dependent,
        HandleType::AsyncPinned,
        HandleType::SizedRef,
        HandleType::WeakNativeInterop,
        HandleType::WeakInteriorPointer,
        HandleType::CrossReference,
    ];

    pub fn from_code(code: u8) -> Option<HandleType> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether slots of this type carry an adjacent extra-info word.
    pub fn has_extra_info(self) -> bool {
        matches!(
            self,
            HandleType::Variable
                | HandleType::Dependent
                | HandleType::SizedRef
                | HandleType::WeakNativeInterop
                | HandleType::WeakInteriorPointer
                | HandleType::CrossReference
        )
    }

    pub fn mask(self) -> TypeMask {
        TypeMask::from_bits_truncate(1 << self as u16)
    }
}

bitflags! {
    /// A set of handle types, used to filter scans.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeMask: u16 {
        const WEAK_SHORT = 1 << 0;
        const WEAK_LONG = 1 << 1;
        const STRONG = 1 << 2;
        const PINNED = 1 << 3;
        const VARIABLE = 1 << 4;
        const REF_COUNTED = 1 << 5;
        const DEPENDENT = 1 << 6;
        const ASYNC_PINNED = 1 << 7;
        const SIZED_REF = 1 << 8;
        const WEAK_NATIVE_INTEROP = 1 << 9;
        const WEAK_INTERIOR_POINTER = 1 << 10;
        const CROSS_REFERENCE = 1 << 11;
    }
}

impl TypeMask {
    pub fn of(types: &[HandleType]) -> TypeMask {
        types
            .iter()
            .fold(TypeMask::empty(), |mask, ty| mask | ty.mask())
    }

    pub fn contains_type(self, ty: HandleType) -> bool {
        self.intersects(ty.mask())
    }
}

bitflags! {
    /// The dynamic strengths a [`HandleType::Variable`] handle may take.
    ///
    /// The closed set mirrors the statically typed strengths; anything
    /// outside it is rejected by the validation in the store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StrengthMask: u32 {
        const WEAK_SHORT = 1 << 0;
        const WEAK_LONG = 1 << 1;
        const STRONG = 1 << 2;
        const PINNED = 1 << 3;
    }
}

impl StrengthMask {
    /// A strength value is valid when it is non-empty and drawn entirely
    /// from the closed set.
    pub fn is_valid_bits(bits: u32) -> bool {
        bits != 0 && (bits & !StrengthMask::all().bits()) == 0
    }
}

/// Per-worker context supplied by the collector on every scan entry.
///
/// # Examples
///
/// ```
/// use holdfast::ScanContext;
///
/// let sc = ScanContext::worker(2, 8);
/// assert_eq!(sc.thread_number, 2);
/// assert_eq!(sc.thread_count, 8);
/// assert!(!sc.concurrent);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ScanContext {
    /// This worker's identity in `[0, thread_count)`.
    pub thread_number: usize,
    /// Number of workers participating in the current phase.
    pub thread_count: usize,
    /// Whether the collector is running concurrently with mutators.
    pub concurrent: bool,
}

impl ScanContext {
    /// Context for a single-threaded stop-the-world caller.
    pub fn solo() -> Self {
        ScanContext {
            thread_number: 0,
            thread_count: 1,
            concurrent: false,
        }
    }

    /// Context for one of `thread_count` stop-the-world workers.
    pub fn worker(thread_number: usize, thread_count: usize) -> Self {
        ScanContext {
            thread_number,
            thread_count,
            concurrent: false,
        }
    }

    /// Context for a background (concurrent) scan.
    pub fn background(thread_number: usize, thread_count: usize) -> Self {
        ScanContext {
            thread_number,
            thread_count,
            concurrent: true,
        }
    }
}

/// Configuration for a [`crate::HandleStore`].
///
/// # Examples
///
/// ```
/// use holdfast::{HandleConfig, TypeMask};
///
/// let config = HandleConfig {
///     server_mode: true,
///     processor_count: 4,
///     ..HandleConfig::default()
/// };
/// assert_eq!(config.slot_count(), 4);
/// assert_eq!(HandleConfig::default().slot_count(), 1);
/// assert!(config.enabled_types.contains(TypeMask::DEPENDENT));
/// ```
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// In server mode every bucket fans out one handle table per
    /// processor; otherwise a single table serves all mutators.
    pub server_mode: bool,
    /// Number of CPU slots used when `server_mode` is set.
    pub processor_count: usize,
    /// Capacity of each bucket-directory chunk.
    pub initial_chunk_capacity: usize,
    /// Ceiling on the number of slots a single handle table may grow to.
    /// Exceeding it surfaces as [`crate::HandleError::OutOfResources`].
    pub max_handles_per_table: usize,
    /// Handle types available to this store. Disabled types are removed
    /// from every phase's type mask and rejected at allocation.
    pub enabled_types: TypeMask,
}

impl Default for HandleConfig {
    fn default() -> Self {
        HandleConfig {
            server_mode: false,
            processor_count: num_cpus::get(),
            initial_chunk_capacity: 64,
            max_handles_per_table: usize::MAX,
            enabled_types: TypeMask::all(),
        }
    }
}

impl HandleConfig {
    /// Number of handle tables per bucket under this configuration.
    pub fn slot_count(&self) -> usize {
        if self.server_mode {
            self.processor_count.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for ty in HandleType::ALL {
            assert_eq!(HandleType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(HandleType::from_code(12), None);
    }

    #[test]
    fn extra_info_flags_match_type_table() {
        let with_extra = [
            HandleType::Variable,
            HandleType::Dependent,
            HandleType::SizedRef,
            HandleType::WeakNativeInterop,
            HandleType::WeakInteriorPointer,
            HandleType::CrossReference,
        ];
        for ty in HandleType::ALL {
            assert_eq!(ty.has_extra_info(), with_extra.contains(&ty), "{ty:?}");
        }
    }

    #[test]
    fn type_mask_composition() {
        let mask = TypeMask::of(&[HandleType::WeakShort, HandleType::Pinned]);
        assert!(mask.contains_type(HandleType::WeakShort));
        assert!(mask.contains_type(HandleType::Pinned));
        assert!(!mask.contains_type(HandleType::Strong));
    }

    #[test]
    fn strength_validation_rejects_out_of_set_bits() {
        assert!(StrengthMask::is_valid_bits(StrengthMask::STRONG.bits()));
        assert!(StrengthMask::is_valid_bits(
            (StrengthMask::WEAK_SHORT | StrengthMask::PINNED).bits()
        ));
        assert!(!StrengthMask::is_valid_bits(0));
        assert!(!StrengthMask::is_valid_bits(1 << 16));
    }

    #[test]
    fn workstation_config_collapses_to_one_slot() {
        let config = HandleConfig {
            server_mode: false,
            processor_count: 32,
            ..HandleConfig::default()
        };
        assert_eq!(config.slot_count(), 1);
    }
}

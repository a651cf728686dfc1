//! Object handles for a tracing, moving, generational garbage collector.
//!
//! This crate is the meeting point between a collector's mark/relocate
//! passes and every non-stack root in the system: typed, durable
//! references held by native code, profilers, weak-reference APIs,
//! pinning, and cross-runtime interop. It owns the handle table (buckets
//! of per-CPU slot storage behind a lock-free directory), the per-type
//! scan callbacks that give each handle strength its meaning, and the
//! dependent-handle fixed point. The collector itself stays behind the
//! [`PromotionHooks`] oracle; this crate never traces, marks, or moves an
//! object.

pub mod bridge;
pub mod bucket;
pub mod callbacks;
pub mod dependent;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod phases;
pub mod slots;
pub mod store;
pub mod test_utils;
pub mod types;

pub use bridge::{BridgeAccumulator, BridgeProcessingArgs, BridgeRegistration};
pub use bucket::HandleBucket;
pub use dependent::DhContext;
pub use dispatch::{ScanFlags, ScanSpec};
pub use error::{HandleError, HandleResult};
pub use hooks::{HandleEventSink, PromoteFlags, PromotionHooks, RootFlags, RuntimeHooks};
pub use slots::{Handle, HandleTable};
pub use store::HandleStore;
pub use types::{HandleConfig, HandleType, ObjectPtr, ScanContext, StrengthMask, TypeMask};

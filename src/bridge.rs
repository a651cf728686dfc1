//! Cross-reference (bridge) processing for foreign-runtime interop.
//!
//! The core owns only the cheap halves of bridge processing: collecting
//! candidate roots during the scan, and severing weak handles against the
//! host's verdict on which bridge objects the foreign graph kept alive.
//! The actual cross-reference algorithm lives in the host.

use crossbeam::queue::SegQueue;

use crate::types::ObjectPtr;

/// A cross-reference root that was not promoted by local tracing, paired
/// with the handle's context word for the foreign collector.
pub type BridgeRegistration = (ObjectPtr, usize);

/// Lock-free accumulator for bridge registrations made during a scan.
pub struct BridgeAccumulator {
    registered: SegQueue<BridgeRegistration>,
}

impl BridgeAccumulator {
    pub fn new() -> BridgeAccumulator {
        BridgeAccumulator {
            registered: SegQueue::new(),
        }
    }

    pub fn register(&self, primary: ObjectPtr, context: usize) {
        self.registered.push((primary, context));
    }

    pub fn drain(&self) -> Vec<BridgeRegistration> {
        let mut out = Vec::with_capacity(self.registered.len());
        while let Some(entry) = self.registered.pop() {
            out.push(entry);
        }
        out
    }
}

impl Default for BridgeAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// The cross-reference graph handed to the host for foreign-GC
/// coordination.
#[derive(Debug, Clone, Default)]
pub struct BridgeProcessingArgs {
    pub cross_references: Vec<BridgeRegistration>,
}

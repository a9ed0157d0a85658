// Licensed under the Apache-2.0 license

//! Hardware access seam.
//!
//! The register block is a process-wide resource; it is modeled as an
//! explicit handle passed into the engine constructors rather than a
//! global. Production code backs it with memory-mapped I/O; tests use the
//! simulated register file in [`crate::sim`], which honors the same
//! descriptor-consumption and completion contract.

use std::sync::Arc;

/// Register-level access to the security engine block.
pub trait CryptoHw: Send + Sync {
    fn write_reg(&self, offset: u32, value: u32);
    fn read_reg(&self, offset: u32) -> u32;

    /// Install the handler invoked from interrupt context when any enabled
    /// engine raises its flag.
    fn set_irq_sink(&self, sink: Arc<dyn IrqSink>);
}

/// Receiver of engine interrupts. Implementations run in interrupt context:
/// they must not block and may only drain completed descriptors and wake
/// waiters.
pub trait IrqSink: Send + Sync {
    fn irq(&self);
}

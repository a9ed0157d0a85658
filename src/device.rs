// Licensed under the Apache-2.0 license

//! Device core: ring ownership, the completion dispatcher, and the debug
//! control surface.

use std::sync::Arc;

use log::{debug, info};

use crate::arena::DmaArena;
use crate::error::Result;
use crate::hw::{CryptoHw, IrqSink};
use crate::regs::{Engine, SEC_CR_RUN, SEC_IE, SEC_IF};
use crate::ring::TrbRing;

/// Diagnostic snapshot of one ring, for the debug dump control.
#[derive(Debug, Clone)]
pub struct RingState {
    pub engine: Engine,
    pub entries: usize,
    pub head: usize,
    pub tail: usize,
    pub free_slots: usize,
    pub triggers: u64,
    pub irqs: u64,
    pub enabled: bool,
}

/// The security engine device: one AES ring and one hash ring, each a
/// process-wide shared resource all sessions of that class serialize
/// through.
pub struct CryptoDev {
    hw: Arc<dyn CryptoHw>,
    arena: Arc<DmaArena>,
    aes_ring: Arc<TrbRing>,
    hash_ring: Arc<TrbRing>,
}

impl CryptoDev {
    /// Bring up both engines: allocate rings, program their base registers,
    /// start them and install the interrupt dispatcher.
    pub fn new(hw: Arc<dyn CryptoHw>, arena: Arc<DmaArena>, ring_entries: usize) -> Result<Arc<Self>> {
        let aes_ring = TrbRing::new(arena.clone(), ring_entries, "aes")?;
        let hash_ring = TrbRing::new(arena.clone(), ring_entries, "hash")?;

        for (engine, ring) in [(Engine::Aes, &aes_ring), (Engine::Hash, &hash_ring)] {
            hw.write_reg(engine.er(), ring.base_addr());
            hw.write_reg(engine.cr(), SEC_CR_RUN);
        }
        hw.write_reg(
            SEC_IE,
            Engine::Aes.done_bit()
                | Engine::Aes.ring_full_bit()
                | Engine::Hash.done_bit()
                | Engine::Hash.ring_full_bit(),
        );

        let dev = Arc::new(Self {
            hw: hw.clone(),
            arena,
            aes_ring,
            hash_ring,
        });
        hw.set_irq_sink(dev.clone());
        info!("crypto device up, {ring_entries} descriptors per ring");
        Ok(dev)
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<DmaArena> {
        &self.arena
    }

    #[must_use]
    pub(crate) fn hw(&self) -> &Arc<dyn CryptoHw> {
        &self.hw
    }

    #[must_use]
    pub(crate) fn ring(&self, engine: Engine) -> &Arc<TrbRing> {
        match engine {
            Engine::Aes => &self.aes_ring,
            Engine::Hash => &self.hash_ring,
        }
    }

    /// Debug control: start or stop one engine independently.
    pub fn set_engine_enabled(&self, engine: Engine, enabled: bool) {
        let ie = self.hw.read_reg(SEC_IE);
        if enabled {
            self.hw.write_reg(engine.cr(), SEC_CR_RUN);
            self.hw
                .write_reg(SEC_IE, ie | engine.done_bit() | engine.ring_full_bit());
        } else {
            self.hw.write_reg(engine.cr(), 0);
            self.hw
                .write_reg(SEC_IE, ie & !(engine.done_bit() | engine.ring_full_bit()));
        }
        debug!("{} engine {}", engine.name(), if enabled { "enabled" } else { "disabled" });
    }

    #[must_use]
    pub fn engine_enabled(&self, engine: Engine) -> bool {
        self.hw.read_reg(engine.cr()) & SEC_CR_RUN != 0
    }

    pub fn toggle_engine(&self, engine: Engine) {
        self.set_engine_enabled(engine, !self.engine_enabled(engine));
    }

    /// Debug control: live ring/register state for diagnostics.
    #[must_use]
    pub fn ring_state(&self, engine: Engine) -> RingState {
        let ring = self.ring(engine);
        RingState {
            engine,
            entries: ring.entries(),
            head: ring.head(),
            tail: ring.tail(),
            free_slots: ring.free_slots(),
            triggers: ring.trigger_count(),
            irqs: ring.irq_count(),
            enabled: self.engine_enabled(engine),
        }
    }

    pub fn dump(&self) {
        for engine in [Engine::Aes, Engine::Hash] {
            let s = self.ring_state(engine);
            debug!(
                "{}: head={} tail={} free={} triggers={} irqs={} enabled={}",
                engine.name(),
                s.head,
                s.tail,
                s.free_slots,
                s.triggers,
                s.irqs,
                s.enabled
            );
        }
    }
}

/// The interrupt-context routine: drain completed descriptors from every
/// engine whose flag is raised and wake exactly the waiters whose terminal
/// descriptor completed.
impl IrqSink for CryptoDev {
    fn irq(&self) {
        let flags = self.hw.read_reg(SEC_IF);
        // Write-one-to-clear.
        self.hw.write_reg(SEC_IF, flags);
        for engine in [Engine::Aes, Engine::Hash] {
            if flags & engine.done_bit() != 0 {
                let ring = self.ring(engine);
                ring.note_irq();
                for (completion, cc) in ring.drain_completed() {
                    completion.fire(cc);
                }
            }
        }
    }
}

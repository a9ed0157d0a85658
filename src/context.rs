// Licensed under the Apache-2.0 license

//! Per-transform execution context: the enqueue-and-maybe-wait protocol
//! shared by the hash and cipher engines.
//!
//! Only a descriptor carrying IOC ever produces a wakeup; everything queued
//! before it runs back-to-back in the engine, so a multi-block operation
//! costs one software wait regardless of its descriptor count.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::hw::CryptoHw;
use crate::mode::ModeWord;
use crate::regs::{Engine, SEC_CR_RUN};
use crate::ring::{AbortFlag, Completion, TrbRing};
use crate::trb::{Trb, TrbFlags, TrbType, TRB_MAX_LEN};

/// Completion wait strategy, fixed at session construction.
///
/// The hash class spins because its session span is a non-sleeping section;
/// the cipher class sleeps with a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    Spin,
    Sleep(Duration),
}

/// Default cipher-class completion deadline.
pub const CIPHER_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

/// Arguments for one queued descriptor.
#[derive(Debug, Clone, Copy)]
pub struct QueueArgs {
    pub src: u32,
    pub dst: u32,
    pub iv: u32,
    pub key: u32,
    pub len: u32,
    pub mode: ModeWord,
    pub ioc: bool,
}

pub struct ExecContext {
    ring: Arc<TrbRing>,
    hw: Arc<dyn CryptoHw>,
    engine: Engine,
    poll: PollStrategy,
    abort: AbortFlag,
    owner: u32,
    pending: Option<usize>,
    waiter: Option<Arc<Completion>>,
    ops_held: bool,
}

impl ExecContext {
    pub fn new(
        ring: Arc<TrbRing>,
        hw: Arc<dyn CryptoHw>,
        engine: Engine,
        poll: PollStrategy,
    ) -> Self {
        Self {
            ring,
            hw,
            engine,
            poll,
            abort: AbortFlag::new(),
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            pending: None,
            waiter: None,
            ops_held: false,
        }
    }

    /// Take the ring's operation lock before the first descriptor of a
    /// logical operation. The free-slot valve and the slot semaphore are
    /// only deadlock-free when one operation enqueues at a time.
    fn ensure_ops(&mut self) -> Result<()> {
        if !self.ops_held {
            self.ring.lock_ops(&self.abort)?;
            self.ops_held = true;
        }
        Ok(())
    }

    fn release_ops(&mut self) {
        if self.ops_held {
            self.ops_held = false;
            self.ring.unlock_ops();
        }
    }

    #[must_use]
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Free slots on the underlying ring; the cipher walker uses this as a
    /// backpressure signal.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.ring.free_slots()
    }

    /// Queue one descriptor. A zero-length queue does not allocate a slot:
    /// it patches the mode word and IOC flag of the previously queued,
    /// not-yet-issued descriptor, which is how "finalize with no remaining
    /// bytes" attaches the terminal flag to an already-queued block.
    pub fn queue(&mut self, args: QueueArgs) -> Result<()> {
        if args.len == 0 {
            let index = self.pending.ok_or(Error::InvalidState)?;
            if args.ioc && self.waiter.is_none() {
                let completion = Completion::new();
                self.ring.register_waiter(index, completion.clone());
                self.waiter = Some(completion);
            }
            self.ring.amend(index, args.mode.encode(), args.ioc);
            return Ok(());
        }
        if args.len > TRB_MAX_LEN {
            return Err(Error::InvalidDataLength);
        }

        self.ensure_ops()?;
        let slot = match self.ring.acquire_slot(&self.abort) {
            Ok(slot) => slot,
            Err(e) => {
                if self.pending.is_none() {
                    self.release_ops();
                }
                return Err(e);
            }
        };
        if args.ioc {
            let completion = Completion::new();
            self.ring.register_waiter(slot.index, completion.clone());
            self.waiter = Some(completion);
        }
        let mut flags = TrbFlags::empty();
        if args.ioc {
            flags.insert(TrbFlags::IOC);
        }
        self.ring.publish(
            &slot,
            &Trb {
                flags,
                trb_type: TrbType::Normal,
                len: args.len,
                src: args.src,
                dst: args.dst,
                mode: args.mode.encode(),
                iv: args.iv,
                key: args.key,
                owner: self.owner,
                ..Trb::default()
            },
        );
        self.pending = Some(slot.index);
        Ok(())
    }

    /// If a terminal (IOC) descriptor is queued, trigger the engine and wait
    /// for its completion using the context's poll strategy. Without a
    /// terminal descriptor this is a no-op.
    pub fn execute(&mut self) -> Result<()> {
        let Some(completion) = self.waiter.take() else {
            return Ok(());
        };
        let result = self.trigger().and_then(|()| {
            let cc = match self.poll {
                PollStrategy::Spin => completion.wait_spin(&self.abort),
                PollStrategy::Sleep(timeout) => completion.wait_sleep(timeout, &self.abort),
            };
            match cc {
                Ok(cc) => cc.to_result(),
                Err(e) => {
                    debug!("{}: wait failed: {e}", self.engine.name());
                    Err(e)
                }
            }
        });
        self.pending = None;
        self.release_ops();
        result
    }

    fn trigger(&self) -> Result<()> {
        if self.hw.read_reg(self.engine.cr()) & SEC_CR_RUN == 0 {
            // Engine disabled via the debug control.
            return Err(Error::Hardware(0));
        }
        self.hw.write_reg(self.engine.trig(), 1);
        self.ring.note_trigger();
        Ok(())
    }
}

impl Drop for ExecContext {
    fn drop(&mut self) {
        self.release_ops();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::DmaArena;
    use crate::hw::IrqSink;
    use crate::mode::Algorithm;

    struct StubHw;

    impl CryptoHw for StubHw {
        fn write_reg(&self, _offset: u32, _value: u32) {}
        fn read_reg(&self, _offset: u32) -> u32 {
            SEC_CR_RUN
        }
        fn set_irq_sink(&self, _sink: Arc<dyn IrqSink>) {}
    }

    fn test_ctx() -> ExecContext {
        let arena = Arc::new(DmaArena::new(1 << 16));
        let ring = TrbRing::new(arena, 8, "ctx-test").unwrap();
        ExecContext::new(ring, Arc::new(StubHw), Engine::Hash, PollStrategy::Spin)
    }

    fn hash_args(len: u32, ioc: bool) -> QueueArgs {
        QueueArgs {
            src: 0x1000,
            dst: 0x2000,
            iv: 0,
            key: 0,
            len,
            mode: ModeWord::hash(Algorithm::Md5),
            ioc,
        }
    }

    #[test]
    fn zero_length_queue_without_pending_fails() {
        let mut ctx = test_ctx();
        assert_eq!(ctx.queue(hash_args(0, true)), Err(Error::InvalidState));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut ctx = test_ctx();
        assert_eq!(
            ctx.queue(hash_args(TRB_MAX_LEN + 1, false)),
            Err(Error::InvalidDataLength)
        );
    }

    #[test]
    fn zero_length_queue_patches_pending() {
        let mut ctx = test_ctx();
        ctx.queue(hash_args(64, false)).unwrap();
        assert!(ctx.has_pending());
        let fin = QueueArgs {
            mode: ModeWord {
                finalize: true,
                ..ModeWord::hash(Algorithm::Md5)
            },
            ..hash_args(0, true)
        };
        ctx.queue(fin).unwrap();
        // Still a single descriptor outstanding.
        assert_eq!(ctx.free_slots(), 5);
    }

    #[test]
    fn execute_without_terminal_descriptor_is_noop() {
        let mut ctx = test_ctx();
        ctx.queue(hash_args(64, false)).unwrap();
        assert_eq!(ctx.execute(), Ok(()));
        assert!(ctx.has_pending());
    }
}

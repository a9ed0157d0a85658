// Licensed under the Apache-2.0 license

//! Descriptor ring.
//!
//! Fixed-capacity circular buffer of TRBs with a link sentinel in the last
//! entry, pointing the engine's DMA cursor back at the ring base. Slot
//! acquisition blocks on a counting semaphore initialized to N-2 (the link
//! plus one trailing reserved slot are excluded). The completion dispatcher
//! is the only writer that advances `head` and the only one that clears
//! completion codes; `tail` advances only inside [`TrbRing::acquire_slot`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::trace;
use zerocopy::{FromBytes, IntoBytes};

use crate::arena::{DmaArena, DmaRegion};
use crate::error::{Error, Result};
use crate::trb::{CompletionCode, RawTrb, Trb, TrbFlags, TrbType, TRB_SIZE};

/// Granularity at which blocked waits re-check their abort flag.
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Models asynchronous signal delivery: blocked ring waits observe the flag
/// and fail with [`Error::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-operation completion signal, registered against the terminal
/// descriptor's slot and fired from the dispatcher.
pub struct Completion {
    state: Mutex<Option<CompletionCode>>,
    cv: Condvar,
    done: AtomicBool,
}

impl Completion {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
            done: AtomicBool::new(false),
        })
    }

    pub fn fire(&self, cc: CompletionCode) {
        *self.state.lock().unwrap() = Some(cc);
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Busy-poll without sleeping. Used by the hash class, whose session
    /// span is a non-sleeping section. No deadline; a raised abort flag is
    /// the only way out of a wedged engine.
    pub fn wait_spin(&self, abort: &AbortFlag) -> Result<CompletionCode> {
        loop {
            if self.done.load(Ordering::Acquire) {
                return Ok(self.state.lock().unwrap().take().unwrap_or(CompletionCode::Success));
            }
            if abort.is_raised() {
                return Err(Error::Interrupted);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Sleep on the condvar with a deadline. Used by the cipher class.
    pub fn wait_sleep(&self, timeout: Duration, abort: &AbortFlag) -> Result<CompletionCode> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(cc) = guard.take() {
                return Ok(cc);
            }
            if abort.is_raised() {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            let (g, _) = self.cv.wait_timeout(guard, WAIT_SLICE).unwrap();
            guard = g;
        }
    }
}

/// Counting semaphore with interruptible acquisition.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(n: usize) -> Self {
        Self {
            count: Mutex::new(n),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, abort: &AbortFlag) -> Result<()> {
        let mut count = self.count.lock().unwrap();
        loop {
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
            if abort.is_raised() {
                return Err(Error::Interrupted);
            }
            let (g, _) = self.cv.wait_timeout(count, WAIT_SLICE).unwrap();
            count = g;
        }
    }

    fn release(&self) {
        *self.count.lock().unwrap() += 1;
        self.cv.notify_one();
    }

    fn available(&self) -> usize {
        *self.count.lock().unwrap()
    }

    fn set(&self, n: usize) {
        *self.count.lock().unwrap() = n;
        self.cv.notify_all();
    }
}

/// Binary lock serializing one logical operation's enqueue sequence.
///
/// The slot semaphore alone is not enough: an operation that queues
/// non-IOC descriptors decides its sync points from the free-slot count,
/// and two interleaved operations could consume the last slots with no
/// IOC descriptor in flight to drain them. The lock is held from the
/// first published descriptor until the completion wait retires.
struct OpLock {
    held: Mutex<bool>,
    cv: Condvar,
}

impl OpLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn lock(&self, abort: &AbortFlag) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        loop {
            if !*held {
                *held = true;
                return Ok(());
            }
            if abort.is_raised() {
                return Err(Error::Interrupted);
            }
            let (g, _) = self.cv.wait_timeout(held, WAIT_SLICE).unwrap();
            held = g;
        }
    }

    fn unlock(&self) {
        *self.held.lock().unwrap() = false;
        self.cv.notify_one();
    }
}

/// An acquired, not-yet-published slot.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub index: usize,
    pub addr: u32,
    cycle: bool,
}

struct Produce {
    tail: usize,
    cycle: bool,
}

pub struct TrbRing {
    name: &'static str,
    arena: Arc<DmaArena>,
    base: DmaRegion,
    entries: usize,
    sem: Semaphore,
    ops: OpLock,
    produce: Mutex<Produce>,
    head: Mutex<usize>,
    waiters: Vec<Mutex<Option<Arc<Completion>>>>,
    triggers: AtomicU64,
    irqs: AtomicU64,
}

impl TrbRing {
    /// Create a ring with `entries` descriptors (minimum 4; the last entry
    /// is the link sentinel). Usable capacity is `entries - 2`.
    pub fn new(arena: Arc<DmaArena>, entries: usize, name: &'static str) -> Result<Arc<Self>> {
        if entries < 4 {
            return Err(Error::InvalidDataLength);
        }
        let base = arena.alloc(entries as u32 * TRB_SIZE, 64)?;
        let ring = Arc::new(Self {
            name,
            arena,
            base,
            entries,
            sem: Semaphore::new(entries - 2),
            ops: OpLock::new(),
            produce: Mutex::new(Produce {
                tail: 0,
                cycle: true,
            }),
            head: Mutex::new(0),
            waiters: (0..entries).map(|_| Mutex::new(None)).collect(),
            triggers: AtomicU64::new(0),
            irqs: AtomicU64::new(0),
        });
        ring.reset();
        Ok(ring)
    }

    #[must_use]
    pub fn base_addr(&self) -> u32 {
        self.base.addr
    }

    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Usable slots currently free.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.sem.available()
    }

    fn slot_addr(&self, index: usize) -> u32 {
        self.base.addr + index as u32 * TRB_SIZE
    }

    fn read_raw(&self, index: usize) -> RawTrb {
        let bytes = self.arena.read_vec(self.slot_addr(index), TRB_SIZE as usize);
        RawTrb::read_from_bytes(&bytes).expect("trb size")
    }

    fn write_ctrl(&self, index: usize, ctrl: u32) {
        self.arena.write(self.slot_addr(index), &ctrl.to_le_bytes());
    }

    /// Re-initialize cursors and descriptor memory. Only valid at creation
    /// and teardown, never concurrently with traffic.
    pub fn reset(&self) {
        for i in 0..self.entries {
            self.arena
                .write(self.slot_addr(i), RawTrb::default().as_bytes());
        }
        let link = Trb {
            flags: TrbFlags::TOGGLE_CYCLE,
            trb_type: TrbType::Link,
            dst: self.base.addr,
            ..Trb::default()
        };
        self.arena
            .write(self.slot_addr(self.entries - 1), link.encode().as_bytes());

        let mut p = self.produce.lock().unwrap();
        p.tail = 0;
        p.cycle = true;
        *self.head.lock().unwrap() = 0;
        self.sem.set(self.entries - 2);
    }

    /// Take the ring's enqueue lock for one logical operation.
    pub(crate) fn lock_ops(&self, abort: &AbortFlag) -> Result<()> {
        self.ops.lock(abort)
    }

    pub(crate) fn unlock_ops(&self) {
        self.ops.unlock();
    }

    /// Block until a slot is free, then take the one at `tail`, advancing
    /// `tail` past the link sentinel if it is reached.
    pub fn acquire_slot(&self, abort: &AbortFlag) -> Result<Slot> {
        self.sem.acquire(abort)?;
        let mut p = self.produce.lock().unwrap();
        if p.tail == self.entries - 1 {
            // Hand the link to the engine for this pass and wrap.
            let link = self.read_raw(p.tail);
            let mut ctrl = link.ctrl & !TrbFlags::CYCLE.bits();
            if p.cycle {
                ctrl |= TrbFlags::CYCLE.bits();
            }
            self.write_ctrl(p.tail, ctrl);
            p.cycle = !p.cycle;
            p.tail = 0;
        }
        let slot = Slot {
            index: p.tail,
            addr: self.slot_addr(p.tail),
            cycle: p.cycle,
        };
        p.tail += 1;
        trace!("{}: acquired slot {}", self.name, slot.index);
        Ok(slot)
    }

    /// Write every field of the descriptor, fence, then set the cycle bit.
    /// A half-built descriptor is never observable by the engine.
    pub fn publish(&self, slot: &Slot, trb: &Trb) {
        let mut t = *trb;
        t.flags.remove(TrbFlags::CYCLE);
        t.cc = CompletionCode::InFlight;
        let raw = t.encode();
        self.arena.write(slot.addr, raw.as_bytes());
        std::sync::atomic::fence(Ordering::Release);
        let mut ctrl = raw.ctrl;
        if slot.cycle {
            ctrl |= TrbFlags::CYCLE.bits();
        }
        self.write_ctrl(slot.index, ctrl);
        trace!("{}: published slot {} len={}", self.name, slot.index, t.len);
    }

    /// Patch the mode word and IOC flag of a published but not-yet-issued
    /// descriptor. Used to coalesce a zero-length finalize onto the pending
    /// block.
    pub fn amend(&self, index: usize, mode: u32, ioc: bool) {
        let mut raw = self.read_raw(index);
        raw.mode = mode;
        self.arena
            .write(self.slot_addr(index) + 16, &mode.to_le_bytes());
        std::sync::atomic::fence(Ordering::Release);
        raw.set_ioc(ioc);
        self.write_ctrl(index, raw.ctrl);
    }

    /// Register the completion to fire when the descriptor at `index`
    /// retires with IOC set.
    pub fn register_waiter(&self, index: usize, completion: Arc<Completion>) {
        *self.waiters[index].lock().unwrap() = Some(completion);
    }

    /// Interrupt-context drain: walk from `head`, retiring every descriptor
    /// whose completion code is set. Clears the code (so the slot can be
    /// reused), releases its semaphore unit and collects the waiter, if any.
    pub fn drain_completed(&self) -> Vec<(Arc<Completion>, CompletionCode)> {
        let mut head = self.head.lock().unwrap();
        let mut woken = Vec::new();
        loop {
            if *head == self.entries - 1 {
                *head = 0;
            }
            let mut raw = self.read_raw(*head);
            let bits = raw.cc_bits();
            if bits == 0 {
                break;
            }
            let cc =
                CompletionCode::from_bits(bits).unwrap_or(CompletionCode::TransferError);
            raw.set_cc(CompletionCode::InFlight);
            self.write_ctrl(*head, raw.ctrl);
            let waiter = self.waiters[*head].lock().unwrap().take();
            trace!(
                "{}: retired slot {} cc={:?} owner={}",
                self.name,
                *head,
                cc,
                raw.owner
            );
            *head += 1;
            self.sem.release();
            if let Some(w) = waiter {
                woken.push((w, cc));
            }
        }
        woken
    }

    pub fn note_trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_irq(&self) {
        self.irqs.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn irq_count(&self) -> u64 {
        self.irqs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn head(&self) -> usize {
        *self.head.lock().unwrap()
    }

    #[must_use]
    pub fn tail(&self) -> usize {
        self.produce.lock().unwrap().tail
    }
}

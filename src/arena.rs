// Licensed under the Apache-2.0 license

//! DMA arena.
//!
//! All memory the engine can reach lives here: descriptor rings, hash
//! scratch regions, cipher workbuffers and payload staging. Regions are
//! addressed by a 32-bit bus address instead of raw pointers, so the
//! hardware-visible layout is explicit and the simulated engine can share
//! the same address space with the driver.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Bus address 0 is reserved as "no pointer".
const BASE_ADDR: u32 = 0x40;

/// A contiguous, engine-visible allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub addr: u32,
    pub len: u32,
}

impl DmaRegion {
    #[must_use]
    pub const fn at(&self, off: u32) -> u32 {
        self.addr + off
    }
}

struct ArenaInner {
    buf: Vec<u8>,
    bump: u32,
    free: Vec<DmaRegion>,
}

pub struct DmaArena {
    inner: Mutex<ArenaInner>,
}

impl DmaArena {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                buf: vec![0u8; size],
                bump: BASE_ADDR,
                free: Vec::new(),
            }),
        }
    }

    /// Allocate `len` bytes aligned to `align` (a power of two).
    pub fn alloc(&self, len: u32, align: u32) -> Result<DmaRegion> {
        let mut inner = self.inner.lock().unwrap();

        // Exact-size reuse keeps the free list trivial; sessions allocate a
        // small set of recurring shapes.
        if let Some(pos) = inner
            .free
            .iter()
            .position(|r| r.len == len && r.addr % align == 0)
        {
            return Ok(inner.free.swap_remove(pos));
        }

        let addr = (inner.bump + align - 1) & !(align - 1);
        let end = addr as u64 + u64::from(len);
        if end > inner.buf.len() as u64 {
            return Err(Error::NoMemory);
        }
        inner.bump = end as u32;
        Ok(DmaRegion { addr, len })
    }

    pub fn free(&self, region: DmaRegion) {
        let mut inner = self.inner.lock().unwrap();
        inner.free.push(region);
    }

    pub fn write(&self, addr: u32, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        inner.buf[a..a + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, addr: u32, out: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        let a = addr as usize;
        out.copy_from_slice(&inner.buf[a..a + out.len()]);
    }

    #[must_use]
    pub fn read_vec(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        self.read(addr, &mut v);
        v
    }

    pub fn fill(&self, addr: u32, len: usize, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        inner.buf[a..a + len].fill(byte);
    }

    /// Copy `len` bytes between two bus ranges. Ranges must not overlap.
    pub fn copy(&self, dst: u32, src: u32, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        let (d, s) = (dst as usize, src as usize);
        let tmp = inner.buf[s..s + len].to_vec();
        inner.buf[d..d + len].copy_from_slice(&tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_disjoint() {
        let arena = DmaArena::new(4096);
        let a = arena.alloc(100, 32).unwrap();
        let b = arena.alloc(100, 32).unwrap();
        assert_eq!(a.addr % 32, 0);
        assert_eq!(b.addr % 32, 0);
        assert!(b.addr >= a.addr + a.len);
        assert_ne!(a.addr, 0);
    }

    #[test]
    fn freed_region_is_reused() {
        let arena = DmaArena::new(4096);
        let a = arena.alloc(64, 32).unwrap();
        arena.free(a);
        let b = arena.alloc(64, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_reports_nomem() {
        let arena = DmaArena::new(256);
        assert_eq!(arena.alloc(4096, 32), Err(Error::NoMemory));
    }

    #[test]
    fn read_back_what_was_written() {
        let arena = DmaArena::new(1024);
        let r = arena.alloc(16, 16).unwrap();
        arena.write(r.addr, &[0xab; 16]);
        assert_eq!(arena.read_vec(r.addr, 16), vec![0xab; 16]);
    }
}

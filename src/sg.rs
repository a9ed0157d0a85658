// Licensed under the Apache-2.0 license

//! Scatter-gather lists over DMA arena memory.
//!
//! Cipher requests present source and destination as independently
//! segmented lists; the walker in [`crate::cipher`] reconciles the two into
//! block-aligned engine transfers.

use crate::arena::{DmaArena, DmaRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSeg {
    pub addr: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SgList {
    segs: Vec<SgSeg>,
}

impl SgList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a whole region as one segment.
    pub fn push_region(&mut self, region: DmaRegion) {
        self.push(SgSeg {
            addr: region.addr,
            len: region.len,
        });
    }

    pub fn push(&mut self, seg: SgSeg) {
        if seg.len > 0 {
            self.segs.push(seg);
        }
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len as usize).sum()
    }

    #[must_use]
    pub fn segs(&self) -> &[SgSeg] {
        &self.segs
    }

    /// Copy `data` into the list's segments, in order.
    pub fn write_from(&self, arena: &DmaArena, data: &[u8]) {
        let mut cur = SgCursor::new(self);
        cur.scatter(arena, data);
    }

    /// Read the first `len` bytes of the list.
    #[must_use]
    pub fn read_to_vec(&self, arena: &DmaArena, len: usize) -> Vec<u8> {
        self.read_range(arena, 0, len)
    }

    /// Read `len` bytes starting `off` bytes into the list.
    #[must_use]
    pub fn read_range(&self, arena: &DmaArena, off: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut cur = SgCursor::new(self);
        cur.advance(off as u32);
        cur.gather(arena, &mut out);
        out
    }
}

/// Walk position inside one list.
#[derive(Debug, Clone)]
pub(crate) struct SgCursor<'a> {
    list: &'a SgList,
    seg: usize,
    off: u32,
}

impl<'a> SgCursor<'a> {
    pub fn new(list: &'a SgList) -> Self {
        Self { list, seg: 0, off: 0 }
    }

    /// Bus address of the current position.
    pub fn addr(&self) -> u32 {
        let s = self.list.segs[self.seg];
        s.addr + self.off
    }

    /// Bytes left in the current segment.
    pub fn seg_remaining(&self) -> u32 {
        if self.seg >= self.list.segs.len() {
            return 0;
        }
        let s = self.list.segs[self.seg];
        s.len - self.off
    }

    /// Advance `n` bytes, crossing segment boundaries as needed.
    pub fn advance(&mut self, mut n: u32) {
        while n > 0 {
            let rem = self.seg_remaining();
            if n < rem {
                self.off += n;
                return;
            }
            n -= rem;
            self.seg += 1;
            self.off = 0;
        }
        // Landing exactly on a boundary moves to the next segment.
        while self.seg < self.list.segs.len() && self.seg_remaining() == 0 {
            self.seg += 1;
            self.off = 0;
        }
    }

    /// Copy bytes at the cursor into `out`, advancing past them.
    pub fn gather(&mut self, arena: &DmaArena, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let rem = self.seg_remaining() as usize;
            let take = rem.min(out.len() - done);
            arena.read(self.addr(), &mut out[done..done + take]);
            self.advance(take as u32);
            done += take;
        }
    }

    /// Copy `data` to the cursor position, advancing past it.
    pub fn scatter(&mut self, arena: &DmaArena, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let rem = self.seg_remaining() as usize;
            let take = rem.min(data.len() - done);
            arena.write(self.addr(), &data[done..done + take]);
            self.advance(take as u32);
            done += take;
        }
    }
}

/// Cursor bookkeeping after one walker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorState {
    BothExhausted,
    SrcExhausted,
    DstExhausted,
    /// Forced re-evaluation: the previous run ended mid-segment.
    NoneExhausted,
}

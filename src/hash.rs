// Licensed under the Apache-2.0 license

//! Hash engine: block buffering and per-algorithm padding/finalization on
//! top of the descriptor ring.
//!
//! A session buffers input until a full block is available, streams whole
//! blocks through the ring as non-terminal descriptors, and attaches the
//! finalize flag plus IOC to the last descriptor of the message. That last
//! descriptor is either a freshly queued padding block or, when no residue
//! remains, the pending descriptor already in the ring.

use std::sync::Arc;

use crate::arena::DmaRegion;
use crate::context::{ExecContext, PollStrategy, QueueArgs};
use crate::device::CryptoDev;
use crate::error::{Error, Result};
use crate::mode::{Algorithm, ModeWord};
use crate::regs::Engine;
use crate::ring::AbortFlag;
use crate::trb::TRB_MAX_LEN;

/// Largest supported block (SHA3-224 rate).
pub const MAX_BLOCK: usize = 144;

/// GHASH tag length.
pub const GHASH_DIGEST_SIZE: usize = 16;

// Scratch region layout. The digest area is sized for the 200-byte Keccak
// state; MD5 and GHASH use its first 16 bytes.
const DIGEST_OFF: u32 = 0;
const DIGEST_LEN: usize = 200;
const SUBKEY_OFF: u32 = 200;
const BUF_OFF: u32 = 216;
const SCRATCH_LEN: u32 = 384;

/// MD5 initial state, stored little-endian.
const MD5_IV: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
    Ghash,
}

impl HashAlgo {
    #[must_use]
    pub const fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha3_224 => 28,
            HashAlgo::Sha3_256 => 32,
            HashAlgo::Sha3_384 => 48,
            HashAlgo::Sha3_512 => 64,
            HashAlgo::Ghash => GHASH_DIGEST_SIZE,
        }
    }

    /// SHA3 block sizes are the sponge rates.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 64,
            HashAlgo::Sha3_224 => 144,
            HashAlgo::Sha3_256 => 136,
            HashAlgo::Sha3_384 => 104,
            HashAlgo::Sha3_512 => 72,
            HashAlgo::Ghash => 16,
        }
    }

    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        match self {
            HashAlgo::Md5 => Algorithm::Md5,
            HashAlgo::Sha3_224 => Algorithm::Sha3_224,
            HashAlgo::Sha3_256 => Algorithm::Sha3_256,
            HashAlgo::Sha3_384 => Algorithm::Sha3_384,
            HashAlgo::Sha3_512 => Algorithm::Sha3_512,
            HashAlgo::Ghash => Algorithm::Ghash,
        }
    }

    #[must_use]
    pub const fn needs_key(&self) -> bool {
        matches!(self, HashAlgo::Ghash)
    }
}

/// Build the terminal padding for the buffered remainder. Pure so the
/// boundary behavior is testable without a ring.
fn build_padding(algo: HashAlgo, residue: &[u8], total: u64) -> Vec<u8> {
    let block = algo.block_size();
    let mut v = residue.to_vec();
    match algo {
        HashAlgo::Md5 => {
            v.push(0x80);
            while v.len() % 64 != 56 {
                v.push(0);
            }
            // 64-bit little-endian bit count, low word first.
            v.extend_from_slice(&total.wrapping_mul(8).to_le_bytes());
        }
        HashAlgo::Ghash => {
            // Zero-fill only; an aligned message emits no extra block.
            if !v.is_empty() {
                v.resize(block, 0);
            }
        }
        _ => {
            // SHA3 domain-separation suffix, then the end-of-message marker
            // folded into the last byte of the rate.
            v.push(0x06);
            v.resize(block, 0);
            v[block - 1] |= 0x80;
        }
    }
    v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Ready,
}

/// Exported mid-stream state. Opaque to callers; `import` restores it on a
/// session of the same algorithm.
#[derive(Clone)]
pub struct HashState {
    algo: HashAlgo,
    digest: [u8; DIGEST_LEN],
    buffer: [u8; MAX_BLOCK],
    total: u64,
    partial: usize,
}

pub struct HashSession {
    dev: Arc<CryptoDev>,
    algo: HashAlgo,
    ctx: ExecContext,
    scratch: DmaRegion,
    staging: Vec<DmaRegion>,
    total: u64,
    partial: usize,
    digest_size: usize,
    key_set: bool,
    state: SessionState,
}

impl HashSession {
    pub fn new(dev: &Arc<CryptoDev>, algo: HashAlgo) -> Result<Self> {
        let scratch = dev.arena().alloc(SCRATCH_LEN, 32)?;
        let ctx = ExecContext::new(
            dev.ring(Engine::Hash).clone(),
            dev.hw().clone(),
            Engine::Hash,
            PollStrategy::Spin,
        );
        Ok(Self {
            dev: dev.clone(),
            algo,
            ctx,
            scratch,
            staging: Vec::new(),
            total: 0,
            partial: 0,
            digest_size: algo.digest_size(),
            key_set: false,
            state: SessionState::Idle,
        })
    }

    #[must_use]
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    #[must_use]
    pub fn digest_size(&self) -> usize {
        self.digest_size
    }

    /// Handle for simulating signal delivery into blocked waits.
    #[must_use]
    pub fn abort_handle(&self) -> AbortFlag {
        self.ctx.abort_flag()
    }

    /// Start a message. With `digest_len == None` this is a capability
    /// query: only the output size is recorded and no state is touched.
    pub fn init(&mut self, digest_len: Option<usize>) -> Result<()> {
        let Some(n) = digest_len else {
            return Ok(());
        };
        if n != self.digest_size {
            return Err(Error::InvalidDataLength);
        }
        if self.algo.needs_key() && !self.key_set {
            return Err(Error::NoKey);
        }
        self.release_staging();
        let arena = self.dev.arena();
        arena.fill(self.scratch.at(DIGEST_OFF), DIGEST_LEN, 0);
        if self.algo == HashAlgo::Md5 {
            let mut iv = [0u8; 16];
            for (i, w) in MD5_IV.iter().enumerate() {
                iv[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
            }
            arena.write(self.scratch.at(DIGEST_OFF), &iv);
        }
        self.total = 0;
        self.partial = 0;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Absorb message bytes, flushing full blocks through the ring without
    /// waiting.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.total = self.total.wrapping_add(data.len() as u64);

        let block = self.algo.block_size();
        let arena = self.dev.arena().clone();
        let left = self.partial;

        if left + data.len() < block {
            arena.write(self.scratch.at(BUF_OFF) + left as u32, data);
            self.partial += data.len();
            return Ok(());
        }

        let mut offset = 0;
        if left > 0 {
            // Complete the buffered block and flush it from a staging copy;
            // the scratch buffer is about to be reused for the new residue.
            let avail = block - left;
            let stage = self.stage(block)?;
            arena.copy(stage.addr, self.scratch.at(BUF_OFF), left);
            arena.write(stage.addr + left as u32, &data[..avail]);
            self.queue_data(stage.addr, block as u32)?;
            offset = avail;
            self.partial = 0;
        }

        // Whole blocks straight from the caller's buffer, split only at the
        // descriptor payload limit.
        let rem = data.len() - offset;
        let whole = rem - rem % block;
        let max_chunk = (TRB_MAX_LEN as usize / block) * block;
        let mut done = 0;
        while done < whole {
            let chunk = (whole - done).min(max_chunk);
            let stage = self.stage(chunk)?;
            arena.write(stage.addr, &data[offset + done..offset + done + chunk]);
            self.queue_data(stage.addr, chunk as u32)?;
            done += chunk;
        }

        let tail = &data[offset + whole..];
        if !tail.is_empty() {
            arena.write(self.scratch.at(BUF_OFF), tail);
        }
        self.partial = tail.len();
        Ok(())
    }

    /// Pad, issue the terminal descriptor, wait, and copy the digest out.
    pub fn finalize(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }
        // Must fail before any descriptor is queued; a finalize that ran
        // the terminal block is not retryable.
        let n = self.digest_size;
        if out.len() < n {
            return Err(Error::InvalidDataLength);
        }
        let arena = self.dev.arena().clone();
        let residue = arena.read_vec(self.scratch.at(BUF_OFF), self.partial);
        let pad = build_padding(self.algo, &residue, self.total);

        let mode = ModeWord {
            finalize: true,
            ..ModeWord::hash(self.algo.algorithm())
        };
        if pad.is_empty() {
            if self.ctx.has_pending() {
                // Aligned GHASH tail: attach the terminal flag to the block
                // already queued.
                self.queue_raw(0, 0, mode, true)?;
                self.ctx.execute()?;
            }
            // An entirely empty message never touches the engine; the
            // seeded state is already the digest.
        } else {
            let stage = self.stage(pad.len())?;
            arena.write(stage.addr, &pad);
            self.queue_raw(stage.addr, pad.len() as u32, mode, true)?;
            self.ctx.execute()?;
        }
        self.release_staging();

        let digest = arena.read_vec(self.scratch.at(DIGEST_OFF), n);
        out[..n].copy_from_slice(&digest);
        self.state = SessionState::Idle;
        Ok(n)
    }

    /// Snapshot mid-stream state between updates. Pending descriptors are
    /// synced into the scratch digest first so the snapshot is
    /// self-contained.
    pub fn export(&mut self) -> Result<HashState> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }
        if self.ctx.has_pending() {
            self.queue_raw(0, 0, ModeWord::hash(self.algo.algorithm()), true)?;
            self.ctx.execute()?;
            self.release_staging();
        }
        let arena = self.dev.arena();
        let mut digest = [0u8; DIGEST_LEN];
        arena.read(self.scratch.at(DIGEST_OFF), &mut digest);
        let mut buffer = [0u8; MAX_BLOCK];
        arena.read(self.scratch.at(BUF_OFF), &mut buffer[..self.partial]);
        Ok(HashState {
            algo: self.algo,
            digest,
            buffer,
            total: self.total,
            partial: self.partial,
        })
    }

    pub fn import(&mut self, state: &HashState) -> Result<()> {
        if state.algo != self.algo {
            return Err(Error::InvalidState);
        }
        let arena = self.dev.arena();
        arena.write(self.scratch.at(DIGEST_OFF), &state.digest);
        arena.write(self.scratch.at(BUF_OFF), &state.buffer[..state.partial]);
        self.total = state.total;
        self.partial = state.partial;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// GHASH sub-key installation. Only 128-bit keys are valid; an odd
    /// length is a legacy calling-convention signal from AEAD composition:
    /// the low bit is masked off and the digest length forced to the tag
    /// size. See DESIGN.md before extending this to new call sites.
    pub fn setkey(&mut self, key: &[u8]) -> Result<()> {
        if !self.algo.needs_key() {
            return Err(Error::Unsupported);
        }
        let mut len = key.len();
        if len % 2 == 1 {
            len &= !1;
            self.digest_size = GHASH_DIGEST_SIZE;
        }
        if len != 16 {
            return Err(Error::InvalidKeyLength);
        }
        self.dev
            .arena()
            .write(self.scratch.at(SUBKEY_OFF), &key[..16]);
        self.key_set = true;
        Ok(())
    }

    fn queue_data(&mut self, src: u32, len: u32) -> Result<()> {
        let mode = ModeWord::hash(self.algo.algorithm());
        self.queue_raw(src, len, mode, false)?;
        // Nothing drains the ring between updates, so force a sync point
        // before it can fill: attach IOC to the block just queued and wait
        // it out.
        if self.ctx.free_slots() <= 1 {
            self.queue_raw(0, 0, mode, true)?;
            self.ctx.execute()?;
            self.release_staging();
        }
        Ok(())
    }

    fn queue_raw(&mut self, src: u32, len: u32, mode: ModeWord, ioc: bool) -> Result<()> {
        let key = if self.algo.needs_key() {
            self.scratch.at(SUBKEY_OFF)
        } else {
            0
        };
        self.ctx.queue(QueueArgs {
            src,
            dst: self.scratch.at(DIGEST_OFF),
            iv: 0,
            key,
            len,
            mode,
            ioc,
        })
    }

    fn stage(&mut self, len: usize) -> Result<DmaRegion> {
        let region = self.dev.arena().alloc(len as u32, 32)?;
        self.staging.push(region);
        Ok(region)
    }

    fn release_staging(&mut self) {
        for region in self.staging.drain(..) {
            self.dev.arena().free(region);
        }
    }
}

impl Drop for HashSession {
    fn drop(&mut self) {
        self.release_staging();
        self.dev.arena().free(self.scratch);
    }
}

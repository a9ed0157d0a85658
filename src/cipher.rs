// Licensed under the Apache-2.0 license

//! Block-cipher engine: the scatter-gather walker and IV/counter
//! bookkeeping on top of the descriptor ring.
//!
//! A request streams `nbytes` across independently segmented source and
//! destination lists. Each walker step takes the largest block-aligned run
//! both current segments allow; runs shorter than a block are staged
//! through the workbuffer bounce block so the engine only ever sees
//! block-aligned transfers.

use std::sync::Arc;

use log::trace;

use crate::arena::DmaRegion;
use crate::context::{ExecContext, PollStrategy, QueueArgs, CIPHER_TIMEOUT};
use crate::device::CryptoDev;
use crate::error::{Error, Result};
use crate::mode::{Algorithm, ChainMode, Direction, KeySize, ModeWord};
use crate::regs::Engine;
use crate::ring::AbortFlag;
use crate::sg::{CursorState, SgCursor, SgList};
use crate::trb::TRB_MAX_LEN;

pub const AES_BLOCK_SIZE: usize = 16;
pub const CHACHA_BLOCK_SIZE: usize = 64;
pub const IV_SIZE: usize = 16;

// Workbuffer layout: running IV/counter, key material, one bounce block.
const IV_OFF: u32 = 0;
const KEY_OFF: u32 = 16;
const BOUNCE_OFF: u32 = 48;
const WORK_LEN: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgo {
    Aes(ChainMode),
    /// Streaming mode; the 16-byte IV is a 32-bit little-endian counter
    /// followed by the 12-byte nonce.
    ChaCha20,
}

impl CipherAlgo {
    #[must_use]
    pub const fn block_size(&self) -> usize {
        match self {
            CipherAlgo::Aes(_) => AES_BLOCK_SIZE,
            CipherAlgo::ChaCha20 => CHACHA_BLOCK_SIZE,
        }
    }

    #[must_use]
    pub const fn needs_iv(&self) -> bool {
        !matches!(self, CipherAlgo::Aes(ChainMode::Ecb))
    }

    /// ECB and CBC operate on whole blocks only.
    #[must_use]
    pub const fn requires_block_multiple(&self) -> bool {
        matches!(self, CipherAlgo::Aes(ChainMode::Ecb) | CipherAlgo::Aes(ChainMode::Cbc))
    }

    const fn algorithm(&self) -> Algorithm {
        match self {
            CipherAlgo::Aes(_) => Algorithm::Aes,
            CipherAlgo::ChaCha20 => Algorithm::ChaCha20,
        }
    }

    const fn chain(&self) -> ChainMode {
        match self {
            CipherAlgo::Aes(chain) => *chain,
            CipherAlgo::ChaCha20 => ChainMode::Ctr,
        }
    }
}

/// One encrypt/decrypt request. `iv` seeds a freshly keyed session; later
/// calls on the same session continue from the stored IV/counter and may
/// omit it.
pub struct CryptRequest<'a> {
    pub src: &'a SgList,
    pub dst: &'a SgList,
    pub nbytes: usize,
    pub iv: Option<[u8; IV_SIZE]>,
}

/// 128-bit little-endian wraparound add, used for the returned CTR counter.
pub(crate) fn ctr_add_le(iv: &mut [u8; IV_SIZE], mut inc: u64) {
    let mut i = 0;
    let mut carry = 0u16;
    while i < IV_SIZE && (inc != 0 || carry != 0) {
        let sum = u16::from(iv[i]) + ((inc & 0xff) as u16) + carry;
        iv[i] = sum as u8;
        carry = sum >> 8;
        inc >>= 8;
        i += 1;
    }
}

pub struct CipherSession {
    dev: Arc<CryptoDev>,
    algo: CipherAlgo,
    ctx: ExecContext,
    work: DmaRegion,
    key_size: KeySize,
    key_set: bool,
    iv_loaded: bool,
}

impl CipherSession {
    pub fn new(dev: &Arc<CryptoDev>, algo: CipherAlgo) -> Result<Self> {
        let work = dev.arena().alloc(WORK_LEN, 32)?;
        let ctx = ExecContext::new(
            dev.ring(Engine::Aes).clone(),
            dev.hw().clone(),
            Engine::Aes,
            PollStrategy::Sleep(CIPHER_TIMEOUT),
        );
        Ok(Self {
            dev: dev.clone(),
            algo,
            ctx,
            work,
            key_size: KeySize::K128,
            key_set: false,
            iv_loaded: false,
        })
    }

    #[must_use]
    pub fn algo(&self) -> CipherAlgo {
        self.algo
    }

    #[must_use]
    pub fn abort_handle(&self) -> AbortFlag {
        self.ctx.abort_flag()
    }

    /// Install key material. AES accepts 128/192/256-bit keys, ChaCha20
    /// only 256-bit. Re-keying restarts IV seeding.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.key_size = match self.algo {
            CipherAlgo::Aes(_) => KeySize::from_byte_len(key.len())?,
            CipherAlgo::ChaCha20 => {
                if key.len() != 32 {
                    return Err(Error::InvalidKeyLength);
                }
                KeySize::K256
            }
        };
        self.dev.arena().write(self.work.at(KEY_OFF), key);
        self.key_set = true;
        self.iv_loaded = false;
        Ok(())
    }

    /// Encrypt; returns the chaining value for the caller (final ciphertext
    /// block for CBC, advanced counter for CTR/ChaCha20, nothing for ECB).
    pub fn encrypt(&mut self, req: &CryptRequest<'_>) -> Result<Option<[u8; IV_SIZE]>> {
        self.crypt(req, Direction::Encrypt)
    }

    pub fn decrypt(&mut self, req: &CryptRequest<'_>) -> Result<Option<[u8; IV_SIZE]>> {
        self.crypt(req, Direction::Decrypt)
    }

    fn crypt(
        &mut self,
        req: &CryptRequest<'_>,
        dir: Direction,
    ) -> Result<Option<[u8; IV_SIZE]>> {
        if !self.key_set {
            return Err(Error::NoKey);
        }
        let block = self.algo.block_size();
        if req.nbytes == 0 {
            return Ok(None);
        }
        if req.nbytes > req.src.total_len() || req.nbytes > req.dst.total_len() {
            return Err(Error::InvalidDataLength);
        }
        if self.algo.requires_block_multiple() && req.nbytes % block != 0 {
            return Err(Error::InvalidDataLength);
        }

        let arena = self.dev.arena().clone();
        if self.algo.needs_iv() && !self.iv_loaded {
            let iv = req.iv.ok_or(Error::InvalidState)?;
            arena.write(self.work.at(IV_OFF), &iv);
            self.iv_loaded = true;
        }

        // Snapshot for the returned counter, and pre-fetch what will become
        // the next IV for CBC decrypt: the engine does not hand back its
        // final internal IV on the decrypt path, and the last ciphertext
        // block may be overwritten by an in-place request.
        let mut iv0 = [0u8; IV_SIZE];
        if self.algo.needs_iv() {
            arena.read(self.work.at(IV_OFF), &mut iv0);
        }
        let cbc_next_iv = match (self.algo, dir) {
            (CipherAlgo::Aes(ChainMode::Cbc), Direction::Decrypt) => {
                let v = req
                    .src
                    .read_range(&arena, req.nbytes - AES_BLOCK_SIZE, AES_BLOCK_SIZE);
                let mut iv = [0u8; IV_SIZE];
                iv.copy_from_slice(&v);
                Some(iv)
            }
            _ => None,
        };

        self.walk(req, dir, block, &arena)?;

        let ret = match self.algo {
            CipherAlgo::Aes(ChainMode::Ecb) => None,
            CipherAlgo::Aes(ChainMode::Cbc) => {
                let iv = match dir {
                    Direction::Encrypt => {
                        let v = req
                            .dst
                            .read_range(&arena, req.nbytes - AES_BLOCK_SIZE, AES_BLOCK_SIZE);
                        let mut iv = [0u8; IV_SIZE];
                        iv.copy_from_slice(&v);
                        iv
                    }
                    Direction::Decrypt => cbc_next_iv.expect("prefetched above"),
                };
                arena.write(self.work.at(IV_OFF), &iv);
                Some(iv)
            }
            CipherAlgo::Aes(ChainMode::Ctr) => {
                let mut iv = iv0;
                ctr_add_le(&mut iv, req.nbytes.div_ceil(AES_BLOCK_SIZE) as u64);
                arena.write(self.work.at(IV_OFF), &iv);
                Some(iv)
            }
            CipherAlgo::ChaCha20 => {
                let mut iv = iv0;
                let ctr = u32::from_le_bytes([iv[0], iv[1], iv[2], iv[3]])
                    .wrapping_add(req.nbytes.div_ceil(CHACHA_BLOCK_SIZE) as u32);
                iv[..4].copy_from_slice(&ctr.to_le_bytes());
                arena.write(self.work.at(IV_OFF), &iv);
                Some(iv)
            }
        };
        Ok(ret)
    }

    fn walk(
        &mut self,
        req: &CryptRequest<'_>,
        dir: Direction,
        block: usize,
        arena: &Arc<crate::arena::DmaArena>,
    ) -> Result<()> {
        let mut src_cur = SgCursor::new(req.src);
        let mut dst_cur = SgCursor::new(req.dst);
        let mut left = req.nbytes;
        let max_run = (TRB_MAX_LEN as usize / block) * block;
        let mut s_rem = src_cur.seg_remaining() as usize;
        let mut d_rem = dst_cur.seg_remaining() as usize;

        while left > 0 {
            let want = s_rem.min(d_rem).min(left);

            if want < block {
                // Segment boundary inside a block: bounce one block through
                // the workbuffer. The engine transfer is block-aligned and
                // must retire before the bounce slot is reused, so this is
                // a forced sync point.
                let take = left.min(block);
                let mut tmp = vec![0u8; block];
                src_cur.gather(arena, &mut tmp[..take]);
                arena.write(self.work.at(BOUNCE_OFF), &tmp);
                self.queue_run(
                    self.work.at(BOUNCE_OFF),
                    self.work.at(BOUNCE_OFF),
                    block as u32,
                    dir,
                    true,
                )?;
                self.ctx.execute()?;
                let mut out = vec![0u8; take];
                arena.read(self.work.at(BOUNCE_OFF), &mut out);
                dst_cur.scatter(arena, &out);
                left -= take;
                // Gather and scatter may have crossed any number of segment
                // boundaries; restart the bookkeeping from the cursors.
                s_rem = src_cur.seg_remaining() as usize;
                d_rem = dst_cur.seg_remaining() as usize;
                trace!("cipher walk: bounced {take} bytes");
                continue;
            }

            let mut run = want.min(max_run);
            // A mid-list run that is not a whole number of blocks is cut at
            // the block boundary; the next step re-evaluates both segments.
            // A cut run ends short of either segment, so it records as
            // NoneExhausted below.
            run -= run % block;

            let state = if run == s_rem && run == d_rem {
                CursorState::BothExhausted
            } else if run == s_rem {
                CursorState::SrcExhausted
            } else if run == d_rem {
                CursorState::DstExhausted
            } else {
                CursorState::NoneExhausted
            };

            let src_addr = src_cur.addr();
            let dst_addr = dst_cur.addr();
            src_cur.advance(run as u32);
            dst_cur.advance(run as u32);
            left -= run;

            // The recorded state decides which side reloads from its cursor
            // (now parked on a fresh segment) and which just consumes run
            // bytes of the segment it is still inside.
            match state {
                CursorState::BothExhausted => {
                    s_rem = src_cur.seg_remaining() as usize;
                    d_rem = dst_cur.seg_remaining() as usize;
                }
                CursorState::SrcExhausted => {
                    s_rem = src_cur.seg_remaining() as usize;
                    d_rem -= run;
                }
                CursorState::DstExhausted => {
                    s_rem -= run;
                    d_rem = dst_cur.seg_remaining() as usize;
                }
                CursorState::NoneExhausted => {
                    s_rem -= run;
                    d_rem -= run;
                }
            }

            // Interrupt only on the terminal descriptor, or when the ring
            // is nearly exhausted and a sync point must be forced before it
            // can stall.
            let ioc = left == 0 || self.ctx.free_slots() <= 1;
            trace!("cipher walk: run {run} ioc {ioc} state {state:?}");
            self.queue_run(src_addr, dst_addr, run as u32, dir, ioc)?;
            if ioc {
                self.ctx.execute()?;
            }
        }
        Ok(())
    }

    fn queue_run(&mut self, src: u32, dst: u32, len: u32, dir: Direction, ioc: bool) -> Result<()> {
        let iv = if self.algo.needs_iv() {
            self.work.at(IV_OFF)
        } else {
            0
        };
        self.ctx.queue(QueueArgs {
            src,
            dst,
            iv,
            key: self.work.at(KEY_OFF),
            len,
            mode: ModeWord {
                algo: self.algo.algorithm(),
                dir,
                key_size: self.key_size,
                chain: self.algo.chain(),
                finalize: false,
            },
            ioc,
        })
    }
}

impl Drop for CipherSession {
    fn drop(&mut self) {
        self.dev.arena().free(self.work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_add_carries_little_endian() {
        let mut iv = [0u8; 16];
        iv[0] = 0xff;
        ctr_add_le(&mut iv, 2);
        assert_eq!(iv[0], 0x01);
        assert_eq!(iv[1], 0x01);
        assert!(iv[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ctr_add_wraps_around_128_bits() {
        let mut iv = [0xff; 16];
        ctr_add_le(&mut iv, 1);
        assert_eq!(iv, [0; 16]);
    }

    #[test]
    fn ctr_add_large_increment() {
        let mut iv = [0u8; 16];
        ctr_add_le(&mut iv, 0x1_0000);
        assert_eq!(&iv[..4], &[0, 0, 1, 0]);
    }

    #[test]
    fn mode_properties() {
        assert!(!CipherAlgo::Aes(ChainMode::Ecb).needs_iv());
        assert!(CipherAlgo::Aes(ChainMode::Cbc).requires_block_multiple());
        assert!(!CipherAlgo::Aes(ChainMode::Ctr).requires_block_multiple());
        assert_eq!(CipherAlgo::ChaCha20.block_size(), 64);
    }
}

// Licensed under the Apache-2.0 license

//! Mode word codec.
//!
//! Descriptor word 4 packs algorithm, direction, key size and the finalize
//! flag. The driver works with the tagged [`ModeWord`] struct; the packed
//! form exists only on the wire.

use crate::error::{Error, Result};

const ALGO_MASK: u32 = 0x3f;
const DECRYPT_BIT: u32 = 1 << 6;
const KEY_SIZE_SHIFT: u32 = 8;
const KEY_SIZE_MASK: u32 = 0x3 << KEY_SIZE_SHIFT;
const FINALIZE_BIT: u32 = 1 << 12;
const CHAIN_SHIFT: u32 = 16;
const CHAIN_MASK: u32 = 0xf << CHAIN_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
    Ghash,
    Aes,
    ChaCha20,
}

impl Algorithm {
    const fn bits(self) -> u32 {
        match self {
            Algorithm::Md5 => 1,
            Algorithm::Sha3_224 => 2,
            Algorithm::Sha3_256 => 3,
            Algorithm::Sha3_384 => 4,
            Algorithm::Sha3_512 => 5,
            Algorithm::Ghash => 6,
            Algorithm::Aes => 8,
            Algorithm::ChaCha20 => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Encrypt,
    Decrypt,
}

/// AES key sizes. Hash transforms ignore the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySize {
    #[default]
    K128,
    K192,
    K256,
}

impl KeySize {
    #[must_use]
    pub const fn byte_len(self) -> usize {
        match self {
            KeySize::K128 => 16,
            KeySize::K192 => 24,
            KeySize::K256 => 32,
        }
    }

    pub fn from_byte_len(len: usize) -> Result<Self> {
        match len {
            16 => Ok(KeySize::K128),
            24 => Ok(KeySize::K192),
            32 => Ok(KeySize::K256),
            _ => Err(Error::InvalidKeyLength),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainMode {
    #[default]
    Ecb,
    Cbc,
    Ctr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeWord {
    pub algo: Algorithm,
    pub dir: Direction,
    pub key_size: KeySize,
    pub chain: ChainMode,
    pub finalize: bool,
}

impl ModeWord {
    #[must_use]
    pub const fn hash(algo: Algorithm) -> Self {
        Self {
            algo,
            dir: Direction::Encrypt,
            key_size: KeySize::K128,
            chain: ChainMode::Ecb,
            finalize: false,
        }
    }

    #[must_use]
    pub fn encode(&self) -> u32 {
        let mut w = self.algo.bits();
        if matches!(self.dir, Direction::Decrypt) {
            w |= DECRYPT_BIT;
        }
        w |= (self.key_size as u32) << KEY_SIZE_SHIFT;
        if self.finalize {
            w |= FINALIZE_BIT;
        }
        w |= match self.chain {
            ChainMode::Ecb => 0,
            ChainMode::Cbc => 1,
            ChainMode::Ctr => 2,
        } << CHAIN_SHIFT;
        w
    }

    pub fn decode(w: u32) -> Result<Self> {
        let algo = match w & ALGO_MASK {
            1 => Algorithm::Md5,
            2 => Algorithm::Sha3_224,
            3 => Algorithm::Sha3_256,
            4 => Algorithm::Sha3_384,
            5 => Algorithm::Sha3_512,
            6 => Algorithm::Ghash,
            8 => Algorithm::Aes,
            9 => Algorithm::ChaCha20,
            _ => return Err(Error::Unsupported),
        };
        let key_size = match (w & KEY_SIZE_MASK) >> KEY_SIZE_SHIFT {
            0 => KeySize::K128,
            1 => KeySize::K192,
            2 => KeySize::K256,
            _ => return Err(Error::InvalidKeyLength),
        };
        let chain = match (w & CHAIN_MASK) >> CHAIN_SHIFT {
            0 => ChainMode::Ecb,
            1 => ChainMode::Cbc,
            2 => ChainMode::Ctr,
            _ => return Err(Error::Unsupported),
        };
        Ok(ModeWord {
            algo,
            dir: if w & DECRYPT_BIT != 0 {
                Direction::Decrypt
            } else {
                Direction::Encrypt
            },
            key_size,
            chain,
            finalize: w & FINALIZE_BIT != 0,
        })
    }
}

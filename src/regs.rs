// Licensed under the Apache-2.0 license

//! Register map of the security engine.
//!
//! Three independent descriptor-ring engines (AES, HASH, RSA) share one
//! interrupt flag/enable pair. Only the AES and HASH banks are driven by
//! this crate; the RSA bank is listed for completeness of the map, its
//! exponentiation path is delegated to an external library.

// Per-engine control banks
pub const SEC_AES_CR: u32 = 0x000; // control: run/reset
pub const SEC_AES_ER: u32 = 0x004; // ring base address
pub const SEC_AES_TRIG: u32 = 0x008; // doorbell
pub const SEC_AES_DEQ: u32 = 0x00c; // dequeue cursor (read only)

pub const SEC_HASH_CR: u32 = 0x100;
pub const SEC_HASH_ER: u32 = 0x104;
pub const SEC_HASH_TRIG: u32 = 0x108;
pub const SEC_HASH_DEQ: u32 = 0x10c;

pub const SEC_RSA_CR: u32 = 0x200;
pub const SEC_RSA_ER: u32 = 0x204;
pub const SEC_RSA_TRIG: u32 = 0x208;
pub const SEC_RSA_DEQ: u32 = 0x20c;

// Shared interrupt registers. Flags are write-one-to-clear.
pub const SEC_IF: u32 = 0x300;
pub const SEC_IE: u32 = 0x304;

// SEC_*_CR bits
pub const SEC_CR_RUN: u32 = 1 << 0;
pub const SEC_CR_RESET: u32 = 1 << 1;

// SEC_IF / SEC_IE bits: per-engine "descriptor done" and "event ring full"
pub const SEC_IF_AES_TRB_DONE: u32 = 1 << 0;
pub const SEC_IF_AES_RING_FULL: u32 = 1 << 1;
pub const SEC_IF_HASH_TRB_DONE: u32 = 1 << 4;
pub const SEC_IF_HASH_RING_FULL: u32 = 1 << 5;
pub const SEC_IF_RSA_TRB_DONE: u32 = 1 << 8;
pub const SEC_IF_RSA_RING_FULL: u32 = 1 << 9;

/// Ring-backed engines driven by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Aes,
    Hash,
}

impl Engine {
    #[must_use]
    pub const fn cr(&self) -> u32 {
        match self {
            Engine::Aes => SEC_AES_CR,
            Engine::Hash => SEC_HASH_CR,
        }
    }

    #[must_use]
    pub const fn er(&self) -> u32 {
        match self {
            Engine::Aes => SEC_AES_ER,
            Engine::Hash => SEC_HASH_ER,
        }
    }

    #[must_use]
    pub const fn trig(&self) -> u32 {
        match self {
            Engine::Aes => SEC_AES_TRIG,
            Engine::Hash => SEC_HASH_TRIG,
        }
    }

    #[must_use]
    pub const fn deq(&self) -> u32 {
        match self {
            Engine::Aes => SEC_AES_DEQ,
            Engine::Hash => SEC_HASH_DEQ,
        }
    }

    #[must_use]
    pub const fn done_bit(&self) -> u32 {
        match self {
            Engine::Aes => SEC_IF_AES_TRB_DONE,
            Engine::Hash => SEC_IF_HASH_TRB_DONE,
        }
    }

    #[must_use]
    pub const fn ring_full_bit(&self) -> u32 {
        match self {
            Engine::Aes => SEC_IF_AES_RING_FULL,
            Engine::Hash => SEC_IF_HASH_RING_FULL,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Engine::Aes => "aes",
            Engine::Hash => "hash",
        }
    }
}

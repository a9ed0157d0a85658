// Licensed under the Apache-2.0 license

//! Driver for a descriptor-ring security engine offering hash (MD5, SHA3,
//! GHASH) and block/stream cipher (AES, ChaCha20) offload.
//!
//! The engine consumes fixed-size transfer request blocks (TRBs) from
//! per-class circular rings and signals completion through a shared
//! interrupt flag register. The driver side is split along that contract:
//!
//! * [`trb`] / [`ring`]: the descriptor codec and the cycle-bit ring with
//!   its link sentinel, slot semaphore and completion dispatcher;
//! * [`context`]: the enqueue-and-maybe-wait protocol, where only IOC
//!   descriptors wake a waiter and everything before them is coalesced;
//! * [`hash`]: block buffering, per-algorithm padding and mid-stream
//!   export/import on the hash ring;
//! * [`cipher`]: the scatter-gather walker and IV/counter bookkeeping on
//!   the cipher ring;
//! * [`device`]: bring-up, the interrupt dispatcher and debug controls;
//! * [`sim`]: a software engine behind the same register seam, used by
//!   the test suite.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sp_crypto::arena::DmaArena;
//! use sp_crypto::device::CryptoDev;
//! use sp_crypto::hash::{HashAlgo, HashSession};
//! use sp_crypto::sim::SimHw;
//!
//! # fn main() -> sp_crypto::error::Result<()> {
//! let arena = Arc::new(DmaArena::new(1 << 20));
//! let hw = SimHw::new(arena.clone())?;
//! let dev = CryptoDev::new(hw, arena, 32)?;
//!
//! let mut session = HashSession::new(&dev, HashAlgo::Sha3_256)?;
//! session.init(Some(32))?;
//! session.update(b"hello")?;
//! let mut digest = [0u8; 32];
//! session.finalize(&mut digest)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod cipher;
pub mod context;
pub mod device;
pub mod error;
pub mod hash;
pub mod hw;
pub mod mode;
pub mod regs;
pub mod ring;
pub mod sg;
pub mod sim;
pub mod trb;

pub use arena::{DmaArena, DmaRegion};
pub use cipher::{CipherAlgo, CipherSession, CryptRequest};
pub use device::{CryptoDev, RingState};
pub use error::{Error, Result};
pub use hash::{HashAlgo, HashSession, HashState};
pub use mode::{ChainMode, Direction};
pub use sg::{SgList, SgSeg};
pub use sim::SimHw;

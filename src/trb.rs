// Licensed under the Apache-2.0 license

//! Transfer request block (TRB) model and wire codec.
//!
//! The engine consumes fixed 32-byte descriptors. The decoded [`Trb`] is
//! what the driver reasons about; [`RawTrb`] is the packed hardware layout,
//! converted at the boundary by an explicit encode/decode pair instead of
//! struct aliasing.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Maximum payload a single descriptor may carry.
pub const TRB_MAX_LEN: u32 = 64 * 1024;

/// Size of one descriptor on the wire.
pub const TRB_SIZE: u32 = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrbFlags: u32 {
        /// Ownership bit: the descriptor belongs to the ring's current pass.
        const CYCLE = 1 << 0;
        /// Consumer flips its cycle state after following this link.
        const TOGGLE_CYCLE = 1 << 1;
        /// Raise an interrupt when this descriptor completes.
        const IOC = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrbType {
    #[default]
    Normal,
    Link,
}

impl TrbType {
    const fn bits(self) -> u32 {
        match self {
            TrbType::Normal => 1,
            TrbType::Link => 2,
        }
    }
}

/// Completion codes written back by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionCode {
    /// Not yet consumed (or still in flight).
    #[default]
    InFlight,
    Success,
    /// The engine rejected the installed key material.
    BadKeyLength,
    TransferError,
}

impl CompletionCode {
    const fn bits(self) -> u32 {
        match self {
            CompletionCode::InFlight => 0,
            CompletionCode::Success => 1,
            CompletionCode::BadKeyLength => 2,
            CompletionCode::TransferError => 3,
        }
    }

    pub(crate) fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            0 => Ok(CompletionCode::InFlight),
            1 => Ok(CompletionCode::Success),
            2 => Ok(CompletionCode::BadKeyLength),
            3 => Ok(CompletionCode::TransferError),
            _ => Err(Error::Hardware(bits as u8)),
        }
    }

    /// Driver-side error mapping for a terminal descriptor.
    pub fn to_result(self) -> Result<()> {
        match self {
            CompletionCode::Success => Ok(()),
            CompletionCode::BadKeyLength => Err(Error::InvalidKeyLength),
            CompletionCode::TransferError => Err(Error::Hardware(self.bits() as u8)),
            CompletionCode::InFlight => Err(Error::InvalidState),
        }
    }
}

/// Packed hardware layout: eight little-endian 32-bit words.
///
/// `w0` control (flags / type / completion code), `w1` payload length,
/// `w2` source, `w3` destination, `w4` mode word, `w5` IV pointer,
/// `w6` key pointer, `w7` opaque owner tag.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawTrb {
    pub ctrl: u32,
    pub len: u32,
    pub src: u32,
    pub dst: u32,
    pub mode: u32,
    pub iv: u32,
    pub key: u32,
    pub owner: u32,
}

const_assert_eq!(core::mem::size_of::<RawTrb>(), TRB_SIZE as usize);

const CTRL_TYPE_SHIFT: u32 = 4;
const CTRL_TYPE_MASK: u32 = 0xf << CTRL_TYPE_SHIFT;
const CTRL_CC_SHIFT: u32 = 8;
const CTRL_CC_MASK: u32 = 0xff << CTRL_CC_SHIFT;

/// Decoded descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub flags: TrbFlags,
    pub trb_type: TrbType,
    pub cc: CompletionCode,
    pub len: u32,
    pub src: u32,
    pub dst: u32,
    pub mode: u32,
    pub iv: u32,
    pub key: u32,
    pub owner: u32,
}

impl Trb {
    #[must_use]
    pub fn encode(&self) -> RawTrb {
        RawTrb {
            ctrl: self.flags.bits()
                | (self.trb_type.bits() << CTRL_TYPE_SHIFT)
                | (self.cc.bits() << CTRL_CC_SHIFT),
            len: self.len,
            src: self.src,
            dst: self.dst,
            mode: self.mode,
            iv: self.iv,
            key: self.key,
            owner: self.owner,
        }
    }

    pub fn decode(raw: &RawTrb) -> Result<Self> {
        let trb_type = match (raw.ctrl & CTRL_TYPE_MASK) >> CTRL_TYPE_SHIFT {
            1 => TrbType::Normal,
            2 => TrbType::Link,
            _ => return Err(Error::Hardware(0xff)),
        };
        Ok(Trb {
            flags: TrbFlags::from_bits_truncate(raw.ctrl),
            trb_type,
            cc: CompletionCode::from_bits((raw.ctrl & CTRL_CC_MASK) >> CTRL_CC_SHIFT)?,
            len: raw.len,
            src: raw.src,
            dst: raw.dst,
            mode: raw.mode,
            iv: raw.iv,
            key: raw.key,
            owner: raw.owner,
        })
    }
}

impl RawTrb {
    pub fn cycle(&self) -> bool {
        self.ctrl & TrbFlags::CYCLE.bits() != 0
    }

    pub fn cc_bits(&self) -> u32 {
        (self.ctrl & CTRL_CC_MASK) >> CTRL_CC_SHIFT
    }

    pub fn set_cc(&mut self, cc: CompletionCode) {
        self.ctrl = (self.ctrl & !CTRL_CC_MASK) | (cc.bits() << CTRL_CC_SHIFT);
    }

    pub fn set_ioc(&mut self, ioc: bool) {
        if ioc {
            self.ctrl |= TrbFlags::IOC.bits();
        } else {
            self.ctrl &= !TrbFlags::IOC.bits();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let trb = Trb {
            flags: TrbFlags::CYCLE | TrbFlags::IOC,
            trb_type: TrbType::Normal,
            cc: CompletionCode::InFlight,
            len: 4096,
            src: 0x1000,
            dst: 0x2000,
            mode: 0xdead,
            iv: 0x3000,
            key: 0x4000,
            owner: 7,
        };
        let raw = trb.encode();
        assert_eq!(Trb::decode(&raw).unwrap(), trb);
    }

    #[test]
    fn link_trb_encoding() {
        let link = Trb {
            flags: TrbFlags::TOGGLE_CYCLE,
            trb_type: TrbType::Link,
            dst: 0x40,
            ..Trb::default()
        };
        let raw = link.encode();
        assert!(!raw.cycle());
        let back = Trb::decode(&raw).unwrap();
        assert_eq!(back.trb_type, TrbType::Link);
        assert!(back.flags.contains(TrbFlags::TOGGLE_CYCLE));
        assert_eq!(back.dst, 0x40);
    }

    #[test]
    fn completion_code_patch_preserves_rest() {
        let trb = Trb {
            flags: TrbFlags::CYCLE,
            len: 64,
            src: 0x80,
            ..Trb::default()
        };
        let mut raw = trb.encode();
        raw.set_cc(CompletionCode::Success);
        let back = Trb::decode(&raw).unwrap();
        assert_eq!(back.cc, CompletionCode::Success);
        assert_eq!(back.len, 64);
        assert_eq!(back.src, 0x80);
        assert!(back.flags.contains(TrbFlags::CYCLE));
    }

    #[test]
    fn failing_codes_map_to_errors() {
        assert_eq!(
            CompletionCode::BadKeyLength.to_result(),
            Err(Error::InvalidKeyLength)
        );
        assert!(matches!(
            CompletionCode::TransferError.to_result(),
            Err(Error::Hardware(_))
        ));
        assert_eq!(CompletionCode::Success.to_result(), Ok(()));
    }

    #[test]
    fn wire_layout_is_little_endian_words() {
        let trb = Trb {
            flags: TrbFlags::CYCLE,
            trb_type: TrbType::Normal,
            len: 0x0102_0304,
            ..Trb::default()
        };
        let raw = trb.encode();
        let bytes = raw.as_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
    }
}

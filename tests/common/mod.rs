// Licensed under the Apache-2.0 license

//! Shared fixtures: a simulated device and scatter-gather helpers.

#![allow(dead_code)]

use std::sync::Arc;

use sp_crypto::{CryptoDev, DmaArena, SgList, SimHw};

pub fn device() -> Arc<CryptoDev> {
    device_with_ring(32)
}

pub fn device_with_ring(entries: usize) -> Arc<CryptoDev> {
    let arena = Arc::new(DmaArena::new(1 << 22));
    let hw = SimHw::new(arena.clone()).expect("sim workers");
    CryptoDev::new(hw, arena, entries).expect("device bring-up")
}

/// Allocate a list with the given segment lengths.
pub fn sg_alloc(arena: &DmaArena, seg_lens: &[u32]) -> SgList {
    let mut list = SgList::new();
    for &len in seg_lens {
        list.push_region(arena.alloc(len, 4).expect("sg segment"));
    }
    list
}

/// Allocate a list covering `data`, fragmented per `seg_lens`.
pub fn sg_from(arena: &DmaArena, data: &[u8], seg_lens: &[u32]) -> SgList {
    assert_eq!(seg_lens.iter().sum::<u32>() as usize, data.len());
    let list = sg_alloc(arena, seg_lens);
    list.write_from(arena, data);
    list
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) + 3) as u8).collect()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

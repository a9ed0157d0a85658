// Licensed under the Apache-2.0 license

//! Cipher engine tests: scatter-gather walks, chaining continuation and
//! counter bookkeeping, checked against direct software references.

mod common;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::{Aes128, Aes256};
use common::{device, device_with_ring, hex, pattern, sg_alloc, sg_from};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sp_crypto::{ChainMode, CipherAlgo, CipherSession, CryptRequest, Error};

fn ecb_reference(key: &[u8], data: &[u8], encrypt: bool) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(key).unwrap();
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        let block = GenericArray::from_mut_slice(chunk);
        if encrypt {
            cipher.encrypt_block(block);
        } else {
            cipher.decrypt_block(block);
        }
    }
    out
}

fn cbc_encrypt_reference(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(key).unwrap();
    let mut prev = *iv;
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        for (c, p) in chunk.iter_mut().zip(&prev) {
            *c ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
    out
}

fn ctr_reference(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes256::new_from_slice(key).unwrap();
    let mut ctr = *iv;
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(16) {
        let mut ks = ctr;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut ks));
        for (c, k) in chunk.iter_mut().zip(&ks) {
            *c ^= k;
        }
        // Little-endian increment.
        for b in ctr.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }
    out
}

fn chacha_reference(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let counter = u32::from_le_bytes([iv[0], iv[1], iv[2], iv[3]]);
    let mut stream = chacha20::ChaCha20::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&iv[4..16]),
    );
    stream.seek(u64::from(counter) * 64);
    let mut out = data.to_vec();
    stream.apply_keystream(&mut out);
    out
}

#[test]
fn aes128_ecb_zero_block_vector() {
    let dev = device();
    let arena = dev.arena().clone();
    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ecb)).unwrap();
    s.set_key(&[0u8; 16]).unwrap();

    let src = sg_from(&arena, &[0u8; 16], &[16]);
    let dst = sg_alloc(&arena, &[16]);
    let ret = s
        .encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 16,
            iv: None,
        })
        .unwrap();
    assert!(ret.is_none());
    assert_eq!(
        hex(&dst.read_to_vec(&arena, 16)),
        "66e94bd4ef8a2c3b884cfa59ca342b2e"
    );
}

#[test]
fn ecb_fragmented_matches_reference() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(16);
    let msg = pattern(160);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ecb)).unwrap();
    s.set_key(&key).unwrap();
    let src = sg_from(&arena, &msg, &[7, 33, 24, 96]);
    let dst = sg_alloc(&arena, &[50, 110]);
    s.encrypt(&CryptRequest {
        src: &src,
        dst: &dst,
        nbytes: 160,
        iv: None,
    })
    .unwrap();
    assert_eq!(
        dst.read_to_vec(&arena, 160),
        ecb_reference(&key, &msg, true)
    );

    // And back.
    let back = sg_alloc(&arena, &[160]);
    s.decrypt(&CryptRequest {
        src: &dst,
        dst: &back,
        nbytes: 160,
        iv: None,
    })
    .unwrap();
    assert_eq!(back.read_to_vec(&arena, 160), msg);
}

#[test]
fn cbc_chained_calls_match_one_shot() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(16);
    let iv = [0x3cu8; 16];
    let msg = pattern(128);
    let expect = cbc_encrypt_reference(&key, &iv, &msg);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Cbc)).unwrap();
    s.set_key(&key).unwrap();

    let src_a = sg_from(&arena, &msg[..64], &[64]);
    let dst_a = sg_alloc(&arena, &[64]);
    let ret_a = s
        .encrypt(&CryptRequest {
            src: &src_a,
            dst: &dst_a,
            nbytes: 64,
            iv: Some(iv),
        })
        .unwrap()
        .unwrap();
    // The chaining value is the last ciphertext block so far.
    assert_eq!(ret_a.to_vec(), expect[48..64].to_vec());

    // Continuation without re-seeding the IV.
    let src_b = sg_from(&arena, &msg[64..], &[64]);
    let dst_b = sg_alloc(&arena, &[64]);
    s.encrypt(&CryptRequest {
        src: &src_b,
        dst: &dst_b,
        nbytes: 64,
        iv: None,
    })
    .unwrap();

    let mut got = dst_a.read_to_vec(&arena, 64);
    got.extend(dst_b.read_to_vec(&arena, 64));
    assert_eq!(got, expect);
}

#[test]
fn cbc_in_place_decrypt_returns_last_ciphertext_block() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(16);
    let iv = [0x9au8; 16];
    let msg = pattern(96);
    let ct = cbc_encrypt_reference(&key, &iv, &msg);
    let mut last_ct = [0u8; 16];
    last_ct.copy_from_slice(&ct[80..96]);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Cbc)).unwrap();
    s.set_key(&key).unwrap();
    // One list serving as both source and destination.
    let buf = sg_from(&arena, &ct, &[40, 56]);
    let ret = s
        .decrypt(&CryptRequest {
            src: &buf,
            dst: &buf,
            nbytes: 96,
            iv: Some(iv),
        })
        .unwrap()
        .unwrap();
    assert_eq!(buf.read_to_vec(&arena, 96), msg);
    assert_eq!(ret, last_ct);
}

#[test]
fn ctr_partial_tail_bounces_and_advances_counter() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(32);
    let iv = [0x01u8; 16];
    let msg = pattern(50);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ctr)).unwrap();
    s.set_key(&key).unwrap();
    let src = sg_from(&arena, &msg, &[50]);
    let dst = sg_alloc(&arena, &[50]);
    let ret = s
        .encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 50,
            iv: Some(iv),
        })
        .unwrap()
        .unwrap();
    assert_eq!(dst.read_to_vec(&arena, 50), ctr_reference(&key, &iv, &msg));

    // ceil(50 / 16) = 4 blocks consumed.
    let mut want = iv;
    want[0] = 0x05;
    assert_eq!(ret, want);
}

#[test]
fn ctr_counter_wraps_little_endian() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(32);
    let iv = [0xffu8; 16];
    let msg = pattern(32);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ctr)).unwrap();
    s.set_key(&key).unwrap();
    let src = sg_from(&arena, &msg, &[32]);
    let dst = sg_alloc(&arena, &[32]);
    let ret = s
        .encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 32,
            iv: Some(iv),
        })
        .unwrap()
        .unwrap();
    assert_eq!(dst.read_to_vec(&arena, 32), ctr_reference(&key, &iv, &msg));
    let mut want = [0u8; 16];
    want[0] = 0x01;
    assert_eq!(ret, want);
}

#[test]
fn chacha20_matches_reference_and_advances_counter() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(32);
    let mut iv = [0u8; 16];
    iv[0] = 1; // start at block counter 1
    iv[4..].copy_from_slice(&pattern(12));
    let msg = pattern(200);

    let mut s = CipherSession::new(&dev, CipherAlgo::ChaCha20).unwrap();
    s.set_key(&key).unwrap();
    let src = sg_from(&arena, &msg, &[100, 100]);
    let dst = sg_alloc(&arena, &[64, 136]);
    let ret = s
        .encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 200,
            iv: Some(iv),
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        dst.read_to_vec(&arena, 200),
        chacha_reference(&key, &iv, &msg)
    );
    // ceil(200 / 64) = 4 blocks.
    assert_eq!(u32::from_le_bytes([ret[0], ret[1], ret[2], ret[3]]), 5);
    assert_eq!(&ret[4..], &iv[4..]);
}

#[test]
fn small_ring_backpressure_preserves_data() {
    // Capacity four; a heavily fragmented request forces mid-stream sync
    // points through the IOC valve.
    let dev = device_with_ring(6);
    let arena = dev.arena().clone();
    let key = pattern(32);
    let iv = [0x55u8; 16];
    let msg = pattern(256);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ctr)).unwrap();
    s.set_key(&key).unwrap();
    let frags = [16u32; 16];
    let src = sg_from(&arena, &msg, &frags);
    let dst = sg_alloc(&arena, &frags);
    s.encrypt(&CryptRequest {
        src: &src,
        dst: &dst,
        nbytes: 256,
        iv: Some(iv),
    })
    .unwrap();
    assert_eq!(dst.read_to_vec(&arena, 256), ctr_reference(&key, &iv, &msg));
}

#[test]
fn missing_key_and_iv_are_rejected() {
    let dev = device();
    let arena = dev.arena().clone();
    let src = sg_from(&arena, &pattern(16), &[16]);
    let dst = sg_alloc(&arena, &[16]);
    let req = CryptRequest {
        src: &src,
        dst: &dst,
        nbytes: 16,
        iv: None,
    };

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Cbc)).unwrap();
    assert_eq!(s.encrypt(&req), Err(Error::NoKey));
    s.set_key(&[0u8; 16]).unwrap();
    // First call on a fresh key must seed the IV.
    assert_eq!(s.encrypt(&req), Err(Error::InvalidState));
}

#[test]
fn key_length_validation() {
    let dev = device();
    let mut aes = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ecb)).unwrap();
    assert_eq!(aes.set_key(&[0u8; 20]), Err(Error::InvalidKeyLength));
    aes.set_key(&[0u8; 24]).unwrap();

    let mut chacha = CipherSession::new(&dev, CipherAlgo::ChaCha20).unwrap();
    assert_eq!(chacha.set_key(&[0u8; 16]), Err(Error::InvalidKeyLength));
    chacha.set_key(&[0u8; 32]).unwrap();
}

#[test]
fn data_length_validation() {
    let dev = device();
    let arena = dev.arena().clone();
    let src = sg_from(&arena, &pattern(32), &[32]);
    let dst = sg_alloc(&arena, &[32]);

    let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ecb)).unwrap();
    s.set_key(&[0u8; 16]).unwrap();
    // ECB requires whole blocks.
    assert_eq!(
        s.encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 30,
            iv: None,
        }),
        Err(Error::InvalidDataLength)
    );
    // Request longer than the lists.
    assert_eq!(
        s.encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 48,
            iv: None,
        }),
        Err(Error::InvalidDataLength)
    );
    // Zero bytes is a no-op.
    assert_eq!(
        s.encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: 0,
            iv: None,
        }),
        Ok(None)
    );
}

/// Random cut points summing to `total`.
fn random_frags(rng: &mut StdRng, total: u32) -> Vec<u32> {
    let mut frags = Vec::new();
    let mut left = total;
    while left > 0 {
        let n = rng.gen_range(1..=left.min(96));
        frags.push(n);
        left -= n;
    }
    frags
}

#[test]
fn randomized_fragmentation_sweep() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(32);
    let iv = [0x77u8; 16];

    for _ in 0..8 {
        let len = rng.gen_range(1..600usize);
        let msg: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let mut s = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Ctr)).unwrap();
        s.set_key(&key).unwrap();
        let src = sg_from(&arena, &msg, &random_frags(&mut rng, len as u32));
        let dst = sg_alloc(&arena, &random_frags(&mut rng, len as u32));
        s.encrypt(&CryptRequest {
            src: &src,
            dst: &dst,
            nbytes: len,
            iv: Some(iv),
        })
        .unwrap();
        assert_eq!(
            dst.read_to_vec(&arena, len),
            ctr_reference(&key, &iv, &msg),
            "len {len}"
        );
    }
}

#[test]
fn aes256_cbc_round_trip_random_fragmentation() {
    let dev = device();
    let arena = dev.arena().clone();
    let key = pattern(32);
    let iv = [0xe1u8; 16];
    let msg = pattern(208);

    let mut enc = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Cbc)).unwrap();
    enc.set_key(&key).unwrap();
    let src = sg_from(&arena, &msg, &[13, 3, 112, 80]);
    let ct = sg_alloc(&arena, &[208]);
    enc.encrypt(&CryptRequest {
        src: &src,
        dst: &ct,
        nbytes: 208,
        iv: Some(iv),
    })
    .unwrap();

    let mut dec = CipherSession::new(&dev, CipherAlgo::Aes(ChainMode::Cbc)).unwrap();
    dec.set_key(&key).unwrap();
    let pt = sg_alloc(&arena, &[100, 108]);
    dec.decrypt(&CryptRequest {
        src: &ct,
        dst: &pt,
        nbytes: 208,
        iv: Some(iv),
    })
    .unwrap();
    assert_eq!(pt.read_to_vec(&arena, 208), msg);
}

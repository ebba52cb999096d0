// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The "mug": a stable, 32-bit, non-cryptographic checksum over a page's
//! contents.
//!
//! The only property patches and recovery rely on is that two pages with
//! identical bytes produce identical checksums, and that the function is
//! stable across runs (no per-process salt, no page-address salt). The
//! mixer below is a small xorshift/multiply accumulator, in the same spirit
//! as the dependency-free deterministic mixers test code elsewhere reaches
//! for instead of pulling in a hashing crate.

const SEED: u64 = 0x9E37_79B9_7F4A_7C15;
const MULTIPLIER: u64 = 0x2545_F491_4F6C_DD1D;

/// Compute the mug of a page's contents.
///
/// `bytes` is treated as an array of little-endian 32-bit words; its length
/// need not be a multiple of 4, but in practice it is always called with a
/// full page (whose size is itself a multiple of the word size).
#[must_use]
pub fn mug(bytes: &[u8]) -> u32 {
    let mut acc = SEED ^ (bytes.len() as u64);

    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        acc ^= u64::from(word);
        acc = acc.wrapping_mul(MULTIPLIER);
        acc ^= acc >> 27;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut buf = [0u8; 4];
        buf[..remainder.len()].copy_from_slice(remainder);
        let word = u32::from_le_bytes(buf);
        acc ^= u64::from(word);
        acc = acc.wrapping_mul(MULTIPLIER);
        acc ^= acc >> 27;
    }

    (acc ^ (acc >> 32)) as u32
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::cell::Cell;

use loom_snapshot::{Bail, BailReason, Config, Engine, Road, Watermarks};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

const PAGE_SIZE: usize = 0x1000;
const PAGE_COUNT: usize = 8;

/// A `Road` whose watermarks can be moved between calls, the way a real
/// host's frontiers advance as its arena grows.
struct MovableRoad(Cell<Watermarks>);

impl Road for MovableRoad {
    fn watermarks(&self) -> Watermarks {
        self.0.get()
    }
}

struct PanicBail;

impl Bail for PanicBail {
    fn bail(&self, reason: BailReason) {
        panic!("unexpected bail: {reason:?}");
    }
}

fn engine_at(
    root: &std::path::Path,
    watermarks: Watermarks,
) -> Engine<MovableRoad, PanicBail> {
    let config = Config::new(root, PAGE_SIZE, PAGE_COUNT).unwrap();
    Engine::new(config, MovableRoad(Cell::new(watermarks)), PanicBail).unwrap()
}

/// Place the guard page once, right after `live`, the way a host's first
/// touch of the loom would. The very first call to `fault` places the
/// guard unconditionally and asks for a retry, regardless of the address
/// passed in, so any in-bounds address works here.
fn place_guard(engine: &mut Engine<MovableRoad, PanicBail>) {
    engine.fault(engine.base_addr(), true).unwrap();
}

/// Write a page that is still in its fresh, never-checkpointed state: on a
/// brand new loom every page starts dirty and mapped read-write (nothing
/// has protected it down to read-only yet), so it can be written directly
/// without going through `fault` first — matching a host's first touch of
/// loom memory before any snapshot exists.
fn write_live_page(
    engine: &mut Engine<MovableRoad, PanicBail>,
    page: usize,
    data: &[u8],
) {
    let offset = page * PAGE_SIZE;
    // SAFETY: every page is read-write until the first `save`/`load`
    // blit protects it back down to read-only.
    unsafe {
        let dst = engine.as_mut_ptr().add(offset);
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }
}

/// A page of pseudo-random bytes, reproducible across test runs from a
/// fixed seed rather than `rand::random`'s nondeterministic source.
fn random_page(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; PAGE_SIZE];
    rng.fill(&mut buf[..]);
    buf
}

#[test]
fn save_then_reload_reproduces_identical_pages() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let watermarks = Watermarks {
        north_words: (2 * PAGE_SIZE) / 4,
        south_words: (2 * PAGE_SIZE) / 4,
    };

    let north_page = random_page(1);
    let south_page = random_page(2);

    {
        let mut engine = engine_at(root, watermarks);
        engine.live().unwrap();
        place_guard(&mut engine);

        write_live_page(&mut engine, 0, &north_page);
        write_live_page(&mut engine, PAGE_COUNT - 1, &south_page);

        engine.save().unwrap();
    }

    let mut engine = engine_at(root, watermarks);
    engine.live().unwrap();

    let bytes = engine.as_bytes();
    let reloaded_north = &bytes[..PAGE_SIZE];
    let reloaded_south = &bytes[(PAGE_COUNT - 1) * PAGE_SIZE..][..PAGE_SIZE];

    // Cross-check with an independent hash rather than the engine's own
    // `mug`, so a bug shared between the write path and the checksum
    // wouldn't go unnoticed.
    assert_eq!(
        blake3::hash(reloaded_north).to_hex().as_str(),
        blake3::hash(&north_page).to_hex().as_str(),
        "north page mismatch after reload"
    );
    assert_eq!(
        blake3::hash(reloaded_south).to_hex().as_str(),
        blake3::hash(&south_page).to_hex().as_str(),
        "south page mismatch after reload"
    );
}

#[test]
fn save_with_free_middle_region_round_trips_through_restart() {
    // Only the first and last pages are "live"; pages in between are free
    // middle space the guard page moves around in. north_pages (1) +
    // south_pages (1) is well short of the loom's total page count (8),
    // which is exactly the shape that must not confuse the south image's
    // block-offset arithmetic.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let watermarks = Watermarks {
        north_words: PAGE_SIZE / 4,
        south_words: PAGE_SIZE / 4,
    };

    let fingerprint: [u8; 32];
    let page_data = random_page(7);

    {
        let mut engine = engine_at(root, watermarks);
        engine.live().unwrap();
        place_guard(&mut engine);
        write_live_page(&mut engine, PAGE_COUNT - 1, &page_data);
        engine.save().unwrap();
        fingerprint = *blake3::hash(&page_data).as_bytes();
    }

    let mut engine = engine_at(root, watermarks);
    engine.live().unwrap();
    let bytes = engine.as_bytes();
    let reloaded = &bytes[(PAGE_COUNT - 1) * PAGE_SIZE..][..PAGE_SIZE];

    assert_eq!(
        *blake3::hash(reloaded).as_bytes(),
        fingerprint,
        "south page content diverged across a free-middle-region save/restart; \
         expected hash {}, got {}",
        hex::encode(fingerprint),
        hex::encode(blake3::hash(reloaded).as_bytes()),
    );
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Incremental, crash-safe, page-granularity persistence for a large
//! contiguous in-process heap/stack arena.
//!
//! The core functionality is offered by the [`Engine`] struct, which owns
//! a single anonymous mapping (the "loom"), tracks which of its pages
//! have been written to since the last snapshot, and folds just those
//! pages into a pair of on-disk segment files — `north.bin` and
//! `south.bin` — through a write-ahead patch that makes each save
//! atomic with respect to a crash.
//!
//! A loom is shaped like two stacks growing toward each other: a "north"
//! region growing up from the low end and a "south" region growing down
//! from the high end, with a moving guard page kept between their
//! frontiers so that a collision faults instead of silently corrupting
//! memory. The host supplies the current frontiers through the [`Road`]
//! trait, and is notified through [`Bail`] when there's no room left to
//! keep them apart.
//!
//! # Example
//! ```no_run
//! use loom_snapshot::{Bail, BailReason, Config, Engine, Road, Watermarks};
//!
//! struct FixedRoad;
//! impl Road for FixedRoad {
//!     fn watermarks(&self) -> Watermarks {
//!         Watermarks { north_words: 1024, south_words: 1024 }
//!     }
//! }
//!
//! struct PanicBail;
//! impl Bail for PanicBail {
//!     fn bail(&self, reason: BailReason) {
//!         panic!("loom out of memory: {reason:?}");
//!     }
//! }
//!
//! let config = Config::new("/tmp/my-loom", 0x4000, 4096)?;
//! let mut engine = Engine::new(config, FixedRoad, PanicBail)?;
//! engine.live()?;
//! // ... forward SIGSEGV/SIGBUS faults to engine.fault(addr, is_write) ...
//! engine.save()?;
//! # Ok::<(), loom_snapshot::Error>(())
//! ```
//!
//! # Limitations
//! This crate currently only builds for 64-bit Unix targets, since it
//! relies on `mmap`/`mprotect` semantics not available elsewhere.
#![cfg(all(unix, target_pointer_width = "64"))]
#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod bitmap;
mod checksum;
mod config;
mod engine;
mod error;
mod image;
mod loom;
mod patch;
mod recovery;

pub use checksum::mug;
pub use config::{
    BailReason, Bail, Config, Road, Watermarks, DEFAULT_PAGE_SIZE, WORD_SIZE,
};
pub use engine::Engine;
pub use error::{Error, Result};

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;

use thiserror::Error;

/// The error type returned by the loom snapshot engine.
///
/// Per the design's error-handling model, `save`'s internal I/O failures
/// and `mprotect` failures are still surfaced as `Err` rather than a
/// `panic!` — but the engine's contract is that callers must treat any
/// `Err` out of [`Engine::save`](crate::Engine::save) as fatal (the source
/// of truth asserts immediately; a library should propagate and let the
/// caller decide how to die).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Wraps an underlying I/O failure (open, read, write, seek, fsync).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// `mprotect` failed.
    #[error("mprotect failed: {0}")]
    Protect(Arc<std::io::Error>),

    /// `mmap` failed.
    #[error("mmap failed: {0}")]
    Mmap(Arc<std::io::Error>),

    /// An image file's size is not a multiple of the page size.
    #[error("image {name} has corrupt size {size} bytes (not a multiple of the {page_size}-byte page)")]
    CorruptImageSize {
        /// Which image (`"north"` or `"south"`).
        name: &'static str,
        /// The file's actual size in bytes.
        size: u64,
        /// The configured page size.
        page_size: usize,
    },

    /// The configured page size is incompatible with the host.
    #[error("page size {0} is not a power of two multiple of the host page size")]
    IncompatiblePageSize(usize),

    /// A patch's control file disagrees with its memory file, or its
    /// header is internally inconsistent.
    #[error("patch control file is inconsistent with its declared dirty_count")]
    PatchControlInconsistent,

    /// A patch's version byte does not match the version this engine
    /// writes.
    #[error("patch version mismatch: have {have}, need {need}")]
    PatchVersionMismatch {
        /// Version found on disk.
        have: u8,
        /// Version this engine expects.
        need: u8,
    },

    /// A patch entry's checksum does not match its recorded content.
    #[error("patch checksum mismatch at control entry {0}")]
    PatchChecksumMismatch(usize),

    /// A freshly-applied image page's checksum did not match the
    /// in-memory loom page during a validation pass (see
    /// [`Config::validate`](crate::Config::validate)).
    #[error("validation mismatch: {image} page {page}, loom mug {loom_mug:#x} != image mug {image_mug:#x}")]
    ValidationMismatch {
        /// Which image (`"north"` or `"south"`).
        image: &'static str,
        /// Loom page index.
        page: usize,
        /// Checksum computed over the loom page.
        loom_mug: u32,
        /// Checksum computed over the on-disk page.
        image_mug: u32,
    },

    /// No room remains to place a guard page between the north and south
    /// frontiers.
    #[error("out of memory: no room to place the guard page")]
    OutOfMemory,

    /// An address passed to [`Engine::fault`](crate::Engine::fault) does
    /// not lie within the loom.
    #[error("address {0:#x} is outside the loom")]
    AddressOutsideLoom(usize),

    /// A write fault landed on a page already marked dirty. Per the
    /// design, this indicates either a logic error in the host's fault
    /// dispatch or concurrent access from more than one thread, both of
    /// which this engine assumes cannot happen.
    #[error("strange page: fault on already-dirty page {0}")]
    StrangePage(usize),

    /// An operation that requires `Engine::live` to have run first (e.g.
    /// `save`, `load`, `copy`) was called before it.
    #[error("engine is not live: call Engine::live before using this operation")]
    NotLive,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// Convenience alias for this crate's `Result`.
pub type Result<T> = std::result::Result<T, Error>;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Size in bytes of a single loom word. The data model is defined in terms
/// of 32-bit words throughout.
pub const WORD_SIZE: usize = 4;

/// Default loom page size in bytes (16 KiB), matching the size used by the
/// runtime this engine was distilled from.
pub const DEFAULT_PAGE_SIZE: usize = 0x4000;

/// Configuration for an [`Engine`](crate::Engine).
///
/// A `Config` is built once, validated at construction time, and then
/// threaded through the engine for its whole lifetime rather than read from
/// globals or compile-time features.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of a loom page in bytes. Must be a power of two and a multiple
    /// of the host's page size.
    pub page_size: usize,
    /// Total number of pages in the loom (`P` in the data model).
    pub page_count: usize,
    /// Root directory under which `.urb/chk` and `.urb/bhk` live.
    pub root: PathBuf,
    /// When set, [`Engine::save`](crate::Engine::save) is a documented
    /// no-op: it still logs that it was skipped, rather than silently
    /// succeeding with no persistence.
    pub dry_run: bool,
    /// When set, every `save` cross-checks each written image page's
    /// checksum against the corresponding loom page after applying the
    /// patch. This is the runtime equivalent of the original's
    /// compile-time snapshot-validation build flag.
    pub validate: bool,
}

impl Config {
    /// Build a new configuration, rooted at `root`, with the given page
    /// geometry.
    ///
    /// # Errors
    /// Returns [`Error::IncompatiblePageSize`] if `page_size` is not a power
    /// of two, or is not a multiple of the host's page size (the engine
    /// does not support host page sizes larger than the loom page size).
    pub fn new(
        root: impl Into<PathBuf>,
        page_size: usize,
        page_count: usize,
    ) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::IncompatiblePageSize(page_size));
        }

        // SAFETY: `sysconf` with `_SC_PAGESIZE` never fails and takes no
        // pointers.
        let host_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if host_page_size <= 0 || page_size % host_page_size as usize != 0 {
            return Err(Error::IncompatiblePageSize(page_size));
        }

        Ok(Self {
            page_size,
            page_count,
            root: root.into(),
            dry_run: false,
            validate: false,
        })
    }

    /// Enable or disable dry-run mode. See [`Config::dry_run`] field docs.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enable or disable the runtime validation cross-check.
    #[must_use]
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Total loom size in 32-bit words (`W` in the data model).
    pub(crate) fn word_count(&self) -> usize {
        self.page_count * self.page_size / WORD_SIZE
    }

    /// Number of words per page.
    pub(crate) fn page_words(&self) -> usize {
        self.page_size / WORD_SIZE
    }

    /// Directory holding the current snapshot segments and any pending
    /// patch: `<root>/.urb/chk`.
    pub(crate) fn checkpoint_dir(&self) -> PathBuf {
        self.root.join(".urb").join("chk")
    }

    /// Directory holding the post-save backup copy: `<root>/.urb/bhk`.
    pub(crate) fn backup_dir(&self) -> PathBuf {
        self.root.join(".urb").join("bhk")
    }
}

/// Watermarks reported by the host's active road: the number of used words
/// at the north frontier and at the south frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Used words at the north (low-address) frontier.
    pub north_words: usize,
    /// Used words at the south (high-address) frontier.
    pub south_words: usize,
}

/// External collaborator supplying the engine with the current extent of
/// live loom space.
///
/// The engine never computes these values itself: it asks the host's
/// active road for them once per [`Engine::save`](crate::Engine::save) and
/// once per guard-page placement. North/south here already mean "low
/// address" / "high address" (per the data model), so `Watermarks` fully
/// determines the free region between the two frontiers regardless of
/// which arena is presently active; the engine has no separate notion of
/// orientation to track.
pub trait Road {
    /// Return the current watermarks.
    fn watermarks(&self) -> Watermarks;
}

/// Reason the engine is asking its host to bail out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailReason {
    /// No room remains to place a guard page between the north and south
    /// frontiers.
    OutOfMemory,
}

/// External collaborator invoked when the engine cannot continue on its
/// own (currently: guard-page exhaustion). The host is expected to take
/// its own crash path; the engine does not call `process::exit` itself.
pub trait Bail {
    /// Handle a bail request.
    fn bail(&self, reason: BailReason);
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The loom mapping itself, and the guard page that detects heap/stack
//! collision.

use std::{io, ptr, slice};

use libc::{
    c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE,
};

use crate::config::WORD_SIZE;
use crate::error::{Error, Result};

/// Memory protection a page can be placed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    /// Inaccessible; any access faults. Used only for the guard page.
    None,
    /// Read-only; writes fault. The "clean" state.
    ReadOnly,
    /// Read-write. The "dirty" state.
    ReadWrite,
}

impl Protection {
    fn as_prot(self) -> libc::c_int {
        match self {
            Protection::None => PROT_NONE,
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// The single large anonymous mapping backing the loom, together with the
/// bookkeeping needed to place and relocate the guard page.
///
/// `Loom` owns its mapping exclusively: the fault entry point
/// ([`Engine::fault`](crate::Engine::fault)) only ever monotonically adds
/// dirty bits and relaxes protection on pages it's told about; there is no
/// locking here because the engine's contract is single-threaded use.
#[derive(Debug)]
pub(crate) struct Loom {
    base: *mut u8,
    len: usize,
    page_size: usize,
    page_count: usize,
    /// Page index of the guard page, if one has been placed yet.
    guard_page: Option<usize>,
    /// Per-page protection, tracked here (rather than re-derived from the
    /// OS) so invariants can be asserted cheaply in tests.
    protection: Vec<Protection>,
}

impl Loom {
    /// Map a fresh, all-read-write loom of `page_count` pages of
    /// `page_size` bytes each.
    ///
    /// All pages start read-write (and, correspondingly, the dirty bitmap
    /// the engine pairs with this loom starts all-dirty) — this mirrors
    /// startup's conservative "mark everything dirty" default; `live`
    /// tightens pages back to read-only as it blits snapshot contents in.
    pub(crate) fn new(page_size: usize, page_count: usize) -> Result<Self> {
        let len = page_size
            .checked_mul(page_count)
            .expect("loom size overflow");

        // SAFETY: a fixed-size anonymous, private mapping with no file
        // backing; `len` is non-zero whenever `page_count` is non-zero.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len.max(1),
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };

        if base == MAP_FAILED {
            return Err(Error::Mmap(std::sync::Arc::new(
                io::Error::last_os_error(),
            )));
        }

        Ok(Self {
            base: base.cast(),
            len,
            page_size,
            page_count,
            guard_page: None,
            protection: vec![Protection::ReadWrite; page_count],
        })
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base as usize
    }

    pub(crate) fn guard_page(&self) -> Option<usize> {
        self.guard_page
    }

    /// Whole-loom byte view.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: `base`/`len` describe the live mapping for the lifetime
        // of `self`.
        unsafe { slice::from_raw_parts(self.base, self.len) }
    }

    /// Bytes of a single page.
    pub(crate) fn page_bytes(&self, page: usize) -> &[u8] {
        let offset = page * self.page_size;
        &self.as_bytes()[offset..offset + self.page_size]
    }

    /// Copy `data` into page `page`. Requires the page to currently be
    /// mapped read-write (callers only ever write into pages the fault
    /// handler has already relaxed, or during a blit where protection is
    /// applied afterward).
    pub(crate) fn write_page(&mut self, page: usize, data: &[u8]) {
        debug_assert_eq!(data.len(), self.page_size);
        let offset = page * self.page_size;
        // SAFETY: within bounds of the mapping; exclusive access via
        // `&mut self`.
        unsafe {
            let dst = self.base.add(offset);
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /// Does `addr` lie within the loom's mapped range?
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.base_addr() + self.len
    }

    /// Page index containing `addr`. Caller must have checked
    /// [`Loom::contains`] first.
    pub(crate) fn page_of(&self, addr: usize) -> usize {
        (addr - self.base_addr()) / self.page_size
    }

    /// Change the protection of a single page and record it.
    pub(crate) fn protect(
        &mut self,
        page: usize,
        protection: Protection,
    ) -> Result<()> {
        let offset = page * self.page_size;
        // SAFETY: `offset..offset+page_size` lies within the mapping.
        let rc = unsafe {
            libc::mprotect(
                self.base.add(offset).cast::<c_void>(),
                self.page_size,
                protection.as_prot(),
            )
        };
        if rc != 0 {
            return Err(Error::Protect(std::sync::Arc::new(
                io::Error::last_os_error(),
            )));
        }
        self.protection[page] = protection;
        Ok(())
    }

    /// Relax the whole loom to read-write in one call. This is `yolo`.
    pub(crate) fn protect_all_read_write(&mut self) -> Result<()> {
        // SAFETY: `len` is exactly the mapped region's size.
        let rc = unsafe {
            libc::mprotect(
                self.base.cast::<c_void>(),
                self.len,
                PROT_READ | PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(Error::Protect(std::sync::Arc::new(
                io::Error::last_os_error(),
            )));
        }
        for p in &mut self.protection {
            *p = Protection::ReadWrite;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn protection_of(&self, page: usize) -> Protection {
        self.protection[page]
    }

    /// Place or relocate the guard page at the midpoint of the free region
    /// between `bottom_words` and `top_words` (both absolute word offsets
    /// from the loom base). Returns an error if there isn't room, or if
    /// the computed location is the same as the previous one (matches the
    /// original's "should be impossible to place twice in a row" check).
    pub(crate) fn center_guard_page(
        &mut self,
        bottom_words: usize,
        top_words: usize,
    ) -> Result<()> {
        let page_words = self.page_size / WORD_SIZE;

        let bottom = round_up(bottom_words, page_words);
        let top = round_down(top_words, page_words);

        if top < bottom + page_words {
            return Err(Error::OutOfMemory);
        }

        let new_base_words =
            bottom + round_down((top - bottom) / 2, page_words);
        let new_page = new_base_words / page_words;

        if self.guard_page == Some(new_page) {
            return Err(Error::OutOfMemory);
        }

        self.protect(new_page, Protection::None)?;
        self.guard_page = Some(new_page);
        Ok(())
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

fn round_down(value: usize, multiple: usize) -> usize {
    (value / multiple) * multiple
}

impl Drop for Loom {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe the mapping we created in `new`.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

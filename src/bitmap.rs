// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The dirty bitmap: one bit per loom page, mutated by the fault handler
//! and consumed by the patch composer.

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-length bit array, one bit per loom page.
///
/// Bit `i` set means page `i` has been written since the last snapshot and
/// is currently mapped read-write. The bitmap is not internally
/// synchronized: the engine's single-threaded discipline is what makes
/// unsynchronized updates from the fault handler safe (see the crate's
/// concurrency notes).
#[derive(Debug)]
pub(crate) struct DirtyBitmap {
    words: Vec<u64>,
    page_count: usize,
}

impl DirtyBitmap {
    /// Create a bitmap for `page_count` pages, with every bit clear.
    pub(crate) fn new(page_count: usize) -> Self {
        let word_count = page_count.div_ceil(BITS_PER_WORD);
        Self {
            words: vec![0; word_count],
            page_count,
        }
    }

    /// Number of pages this bitmap tracks.
    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }

    fn locate(&self, page: usize) -> (usize, u64) {
        debug_assert!(page < self.page_count, "page {page} out of range");
        (page / BITS_PER_WORD, 1u64 << (page % BITS_PER_WORD))
    }

    /// Is `page` currently dirty?
    pub(crate) fn is_dirty(&self, page: usize) -> bool {
        let (word, mask) = self.locate(page);
        self.words[word] & mask != 0
    }

    /// Mark `page` dirty.
    pub(crate) fn set_dirty(&mut self, page: usize) {
        let (word, mask) = self.locate(page);
        self.words[word] |= mask;
    }

    /// Mark `page` clean.
    pub(crate) fn clear(&mut self, page: usize) {
        let (word, mask) = self.locate(page);
        self.words[word] &= !mask;
    }

    /// Mark every page dirty. This is `foul`.
    pub(crate) fn set_all(&mut self) {
        for word in &mut self.words {
            *word = u64::MAX;
        }
        self.mask_tail();
    }

    /// Mark every page clean.
    pub(crate) fn clear_all(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
    }

    /// Zero out any bits past `page_count` in the final word, so
    /// `set_all` doesn't leave spurious bits set beyond the tracked range.
    fn mask_tail(&mut self) {
        let valid_bits = self.page_count % BITS_PER_WORD;
        if valid_bits != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << valid_bits) - 1;
            }
        }
    }

    /// Count of currently dirty pages within `range` (used to size a
    /// patch before composing it).
    pub(crate) fn count_dirty(
        &self,
        range: impl Iterator<Item = usize>,
    ) -> usize {
        range.filter(|&p| self.is_dirty(p)).count()
    }
}

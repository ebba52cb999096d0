// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! On-disk image segments: `north.bin` and `south.bin`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bitmap::DirtyBitmap;
use crate::error::{Error, Result};
use crate::loom::{Loom, Protection};

/// Which half of the loom an image mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment {
    /// Block `k` holds loom page `k`, in order.
    North,
    /// Block `k` holds loom page `total_pages - 1 - k`, reversed, so that
    /// shrinking the south segment truncates the file tail.
    South,
}

impl Segment {
    fn name(self) -> &'static str {
        match self {
            Segment::North => "north",
            Segment::South => "south",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Segment::North => "north.bin",
            Segment::South => "south.bin",
        }
    }

    /// Map a block index within this segment to the loom page it mirrors.
    fn loom_page(self, total_pages: usize, block: usize) -> usize {
        match self {
            Segment::North => block,
            Segment::South => total_pages - 1 - block,
        }
    }
}

/// One on-disk segment file: `n` consecutive page-sized blocks.
#[derive(Debug)]
pub(crate) struct Image {
    segment: Segment,
    file: File,
    page_size: usize,
    /// `n`: number of page-sized blocks currently in the file.
    page_count: usize,
}

impl Image {
    /// Open the segment file inside `dir`, creating it if absent. The
    /// file's size must already be a multiple of `page_size`.
    pub(crate) fn open_or_create(
        dir: &Path,
        segment: Segment,
        page_size: usize,
    ) -> Result<Self> {
        let path = dir.join(segment.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let size = file.metadata()?.len();
        if size % page_size as u64 != 0 {
            return Err(Error::CorruptImageSize {
                name: segment.name(),
                size,
                page_size,
            });
        }

        Ok(Self {
            segment,
            file,
            page_size,
            #[allow(clippy::cast_possible_truncation)]
            page_count: (size / page_size as u64) as usize,
        })
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }

    /// Resize the segment to `new_page_count` blocks. Only shrinks the
    /// file (via truncation); growth happens implicitly the next time a
    /// block past the current end is written.
    pub(crate) fn resize(&mut self, new_page_count: usize) -> Result<()> {
        if new_page_count < self.page_count {
            #[allow(clippy::cast_possible_truncation)]
            let new_len = (new_page_count * self.page_size) as u64;
            self.file.set_len(new_len)?;
        }
        self.page_count = new_page_count;
        Ok(())
    }

    fn seek_to_block(&mut self, block: usize) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (block * self.page_size) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read block `block` into a freshly allocated buffer.
    pub(crate) fn read_block(&mut self, block: usize) -> Result<Vec<u8>> {
        self.seek_to_block(block)?;
        let mut buf = vec![0u8; self.page_size];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` (exactly one page) to block `block`.
    pub(crate) fn write_block(
        &mut self,
        block: usize,
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        self.seek_to_block(block)?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Apply this image's contents onto the loom. If `protect` is set,
    /// each blitted page is reinstated read-only and cleared in `bitmap`
    /// as it's written (the `live` path); otherwise the loom is left as
    /// it is and the caller is expected to `foul` the bitmap itself (the
    /// `load` path).
    pub(crate) fn blit_onto(
        &mut self,
        loom: &mut Loom,
        bitmap: &mut DirtyBitmap,
        protect: bool,
    ) -> Result<()> {
        let total_pages = loom.page_count();
        for block in 0..self.page_count {
            let data = self.read_block(block)?;
            let page = self.segment.loom_page(total_pages, block);

            loom.protect(page, Protection::ReadWrite)?;
            loom.write_page(page, &data);

            if protect {
                loom.protect(page, Protection::ReadOnly)?;
                bitmap.clear(page);
            } else {
                bitmap.set_dirty(page);
            }
        }
        Ok(())
    }

    /// Copy this image's contents, block by block, into `dest`, resizing
    /// and fsyncing `dest` to match.
    pub(crate) fn copy_into(&mut self, dest: &mut Image) -> Result<()> {
        dest.resize(self.page_count)?;
        for block in 0..self.page_count {
            let data = self.read_block(block)?;
            dest.write_block(block, &data)?;
        }
        dest.sync()
    }

    /// Compare every currently-live page in `loom` against this image's
    /// on-disk contents, by checksum. Used by the optional validation
    /// pass. Returns the first mismatch found, if any.
    pub(crate) fn validate_against(
        &mut self,
        loom: &Loom,
    ) -> Result<Option<(usize, u32, u32)>> {
        let total_pages = loom.page_count();
        for block in 0..self.page_count {
            let page = self.segment.loom_page(total_pages, block);
            let on_disk = self.read_block(block)?;
            let image_mug = crate::checksum::mug(&on_disk);
            let loom_mug = crate::checksum::mug(loom.page_bytes(page));
            if image_mug != loom_mug {
                return Ok(Some((page, loom_mug, image_mug)));
            }
        }
        Ok(None)
    }

    pub(crate) fn segment(&self) -> Segment {
        self.segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loom_page_mapping() {
        assert_eq!(Segment::North.loom_page(100, 0), 0);
        assert_eq!(Segment::North.loom_page(100, 5), 5);
        assert_eq!(Segment::South.loom_page(100, 0), 99);
        assert_eq!(Segment::South.loom_page(100, 5), 94);
    }

    #[test]
    fn open_create_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut image =
            Image::open_or_create(dir.path(), Segment::North, 0x1000)
                .unwrap();
        assert_eq!(image.page_count(), 0);

        image.resize(2).unwrap();
        let page0 = vec![1u8; 0x1000];
        let page1 = vec![2u8; 0x1000];
        image.write_block(0, &page0).unwrap();
        image.write_block(1, &page1).unwrap();

        assert_eq!(image.read_block(0).unwrap(), page0);
        assert_eq!(image.read_block(1).unwrap(), page1);
    }

    #[test]
    fn corrupt_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("north.bin");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let err =
            Image::open_or_create(dir.path(), Segment::North, 0x1000)
                .unwrap_err();
        assert!(matches!(err, Error::CorruptImageSize { .. }));
    }

    #[test]
    fn shrinking_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut image =
            Image::open_or_create(dir.path(), Segment::South, 0x1000)
                .unwrap();
        image.resize(4).unwrap();
        for block in 0..4 {
            image.write_block(block, &vec![block as u8; 0x1000]).unwrap();
        }
        image.resize(2).unwrap();
        assert_eq!(image.file.metadata().unwrap().len(), 2 * 0x1000);
    }
}

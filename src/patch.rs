// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The write-ahead patch: `control.bin` + `memory.bin`, making a save
//! crash-atomic.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bitmap::DirtyBitmap;
use crate::checksum::mug;
use crate::error::{Error, Result};
use crate::image::{Image, Segment};
use crate::loom::{Loom, Protection};

/// The only version this engine writes or accepts. Bumping this is the
/// sole forward-compatibility knob for the patch format: any mismatch
/// causes the patch to be discarded outright.
pub(crate) const VERSION: u8 = 1;

const HEADER_LEN: usize = 1 /* version */ + 3 /* padding */ + 4 + 4 + 4;
const ENTRY_LEN: usize = 4 + 4;

/// Parsed `control.bin` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlHeader {
    pub(crate) version: u8,
    pub(crate) north_pages: u32,
    pub(crate) south_pages: u32,
    pub(crate) dirty_count: u32,
}

/// One `control.bin` entry: which loom page, and its checksum at write
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlEntry {
    pub(crate) page_index: u32,
    pub(crate) checksum: u32,
}

fn write_control(
    file: &mut File,
    header: &ControlHeader,
    entries: &[ControlEntry],
) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + entries.len() * ENTRY_LEN);
    buf.push(header.version);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&header.north_pages.to_le_bytes());
    buf.extend_from_slice(&header.south_pages.to_le_bytes());
    buf.extend_from_slice(&header.dirty_count.to_le_bytes());

    for entry in entries {
        buf.extend_from_slice(&entry.page_index.to_le_bytes());
        buf.extend_from_slice(&entry.checksum.to_le_bytes());
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_control(file: &mut File) -> Result<(ControlHeader, Vec<ControlEntry>)> {
    let size = file.metadata()?.len();
    if size < HEADER_LEN as u64 {
        return Err(Error::PatchControlInconsistent);
    }

    let mut buf = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    let version = buf[0];
    let north_pages = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let south_pages = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let dirty_count = u32::from_le_bytes(buf[12..16].try_into().unwrap());

    let expected_len =
        HEADER_LEN + dirty_count as usize * ENTRY_LEN;
    if buf.len() != expected_len {
        return Err(Error::PatchControlInconsistent);
    }

    let mut entries = Vec::with_capacity(dirty_count as usize);
    let mut offset = HEADER_LEN;
    for _ in 0..dirty_count {
        let page_index =
            u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        let checksum = u32::from_le_bytes(
            buf[offset + 4..offset + 8].try_into().unwrap(),
        );
        entries.push(ControlEntry {
            page_index,
            checksum,
        });
        offset += ENTRY_LEN;
    }

    Ok((
        ControlHeader {
            version,
            north_pages,
            south_pages,
            dirty_count,
        },
        entries,
    ))
}

/// An in-flight patch: the pair of open file handles plus the control data
/// describing it. Lives only for the duration of a `save` or a recovery
/// attempt; never stored on [`Engine`](crate::Engine) between calls.
#[derive(Debug)]
pub(crate) struct Patch {
    control_path: PathBuf,
    memory_path: PathBuf,
    control_file: File,
    memory_file: File,
    header: ControlHeader,
    entries: Vec<ControlEntry>,
    page_size: usize,
}

impl Patch {
    fn paths(checkpoint_dir: &Path) -> (PathBuf, PathBuf) {
        (
            checkpoint_dir.join("control.bin"),
            checkpoint_dir.join("memory.bin"),
        )
    }

    /// Compose a new patch from the dirty pages within the given
    /// watermarks. Returns `Ok(None)` if there is nothing dirty to save.
    ///
    /// On return, every in-memory page within the watermarks is read-only
    /// and bitmap-clean; the patch files are written but not yet fsynced.
    pub(crate) fn compose(
        checkpoint_dir: &Path,
        loom: &mut Loom,
        bitmap: &mut DirtyBitmap,
        north_pages: usize,
        south_pages: usize,
    ) -> Result<Option<Self>> {
        let total_pages = loom.page_count();
        let page_size = loom.page_size();

        let north_range = 0..north_pages;
        let south_range =
            (total_pages - south_pages)..total_pages;

        let dirty_count = bitmap.count_dirty(north_range.clone())
            + bitmap.count_dirty(south_range.clone());

        if dirty_count == 0 {
            return Ok(None);
        }

        std::fs::create_dir_all(checkpoint_dir)?;
        let (control_path, memory_path) = Self::paths(checkpoint_dir);

        let mut control_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&control_path)?;
        let mut memory_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&memory_path)?;

        let mut entries = Vec::with_capacity(dirty_count);
        let mut slot = 0usize;

        // North pages ascending, then south pages descending loom index
        // (ascending south-image offset).
        for page in north_range {
            slot = Self::save_page(
                loom, bitmap, &mut memory_file, page, slot, &mut entries,
                page_size,
            )?;
        }
        for page in south_range.rev() {
            slot = Self::save_page(
                loom, bitmap, &mut memory_file, page, slot, &mut entries,
                page_size,
            )?;
        }

        let header = ControlHeader {
            version: VERSION,
            #[allow(clippy::cast_possible_truncation)]
            north_pages: north_pages as u32,
            #[allow(clippy::cast_possible_truncation)]
            south_pages: south_pages as u32,
            #[allow(clippy::cast_possible_truncation)]
            dirty_count: entries.len() as u32,
        };
        write_control(&mut control_file, &header, &entries)?;

        Ok(Some(Self {
            control_path,
            memory_path,
            control_file,
            memory_file,
            header,
            entries,
            page_size,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn save_page(
        loom: &mut Loom,
        bitmap: &mut DirtyBitmap,
        memory_file: &mut File,
        page: usize,
        slot: usize,
        entries: &mut Vec<ControlEntry>,
        page_size: usize,
    ) -> Result<usize> {
        if !bitmap.is_dirty(page) {
            return Ok(slot);
        }

        let checksum = mug(loom.page_bytes(page));
        #[allow(clippy::cast_possible_truncation)]
        let offset = (slot * page_size) as u64;
        memory_file.seek(SeekFrom::Start(offset))?;
        memory_file.write_all(loom.page_bytes(page))?;

        entries.push(ControlEntry {
            #[allow(clippy::cast_possible_truncation)]
            page_index: page as u32,
            checksum,
        });

        loom.protect(page, Protection::ReadOnly)?;
        bitmap.clear(page);

        Ok(slot + 1)
    }

    /// Open an already-composed, on-disk patch without creating anything.
    /// Returns `Ok(None)` whenever there's nothing there to apply,
    /// deleting stray half-present files as it goes, and never returns an
    /// `Err` for a corrupt patch — corruption demotes to "no patch" (the
    /// patch is simply discarded) rather than failing recovery.
    pub(crate) fn open_pending(
        checkpoint_dir: &Path,
        page_size: usize,
    ) -> Result<Option<Self>> {
        let (control_path, memory_path) = Self::paths(checkpoint_dir);

        let control_file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&control_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let memory_file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&memory_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                drop(control_file);
                let _ = std::fs::remove_file(&control_path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut patch = Self {
            control_path,
            memory_path,
            control_file,
            memory_file,
            header: ControlHeader {
                version: 0,
                north_pages: 0,
                south_pages: 0,
                dirty_count: 0,
            },
            entries: Vec::new(),
            page_size,
        };

        let (header, entries) = match read_control(&mut patch.control_file) {
            Ok(parsed) => parsed,
            Err(_) => {
                patch.delete();
                return Ok(None);
            }
        };

        if header.version != VERSION {
            tracing::warn!(
                have = header.version,
                need = VERSION,
                "discarding pending patch: version mismatch"
            );
            patch.delete();
            return Ok(None);
        }

        let expected_memory_len =
            entries.len() as u64 * page_size as u64;
        let actual_memory_len = patch.memory_file.metadata()?.len();
        if expected_memory_len != actual_memory_len {
            tracing::warn!("discarding pending patch: memory file size mismatch");
            patch.delete();
            return Ok(None);
        }

        patch.header = header;
        patch.entries = entries;

        if patch.verify().is_err() {
            tracing::warn!("discarding pending patch: checksum mismatch");
            patch.delete();
            return Ok(None);
        }

        Ok(Some(patch))
    }

    /// fsync both patch files. Any failure here is, per the design,
    /// fatal: the caller should treat `Err` as unrecoverable.
    pub(crate) fn sync(&self) -> Result<()> {
        self.control_file.sync_all()?;
        self.memory_file.sync_all()?;
        Ok(())
    }

    /// Re-read every memory block and confirm its checksum matches its
    /// control entry.
    pub(crate) fn verify(&mut self) -> Result<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let offset = (i * self.page_size) as u64;
            self.memory_file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; self.page_size];
            self.memory_file.read_exact(&mut buf)?;

            if mug(&buf) != entry.checksum {
                return Err(Error::PatchChecksumMismatch(i));
            }
        }
        Ok(())
    }

    /// Idempotently fold this patch into the two image files: truncate
    /// them to the patch's watermarks, then rewrite every patched block
    /// by index. Safe to call twice with the same patch.
    ///
    /// `total_pages` is the loom's fixed total page count `P` (not the sum
    /// of this patch's `north_pages`/`south_pages`, which only cover the
    /// current watermarks and leave out whatever free space sits between
    /// them) — it's what turns a south entry's absolute loom page index
    /// back into a south-image block offset (`P - 1 - page_index`).
    pub(crate) fn apply(
        &mut self,
        north: &mut Image,
        south: &mut Image,
        total_pages: usize,
    ) -> Result<()> {
        north.resize(self.header.north_pages as usize)?;
        south.resize(self.header.south_pages as usize)?;

        for i in 0..self.entries.len() {
            #[allow(clippy::cast_possible_truncation)]
            let offset = (i * self.page_size) as u64;
            self.memory_file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; self.page_size];
            self.memory_file.read_exact(&mut buf)?;

            let page_index = self.entries[i].page_index as usize;
            if page_index < self.header.north_pages as usize {
                debug_assert_eq!(north.segment(), Segment::North);
                north.write_block(page_index, &buf)?;
            } else {
                debug_assert_eq!(south.segment(), Segment::South);
                let block = total_pages - 1 - page_index;
                south.write_block(block, &buf)?;
            }
        }

        Ok(())
    }

    pub(crate) fn north_pages(&self) -> usize {
        self.header.north_pages as usize
    }

    pub(crate) fn south_pages(&self) -> usize {
        self.header.south_pages as usize
    }

    /// Delete the patch files. Called on every exit path once a patch has
    /// either been fully applied, or has been judged not worth applying.
    pub(crate) fn delete(&self) {
        let _ = std::fs::remove_file(&self.control_path);
        let _ = std::fs::remove_file(&self.memory_path);
    }
}

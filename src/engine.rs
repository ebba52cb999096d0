// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The public lifecycle facade tying the loom, the dirty bitmap, the two
//! on-disk images, and a host's [`Road`]/[`Bail`] collaborators together.

use crate::bitmap::DirtyBitmap;
use crate::config::{BailReason, Bail, Config, Road};
use crate::error::{Error, Result};
use crate::image::{Image, Segment};
use crate::loom::{Loom, Protection};
use crate::patch::Patch;
use crate::recovery;

/// The loom snapshot engine.
///
/// `Engine` is deliberately `!Sync` (and `!Send`): [`Loom`] holds a raw
/// pointer to its mapping, which the compiler already refuses to share
/// across threads without an explicit `unsafe impl`. This isn't worked
/// around anywhere in this crate — the whole design assumes a single
/// thread drives `fault`, `save`, and every other call in strict
/// sequence, the same way the runtime this engine was distilled from
/// assumed a single event loop.
pub struct Engine<R, B> {
    config: Config,
    loom: Loom,
    bitmap: DirtyBitmap,
    north: Image,
    south: Image,
    road: R,
    bail: B,
    live: bool,
}

impl<R: Road, B: Bail> Engine<R, B> {
    /// Map a fresh loom and open (or create) its backing images. The
    /// engine is not yet [`live`](Engine::live): no image content has
    /// been blitted in, and every page starts dirty.
    ///
    /// # Errors
    /// Returns an error if the loom mapping or either image file can't
    /// be created.
    pub fn new(config: Config, road: R, bail: B) -> Result<Self> {
        let loom = Loom::new(config.page_size, config.page_count)?;
        let bitmap_len = config.page_count;

        let checkpoint_dir = config.checkpoint_dir();
        std::fs::create_dir_all(&checkpoint_dir)?;

        let north =
            Image::open_or_create(&checkpoint_dir, Segment::North, config.page_size)?;
        let south =
            Image::open_or_create(&checkpoint_dir, Segment::South, config.page_size)?;

        // Every page starts life read-write (that's what `mmap` handed
        // back) and is therefore marked dirty up front; `live`'s blit
        // clears back to read-only+clean exactly the pages covered by an
        // on-disk image. Anything the images don't cover — a brand new
        // loom with no checkpoint yet, or loom space beyond either image's
        // current extent — stays dirty, so the first `save` persists all
        // of it rather than silently treating untouched-but-writable
        // memory as already safe.
        let mut bitmap = DirtyBitmap::new(bitmap_len);
        bitmap.set_all();

        Ok(Self {
            config,
            loom,
            bitmap,
            north,
            south,
            road,
            bail,
            live: false,
        })
    }

    /// Is the engine live (has [`Engine::live`] run and succeeded)?
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Base address of the loom mapping.
    ///
    /// Boxing, allocation, and everything else that decides *what* lives
    /// where in the loom is a collaborator's job, not this engine's; this
    /// and [`Engine::as_mut_ptr`] are the seam the host uses to actually
    /// read and write loom memory.
    pub fn base_addr(&self) -> usize {
        self.loom.base_addr()
    }

    /// Total size of the loom mapping in bytes.
    pub fn len(&self) -> usize {
        self.config.page_count * self.config.page_size
    }

    /// Is the loom zero-sized? Only possible with a degenerate `Config`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of a single loom page in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Number of pages in the loom.
    pub fn page_count(&self) -> usize {
        self.config.page_count
    }

    /// Read-only view of the whole loom mapping.
    ///
    /// Reading is always well-defined regardless of a page's current
    /// protection, with one exception the type system can't prevent:
    /// the guard page is mapped `PROT_NONE`, and reading it faults just
    /// like writing it does.
    pub fn as_bytes(&self) -> &[u8] {
        self.loom.as_bytes()
    }

    /// Mutable raw pointer to the base of the loom mapping.
    ///
    /// # Safety
    /// The caller must only write through this pointer into a page that
    /// is currently mapped read-write — in practice, a page [`Engine::fault`]
    /// has already been told about. Writing into a still-read-only page
    /// is undefined behavior from Rust's point of view even though the
    /// hardware will merely deliver `SIGSEGV`: the whole point of the
    /// fault callback is to let the host turn that signal back into a
    /// call to `fault` before retrying the write.
    pub unsafe fn as_mut_ptr(&mut self) -> *mut u8 {
        self.loom.base_addr() as *mut u8
    }

    /// Bring the engine up: apply any patch left behind by an
    /// interrupted save, then blit both images' contents into the loom,
    /// leaving every blitted page read-only and clean.
    ///
    /// Idempotent: calling this again after it has already succeeded is
    /// a no-op.
    ///
    /// # Errors
    /// Returns an error if the on-disk images or a pending patch can't
    /// be read, or if applying recovered pages fails.
    #[tracing::instrument(skip_all)]
    pub fn live(&mut self) -> Result<()> {
        if self.live {
            return Ok(());
        }

        let checkpoint_dir = self.config.checkpoint_dir();
        let recovered = recovery::recover(
            &checkpoint_dir,
            &mut self.north,
            &mut self.south,
            self.config.page_size,
            self.config.page_count,
        )?;
        if recovered {
            tracing::info!("recovered from a pending patch at startup");
        }

        self.north.blit_onto(&mut self.loom, &mut self.bitmap, true)?;
        self.south.blit_onto(&mut self.loom, &mut self.bitmap, true)?;

        self.live = true;
        Ok(())
    }

    /// Handle a fault at `addr`, presumably forwarded here from a host's
    /// `SIGSEGV`/`SIGBUS` handler. `is_write` distinguishes a write fault
    /// from a read fault (the latter only ever happens on the guard
    /// page, or on whatever the host maps below/above the loom, e.g. a
    /// guard for stack overflow).
    ///
    /// Returns `Ok(true)` when the engine handled the fault and the host
    /// should simply retry the faulting instruction, or `Ok(false)` when
    /// it's a read fault the engine declines to handle — the host should
    /// treat that case as its own problem (for instance, stack
    /// overflow).
    ///
    /// If the guard page has never been placed yet, this places it
    /// unconditionally on the very first call, before anything else is
    /// checked — matching the lazy-initialization contract: the host is
    /// expected to retry the original access, which will fault again and
    /// be handled by the ordinary paths below.
    ///
    /// A fault that lands on the guard page re-centers it and returns
    /// handled; if there's no longer room to place one, the host's
    /// [`Bail`] is invoked and an error returned instead. A fault on a
    /// page already marked dirty indicates either a fault-dispatch bug
    /// in the host or concurrent use from more than one thread — both
    /// preconditions this engine assumes don't happen — and is reported
    /// as [`Error::StrangePage`] rather than silently tolerated.
    ///
    /// # Errors
    /// Returns [`Error::NotLive`] before [`Engine::live`] has run,
    /// [`Error::AddressOutsideLoom`] for a write fault at an address
    /// outside the mapping, [`Error::OutOfMemory`] when the guard can no
    /// longer be placed, and [`Error::StrangePage`] on a fault for an
    /// already-dirty page.
    pub fn fault(&mut self, addr: usize, is_write: bool) -> Result<bool> {
        if !self.live {
            return Err(Error::NotLive);
        }

        if self.loom.guard_page().is_none() {
            self.center_guard_page()?;
            return Ok(true);
        }

        if !is_write {
            return Ok(false);
        }

        if !self.loom.contains(addr) {
            return Err(Error::AddressOutsideLoom(addr));
        }

        let page = self.loom.page_of(addr);

        if self.loom.guard_page() == Some(page) {
            self.center_guard_page()?;
            return Ok(true);
        }

        if self.bitmap.is_dirty(page) {
            return Err(Error::StrangePage(page));
        }

        self.loom.protect(page, Protection::ReadWrite)?;
        self.bitmap.set_dirty(page);
        Ok(true)
    }

    /// Recenter the guard page between the host's reported watermarks.
    ///
    /// Invokes the host's [`Bail`] (and returns [`Error::OutOfMemory`])
    /// when there is no longer room to place one between the two
    /// frontiers.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] when no room remains between the
    /// frontiers, or a `mprotect` failure from the underlying
    /// [`Loom`].
    pub fn center_guard_page(&mut self) -> Result<()> {
        let marks = self.road.watermarks();
        let top_words = self.config.word_count() - marks.south_words;
        match self.loom.center_guard_page(marks.north_words, top_words) {
            Ok(()) => Ok(()),
            Err(Error::OutOfMemory) => {
                self.bail.bail(BailReason::OutOfMemory);
                Err(Error::OutOfMemory)
            }
            Err(e) => Err(e),
        }
    }

    fn watermark_pages(&self) -> (usize, usize) {
        let marks = self.road.watermarks();
        let page_words = self.config.page_words();
        (
            marks.north_words.div_ceil(page_words),
            marks.south_words.div_ceil(page_words),
        )
    }

    /// Save every dirty page within the host's current watermarks.
    ///
    /// A no-op (but still logged) when [`Config::dry_run`] is set. A
    /// no-op when nothing is dirty. Otherwise: compose a patch, fsync
    /// it, fold it into the two images, fsync those, and only then
    /// delete the patch — so a crash at any point before the final
    /// delete leaves a patch that [`Engine::live`] will pick back up on
    /// the next boot.
    ///
    /// # Errors
    /// Returns [`Error::NotLive`] before [`Engine::live`] has run, and
    /// otherwise any I/O, checksum, or [`Error::ValidationMismatch`]
    /// failure encountered while composing or applying the patch.
    #[tracing::instrument(skip_all)]
    pub fn save(&mut self) -> Result<()> {
        if !self.live {
            return Err(Error::NotLive);
        }
        if self.config.dry_run {
            tracing::debug!("dry_run set, skipping save");
            return Ok(());
        }

        let (north_pages, south_pages) = self.watermark_pages();

        let Some(mut patch) = Patch::compose(
            &self.config.checkpoint_dir(),
            &mut self.loom,
            &mut self.bitmap,
            north_pages,
            south_pages,
        )?
        else {
            tracing::debug!("nothing dirty, skipping save");
            return Ok(());
        };

        patch.sync()?;

        patch.apply(&mut self.north, &mut self.south, self.config.page_count)?;
        self.north.sync()?;
        self.south.sync()?;

        if self.config.validate {
            self.validate_images()?;
        }

        patch.delete();
        Ok(())
    }

    fn validate_images(&mut self) -> Result<()> {
        if let Some((page, loom_mug, image_mug)) =
            self.north.validate_against(&self.loom)?
        {
            return Err(Error::ValidationMismatch {
                image: "north",
                page,
                loom_mug,
                image_mug,
            });
        }
        if let Some((page, loom_mug, image_mug)) =
            self.south.validate_against(&self.loom)?
        {
            return Err(Error::ValidationMismatch {
                image: "south",
                page,
                loom_mug,
                image_mug,
            });
        }
        Ok(())
    }

    /// Reload the loom from the on-disk images, discarding any unsaved
    /// in-memory writes. Leaves every reloaded page read-only and clean,
    /// the same as [`Engine::live`]'s initial blit.
    ///
    /// # Errors
    /// Returns [`Error::NotLive`] before [`Engine::live`] has run, and
    /// otherwise any I/O or `mprotect` failure from the underlying
    /// images or loom.
    #[tracing::instrument(skip_all)]
    pub fn load(&mut self) -> Result<()> {
        if !self.live {
            return Err(Error::NotLive);
        }
        self.north.blit_onto(&mut self.loom, &mut self.bitmap, true)?;
        self.south.blit_onto(&mut self.loom, &mut self.bitmap, true)?;
        Ok(())
    }

    /// Copy the current checkpoint images into the backup directory
    /// (`<root>/.urb/bhk`), overwriting whatever backup was there
    /// before. Used to keep a second-to-last-known-good snapshot around.
    ///
    /// Rolls back cleanly on failure: if the south copy fails after the
    /// north copy succeeded, the half-written backup is unlinked before
    /// returning, rather than leaving a backup with only one segment
    /// updated.
    ///
    /// # Errors
    /// Returns [`Error::NotLive`] before [`Engine::live`] has run, and
    /// otherwise any I/O failure encountered opening or copying the
    /// backup images.
    #[tracing::instrument(skip_all)]
    pub fn copy(&mut self) -> Result<()> {
        if !self.live {
            return Err(Error::NotLive);
        }

        let backup_dir = self.config.backup_dir();
        std::fs::create_dir_all(&backup_dir)?;

        let result = (|| -> Result<()> {
            let mut backup_north = Image::open_or_create(
                &backup_dir,
                Segment::North,
                self.config.page_size,
            )?;
            self.north.copy_into(&mut backup_north)?;

            let mut backup_south = Image::open_or_create(
                &backup_dir,
                Segment::South,
                self.config.page_size,
            )?;
            self.south.copy_into(&mut backup_south)?;
            Ok(())
        })();

        if result.is_err() {
            tracing::warn!("copy failed, rolling back partial backup");
            let _ = std::fs::remove_file(backup_dir.join("north.bin"));
            let _ = std::fs::remove_file(backup_dir.join("south.bin"));
        }

        result
    }

    /// Disable write-protection across the whole loom and mark every
    /// page dirty.
    ///
    /// A debugging escape hatch: once called, the engine no longer
    /// receives faults for any page in the loom, so [`Engine::fault`]
    /// will never be invoked again for pages touched while yolo'd. The
    /// whole loom is marked dirty up front so a subsequent `save` does
    /// not miss writes the engine can no longer see happen.
    ///
    /// # Errors
    /// Returns a `mprotect` failure from the underlying loom.
    pub fn yolo(&mut self) -> Result<()> {
        self.loom.protect_all_read_write()?;
        self.bitmap.set_all();
        tracing::warn!("yolo: write-protection disabled for the whole loom");
        Ok(())
    }

    /// Mark every page dirty without changing protection.
    ///
    /// Used after an operation that wrote loom memory outside the normal
    /// fault path (for instance, restoring from an external source) to
    /// force the next `save` to treat the entire loom as changed.
    /// Pages are also relaxed to read-write, since a page recorded dirty
    /// but still read-only would immediately be flagged as a strange
    /// page on its next ordinary write.
    ///
    /// # Errors
    /// Returns a `mprotect` failure from the underlying loom.
    pub fn foul(&mut self) -> Result<()> {
        self.bitmap.set_all();
        self.loom.protect_all_read_write()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Watermarks;

    struct FixedRoad(Watermarks);
    impl Road for FixedRoad {
        fn watermarks(&self) -> Watermarks {
            self.0
        }
    }

    struct RecordingBail {
        called: std::cell::Cell<bool>,
    }
    impl Bail for RecordingBail {
        fn bail(&self, _reason: BailReason) {
            self.called.set(true);
        }
    }

    fn engine(page_count: usize) -> Engine<FixedRoad, RecordingBail> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.keep(), 0x1000, page_count).unwrap();
        let road = FixedRoad(Watermarks {
            north_words: 0,
            south_words: page_count * 0x1000 / 4,
        });
        let bail = RecordingBail {
            called: std::cell::Cell::new(false),
        };
        Engine::new(config, road, bail).unwrap()
    }

    #[test]
    fn fault_before_live_is_not_live() {
        let mut e = engine(8);
        assert!(matches!(e.fault(0, true).unwrap_err(), Error::NotLive));
    }

    #[test]
    fn first_save_persists_everything_then_second_is_a_noop() {
        let mut e = engine(8);
        e.live().unwrap();
        // A brand new loom with no prior checkpoint starts entirely
        // dirty, so the first save writes every page within the
        // watermarks...
        e.save().unwrap();
        assert_eq!(e.bitmap.count_dirty(0..8), 0);
        // ...and the second has nothing left to do.
        e.save().unwrap();
    }

    #[test]
    fn fault_marks_dirty_and_relaxes_protection() {
        let mut e = engine(8);
        e.live().unwrap();
        // Clear the initial all-dirty state so page 0 starts clean and
        // read-only, matching a page already covered by a checkpoint.
        e.save().unwrap();
        assert_eq!(e.loom.protection_of(0), Protection::ReadOnly);

        let addr = e.loom.base_addr();
        // The very first fault on a fresh engine only places the guard
        // page and asks the host to retry; it doesn't yet resolve the
        // original access.
        assert!(e.fault(addr, true).unwrap());
        assert!(e.loom.guard_page().is_some());
        assert!(!e.bitmap.is_dirty(0));

        // The retried fault now takes the ordinary dirty-page path.
        assert!(e.fault(addr, true).unwrap());
        assert!(e.bitmap.is_dirty(0));
        assert_eq!(e.loom.protection_of(0), Protection::ReadWrite);

        // A second fault on the same page is strange.
        assert!(matches!(
            e.fault(addr, true).unwrap_err(),
            Error::StrangePage(0)
        ));
    }

    #[test]
    fn read_fault_after_guard_placed_is_not_handled() {
        let mut e = engine(8);
        e.live().unwrap();
        // Place the guard first.
        e.fault(e.loom.base_addr(), true).unwrap();
        assert!(!e.fault(e.loom.base_addr(), false).unwrap());
    }

    #[test]
    fn raw_accessors_agree_with_config() {
        let e = engine(8);
        assert_eq!(e.page_size(), 0x1000);
        assert_eq!(e.page_count(), 8);
        assert_eq!(e.len(), 8 * 0x1000);
        assert!(!e.is_empty());
        assert_eq!(e.as_bytes().len(), e.len());
        assert_eq!(e.base_addr(), e.loom.base_addr());
    }

    #[test]
    fn copy_rolls_back_on_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.keep();
        let page_count = 4usize;
        let config = Config::new(root.clone(), 0x1000, page_count).unwrap();
        let road = FixedRoad(Watermarks {
            north_words: 0,
            south_words: page_count * 0x1000 / 4,
        });
        let bail = RecordingBail {
            called: std::cell::Cell::new(false),
        };
        let mut e = Engine::new(config, road, bail).unwrap();
        e.live().unwrap();

        let backup_dir = root.join(".urb").join("bhk");
        std::fs::create_dir_all(&backup_dir).unwrap();
        // Occupy south.bin's path with a directory so opening it as a
        // file fails, simulating a failure partway through `copy`.
        std::fs::create_dir(backup_dir.join("south.bin")).unwrap();

        assert!(e.copy().is_err());
        assert!(!backup_dir.join("north.bin").exists());
    }

    #[test]
    fn fault_outside_loom_is_rejected() {
        let mut e = engine(8);
        e.live().unwrap();
        // Place the guard first so the next fault takes the ordinary path.
        e.fault(e.loom.base_addr(), true).unwrap();
        assert!(matches!(
            e.fault(usize::MAX, true).unwrap_err(),
            Error::AddressOutsideLoom(_)
        ));
    }

    #[test]
    fn save_persists_a_dirty_page_across_restart() {
        let dir_root = {
            let dir = tempfile::tempdir().unwrap();
            dir.keep()
        };

        let page_count = 8usize;
        let make = || {
            let config = Config::new(dir_root.clone(), 0x1000, page_count).unwrap();
            let road = FixedRoad(Watermarks {
                north_words: 0,
                south_words: page_count * 0x1000 / 4,
            });
            let bail = RecordingBail {
                called: std::cell::Cell::new(false),
            };
            Engine::new(config, road, bail).unwrap()
        };

        let mut e1 = make();
        e1.live().unwrap();
        // Page 0 starts dirty and read-write on a brand new loom, so it
        // can be written directly without going through `fault`.
        e1.loom.write_page(0, &vec![0x77u8; 0x1000]);
        e1.save().unwrap();
        drop(e1);

        let mut e2 = make();
        e2.live().unwrap();
        assert_eq!(e2.loom.page_bytes(0), &vec![0x77u8; 0x1000][..]);
        assert!(!e2.bitmap.is_dirty(0));
    }

    #[test]
    fn save_with_a_free_middle_region_persists_south_pages_correctly() {
        // page_count=8 with watermarks covering only 3 north + 3 south
        // pages leaves a 2-page free middle region, so north_pages +
        // south_pages (6) != the loom's total page count (8). This is
        // exactly the configuration the total_pages-underflow bug in
        // `Patch::apply` needs to be exercised, rather than masked.
        let dir_root = tempfile::tempdir().unwrap().keep();
        let page_count = 8usize;
        let make = || {
            let config =
                Config::new(dir_root.clone(), 0x1000, page_count).unwrap();
            let road = FixedRoad(Watermarks {
                north_words: 3 * 0x1000 / 4,
                south_words: 3 * 0x1000 / 4,
            });
            let bail = RecordingBail {
                called: std::cell::Cell::new(false),
            };
            Engine::new(config, road, bail).unwrap()
        };

        let mut e1 = make();
        e1.live().unwrap();
        // Loom page 7 is the highest address page: south page index 0.
        e1.loom.write_page(7, &vec![0x99u8; 0x1000]);
        e1.save().unwrap();
        drop(e1);

        let mut e2 = make();
        e2.live().unwrap();
        assert_eq!(e2.loom.page_bytes(7), &vec![0x99u8; 0x1000][..]);
        assert!(!e2.bitmap.is_dirty(7));
    }

    #[test]
    fn yolo_marks_everything_dirty_and_writable() {
        let mut e = engine(4);
        e.live().unwrap();
        e.yolo().unwrap();
        for page in 0..4 {
            assert!(e.bitmap.is_dirty(page));
            assert_eq!(e.loom.protection_of(page), Protection::ReadWrite);
        }
    }

    #[test]
    fn guard_page_collision_invokes_bail() {
        let dir = tempfile::tempdir().unwrap();
        let page_count = 4usize;
        let config = Config::new(dir.keep(), 0x1000, page_count).unwrap();
        // Frontiers meet with no gap between them: no room for a guard page.
        let total_words = page_count * 0x1000 / 4;
        let road = FixedRoad(Watermarks {
            north_words: total_words / 2,
            south_words: total_words / 2,
        });
        let bail = RecordingBail {
            called: std::cell::Cell::new(false),
        };
        let mut e = Engine::new(config, road, bail).unwrap();
        e.live().unwrap();

        let err = e.center_guard_page().unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert!(e.bail.called.get());
    }

    #[test]
    fn guard_page_places_in_almost_empty_loom_with_small_watermarks() {
        // A near-empty loom where south_words is a small *count* from the
        // high end, not anywhere near half the loom's total word count.
        // The free region spans almost the whole loom, so placing a guard
        // must succeed rather than bailing.
        let dir = tempfile::tempdir().unwrap();
        let page_count = 100usize;
        let config = Config::new(dir.keep(), 0x1000, page_count).unwrap();
        let road = FixedRoad(Watermarks {
            north_words: 100,
            south_words: 100,
        });
        let bail = RecordingBail {
            called: std::cell::Cell::new(false),
        };
        let mut e = Engine::new(config, road, bail).unwrap();
        e.live().unwrap();

        e.center_guard_page().unwrap();
        assert!(!e.bail.called.get());
        assert!(e.loom.guard_page().is_some());
    }
}

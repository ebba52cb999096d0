// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Startup recovery: discover and idempotently apply any patch left
//! behind by a save that didn't finish.

use std::path::Path;

use crate::error::Result;
use crate::image::Image;
use crate::patch::Patch;

/// Look for a pending patch in `checkpoint_dir` and, if one is found and
/// passes verification, fold it into the two images.
///
/// This is the only place a half-written save is ever resolved: by the
/// time a process reaches [`Engine::live`](crate::Engine::live), the
/// images on disk are guaranteed to reflect either every patched page or
/// none of them. A patch that fails verification (bad version, bad size,
/// bad checksum) is treated identically to no patch at all — its files
/// are deleted and boot proceeds from the images as they stand, which are
/// themselves still self-consistent because `apply` only ever lands after
/// `compose`+`sync` succeeded on some previous run.
///
/// Returns `true` if a patch was found and applied.
pub(crate) fn recover(
    checkpoint_dir: &Path,
    north: &mut Image,
    south: &mut Image,
    page_size: usize,
    total_pages: usize,
) -> Result<bool> {
    let Some(mut patch) = Patch::open_pending(checkpoint_dir, page_size)? else {
        return Ok(false);
    };

    tracing::info!(
        north_pages = patch.north_pages(),
        south_pages = patch.south_pages(),
        "applying pending patch found at startup"
    );

    patch.apply(north, south, total_pages)?;
    north.sync()?;
    south.sync()?;
    patch.delete();

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::DirtyBitmap;
    use crate::image::Segment;
    use crate::loom::Loom;

    #[test]
    fn no_pending_patch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        let mut north =
            Image::open_or_create(dir.path(), Segment::North, 0x1000).unwrap();
        let mut south =
            Image::open_or_create(dir.path(), Segment::South, 0x1000).unwrap();

        let applied =
            recover(dir.path(), &mut north, &mut south, 0x1000, 8).unwrap();
        assert!(!applied);
    }

    #[test]
    fn pending_patch_gets_applied_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();

        let mut loom = Loom::new(0x1000, 8).unwrap();
        let mut bitmap = DirtyBitmap::new(8);
        bitmap.set_dirty(0);
        loom.write_page(0, &vec![0x42u8; 0x1000]);

        let mut patch =
            Patch::compose(dir.path(), &mut loom, &mut bitmap, 4, 4)
                .unwrap()
                .unwrap();
        patch.sync().unwrap();
        drop(patch);

        let mut north =
            Image::open_or_create(dir.path(), Segment::North, 0x1000).unwrap();
        let mut south =
            Image::open_or_create(dir.path(), Segment::South, 0x1000).unwrap();

        let applied =
            recover(dir.path(), &mut north, &mut south, 0x1000, 8).unwrap();
        assert!(applied);
        assert_eq!(north.page_count(), 4);
        assert_eq!(south.page_count(), 4);
        assert_eq!(north.read_block(0).unwrap(), vec![0x42u8; 0x1000]);
        assert!(!dir.path().join("control.bin").exists());
        assert!(!dir.path().join("memory.bin").exists());
    }
}

//! # Mmap Manager
//!
//! The data file is mapped read-only and shared; all writes go through the
//! file descriptor (`write_at` + fsync) so the kernel page cache is the only
//! writer of the mapped region. Growing the file therefore never mutates
//! pages a reader can see, it only remaps a larger window.
//!
//! Remapping invalidates every outstanding slice into the old region, so it
//! runs under the exclusive side of the database's mmap lock: all live
//! transactions hold the shared side for their lifetime and a remap blocks
//! until they finish. A live writer copies its mmap-backed key/value
//! references to heap buffers (`Tx::dereference`) before its own remap.
//!
//! The growth policy starts at 4 MiB, doubles until 1 GiB, then grows in
//! 1 GiB increments; the result is always rounded up to a page-size multiple.
//! Mapping ahead of the file's physical size keeps remaps rare: pages past
//! EOF become readable as soon as the commit path writes and extends the
//! file.

use std::fs::File;

use memmap2::{Advice, Mmap, MmapOptions};

use crate::error::Result;

/// The smallest size the mmap can be.
pub(crate) const MIN_MMAP_SIZE: u64 = 1 << 22; // 4 MiB

/// The largest step taken when growing the mmap.
pub(crate) const MAX_MMAP_STEP: u64 = 1 << 30; // 1 GiB

/// Read-only mapped window over the data file.
#[derive(Debug, Default)]
pub(crate) struct MmapRegion {
    map: Option<Mmap>,
}

impl MmapRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    /// Drops the mapping, e.g. on database close.
    pub fn unmap(&mut self) {
        self.map = None;
    }

    /// Replaces the mapping with a `size`-byte window over `file`. The old
    /// mapping is dropped first; the caller guarantees no slices into it
    /// survive (enforced by holding the mmap lock exclusively).
    pub fn remap(&mut self, file: &File, size: usize) -> Result<()> {
        self.map = None;

        // SAFETY: mapping a file that may be concurrently written is
        // undefined behavior in general. This is safe because:
        // 1. The database holds an exclusive OS file lock, so no other
        //    process writes the file.
        // 2. Within this process every write goes to pages unreachable from
        //    any committed meta until the commit's final sync, so mapped
        //    bytes a transaction can reach never change underneath it.
        // 3. The mapping is dropped before the file is truncated or closed.
        let map = unsafe { MmapOptions::new().len(size).map(file)? };

        // B+tree traversal is random access; tell the kernel not to
        // read ahead aggressively. Failure is harmless.
        let _ = map.advise(Advice::Random);

        self.map = Some(map);
        Ok(())
    }
}

/// Computes the mapped window for a file of `size` bytes.
pub(crate) fn mmap_size(page_size: usize, size: u64) -> u64 {
    let mut size = if size < MIN_MMAP_SIZE {
        MIN_MMAP_SIZE
    } else if size < MAX_MMAP_STEP {
        size * 2
    } else {
        size + MAX_MMAP_STEP
    };

    let page_size = page_size as u64;
    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }
    size
}

//! The backing file's shared, interior-mutable mapped region: raw shared
//! mutable memory with no language-level sharing discipline on top of it.
//!
//! Sessions and the mirror task read and write through this concurrently
//! with no per-byte locking. The filesystem and the mapping provide
//! coherence; the NBD contract doesn't require serialization among
//! concurrent clients writing the same bytes, any more than a physical
//! block device would.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapMut;

pub struct SharedMap {
    mmap: MmapMut,
    size: u64,
}

// Safety: all mutation goes through raw pointer arithmetic bounded by
// `size`, never through `&mut MmapMut`. Coherence is the filesystem's job,
// not the borrow checker's.
unsafe impl Sync for SharedMap {}

impl SharedMap {
    pub fn open(path: &Path) -> Result<(Self, File)> {
        // O_SYNC: writes through the mapping still go through the page
        // cache, but this keeps non-mmap'd paths (metadata, any future
        // direct write) consistent with the spec's durability intent.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .with_context(|| format!("opening backing file {}", path.display()))?;

        let size = file
            .metadata()
            .with_context(|| format!("stat on backing file {}", path.display()))?
            .len();

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mapping backing file {}", path.display()))?;

        Ok((Self { mmap, size }, file))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// # Safety
    /// `off + len` must not exceed `size()`.
    pub unsafe fn slice(&self, off: u64, len: u64) -> &[u8] {
        std::slice::from_raw_parts(self.ptr().add(off as usize), len as usize)
    }

    /// # Safety
    /// `off + len` must not exceed `size()`. Callers must not alias this
    /// with another `slice_mut`/`slice` covering the same range from the
    /// same thread at once (cross-thread aliasing is the documented
    /// concurrency model, not a bug).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: u64, len: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr().add(off as usize), len as usize)
    }
}

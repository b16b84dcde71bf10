use crate::{Bitset, PAGE_SIZE};

/// One reported filesystem extent: `[logical, logical + length)` is
/// allocated on disk.
#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub logical: u64,
    pub length: u64,
}

/// Abstracts the filesystem's extent-mapping facility (Linux `FIEMAP`) so
/// the allocation map builder can be exercised without a real block device.
///
/// `query` is called repeatedly with an advancing `offset` until it returns
/// an empty `Vec` or `offset >= size`. A single call must not report more
/// than `max_extents` extents, and should not need to inspect more than
/// `max_length` bytes of file — the builder enforces this by construction,
/// implementations just need to honor the window they're asked about.
pub trait ExtentSource {
    /// Returns the extents intersecting `[offset, offset + max_length)`, or
    /// `None` if extent information isn't available at all (the caller then
    /// disables the allocation map entirely).
    fn query(
        &self,
        offset: u64,
        max_length: u64,
        max_extents: usize,
    ) -> Option<Vec<Extent>>;
}

/// An [`ExtentSource`] that always reports "no extent information
/// available", used on platforms without `FIEMAP` and in tests that don't
/// care about sparseness.
pub struct NullExtentSource;

impl ExtentSource for NullExtentSource {
    fn query(&self, _offset: u64, _max_length: u64, _max_extents: usize) -> Option<Vec<Extent>> {
        None
    }
}

/// A [`Bitset`] with `resolution = PAGE_SIZE`, one bit per allocation block
/// of the backing file. Populated once at startup from the filesystem's
/// extent map; mutated thereafter only by write paths that allocate new
/// pages. Never shrunk.
#[derive(Debug, Clone)]
pub struct AllocationMap(Bitset);

impl AllocationMap {
    /// Bounds used when querying the extent source: large enough to avoid
    /// thrashing, small enough to keep each call's blocking syscall short.
    const CHUNK_LEN: u64 = 100 * 1024 * 1024;
    const MAX_EXTENTS_PER_CALL: usize = 1000;

    /// Builds an allocation map for a file of `size` bytes, using `source`
    /// to enumerate extents. Returns `None` if the source ever fails to
    /// produce extent information — callers must treat a `None` map as
    /// "don't optimize, always write literally".
    pub fn build(size: u64, source: &dyn ExtentSource) -> Option<Self> {
        let mut bitset = Bitset::alloc(size, PAGE_SIZE);
        let mut offset = 0u64;

        while offset < size {
            let window = Self::CHUNK_LEN.min(size - offset);
            let extents = source.query(offset, window, Self::MAX_EXTENTS_PER_CALL)?;

            if let Some(last) = extents.last() {
                for extent in &extents {
                    bitset.set_range(extent.logical, extent.length);
                }
                offset = last.logical + last.length;
            } else {
                offset += window;
            }
        }

        log::debug!("allocation map built: size={size}");
        Some(Self(bitset))
    }

    /// An allocation map with every page marked allocated, useful for
    /// callers that know the file has no holes (or don't care).
    pub fn fully_allocated(size: u64) -> Self {
        let mut bitset = Bitset::alloc(size, PAGE_SIZE);
        bitset.set_all();
        Self(bitset)
    }

    /// An allocation map with every page marked unallocated: a file known
    /// to have no extents yet (freshly created and fully sparse), as
    /// opposed to a disabled map (`build` returning `None`) where extent
    /// information simply isn't available.
    pub fn empty(size: u64) -> Self {
        Self(Bitset::alloc(size, PAGE_SIZE))
    }

    pub fn is_allocated_at(&self, off: u64) -> bool {
        self.0.is_set_at(off)
    }

    pub fn set_range(&mut self, off: u64, len: u64) {
        self.0.set_range(off, len);
    }

    pub fn run_count(&self, off: u64, max_len: u64) -> u64 {
        self.0.run_count(off, max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource(Vec<Extent>);

    impl ExtentSource for FakeSource {
        fn query(&self, offset: u64, max_length: u64, _max_extents: usize) -> Option<Vec<Extent>> {
            Some(
                self.0
                    .iter()
                    .copied()
                    .filter(|e| e.logical >= offset && e.logical < offset + max_length)
                    .collect(),
            )
        }
    }

    #[test]
    fn null_source_disables_the_map() {
        assert!(AllocationMap::build(1 << 20, &NullExtentSource).is_none());
    }

    #[test]
    fn extents_are_set_in_the_bitset() {
        let source = FakeSource(vec![Extent { logical: 0, length: 4096 }]);
        let map = AllocationMap::build(4096 * 4, &source).unwrap();
        assert!(map.is_allocated_at(0));
        assert!(!map.is_allocated_at(4096));
    }

    #[test]
    fn empty_extent_list_advances_by_window() {
        // No extents at all: the whole file is reported unallocated, and
        // the builder still terminates (advances by the chunk window).
        let source = FakeSource(vec![]);
        let map = AllocationMap::build(4096 * 4, &source).unwrap();
        assert!(!map.is_allocated_at(0));
    }

    #[test]
    fn fully_allocated_marks_every_page() {
        let map = AllocationMap::fully_allocated(4096 * 4);
        assert!(map.is_allocated_at(0));
        assert!(map.is_allocated_at(4096 * 3));
    }

    #[test]
    fn empty_marks_no_page() {
        let map = AllocationMap::empty(4096 * 4);
        assert!(!map.is_allocated_at(0));
        assert!(!map.is_allocated_at(4096 * 3));
    }
}

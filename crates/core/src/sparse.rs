//! The sparse-preserving write algorithm: writes into
//! unallocated pages are inspected a page at a time and discarded when
//! all-zero, so an all-zero write never forces disk allocation.

use anyhow::{Context, Result};
use bitset::{AllocationMap, PAGE_SIZE};
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;

use crate::backing::SharedMap;

const PAGE_BUF: usize = PAGE_SIZE as usize;

fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Writes `len` bytes read from `socket` at `offset` into `backing`,
/// consulting `alloc` to avoid allocating disk blocks for all-zero payload
/// landing on unallocated pages. Callers must already have verified an
/// allocation map is installed.
pub async fn sparse_write<R>(
    backing: &SharedMap,
    alloc: &RwLock<Option<AllocationMap>>,
    mut offset: u64,
    mut len: u64,
    socket: &mut R,
) -> Result<()>
where
    R: AsyncReadExt + Unpin,
{
    while len > 0 {
        let (run, allocated) = {
            let guard = alloc.read();
            let map = guard
                .as_ref()
                .expect("sparse_write requires an installed allocation map");
            let run = map.run_count(offset, len).min(len);
            (run, map.is_allocated_at(offset))
        };

        if allocated {
            let dst = unsafe { backing.slice_mut(offset, run) };
            socket
                .read_exact(dst)
                .await
                .context("reading write payload into allocated region")?;
        } else {
            let mut pos = offset;
            let end = offset + run;

            while pos < end {
                let page_off = pos % PAGE_SIZE;
                let chunk_len = (PAGE_SIZE - page_off).min(end - pos);
                let mut buf = [0u8; PAGE_BUF];

                socket
                    .read_exact(&mut buf[..chunk_len as usize])
                    .await
                    .context("reading write payload into unallocated region")?;

                if !is_all_zero(&buf[..chunk_len as usize]) {
                    let dst = unsafe { backing.slice_mut(pos, chunk_len) };
                    dst.copy_from_slice(&buf[..chunk_len as usize]);
                    alloc
                        .write()
                        .as_mut()
                        .expect("allocation map installed for the duration of the write")
                        .set_range(pos, chunk_len);
                }

                pos += chunk_len;
            }
        }

        offset += run;
        len -= run;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_map(size: u64) -> (tempfile::NamedTempFile, SharedMap) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        let (map, _f) = SharedMap::open(file.path()).unwrap();
        (file, map)
    }

    #[tokio::test]
    async fn all_zero_write_to_unallocated_page_leaves_bit_clear() {
        let size = 1 << 20;
        let (_file, backing) = scratch_map(size);
        let alloc = RwLock::new(Some(AllocationMap::empty(size)));

        let zeros = vec![0u8; 4096];
        let mut reader = std::io::Cursor::new(zeros);
        sparse_write(&backing, &alloc, 0, 4096, &mut reader)
            .await
            .unwrap();

        assert!(!alloc.read().as_ref().unwrap().is_allocated_at(0));
        assert!(unsafe { backing.slice(0, 4096) }.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn non_zero_write_to_unallocated_page_sets_bit_and_copies_data() {
        let size = 1 << 20;
        let (_file, backing) = scratch_map(size);
        let alloc = RwLock::new(Some(AllocationMap::empty(size)));

        let mut payload = vec![0u8; 4096];
        payload[10] = 7;
        let mut reader = std::io::Cursor::new(payload.clone());
        sparse_write(&backing, &alloc, 0, 4096, &mut reader)
            .await
            .unwrap();

        assert!(alloc.read().as_ref().unwrap().is_allocated_at(0));
        assert_eq!(unsafe { backing.slice(0, 4096) }, &payload[..]);
    }

    #[tokio::test]
    async fn write_to_already_allocated_region_skips_the_zero_check() {
        let size = 1 << 20;
        let (_file, backing) = scratch_map(size);
        let alloc = RwLock::new(Some(AllocationMap::fully_allocated(size)));

        let zeros = vec![0u8; 4096];
        let mut reader = std::io::Cursor::new(zeros);
        sparse_write(&backing, &alloc, 0, 4096, &mut reader)
            .await
            .unwrap();

        // already allocated, so the bit stays set regardless of payload.
        assert!(alloc.read().as_ref().unwrap().is_allocated_at(0));
    }

    #[tokio::test]
    async fn write_spanning_a_page_boundary_at_an_unaligned_offset() {
        let size = 1 << 20;
        let (_file, backing) = scratch_map(size);
        let alloc = RwLock::new(Some(AllocationMap::empty(size)));

        let mut payload = vec![1u8; 8192];
        payload[4000] = 0; // irrelevant: any non-zero byte in a chunk allocates it
        let mut reader = std::io::Cursor::new(payload.clone());
        sparse_write(&backing, &alloc, 4000, 8192, &mut reader)
            .await
            .unwrap();

        assert!(alloc.read().as_ref().unwrap().is_allocated_at(4000));
        assert!(alloc.read().as_ref().unwrap().is_allocated_at(8192));
        assert_eq!(unsafe { backing.slice(4000, 8192) }, &payload[..]);
    }
}

//! Linux `FIEMAP` ioctl backing for [`bitset::ExtentSource`].
//!
//! Non-Linux targets have no implementation here; callers fall back to
//! `bitset::NullExtentSource`, which disables the allocation map per the
//! documented failure mode.

#![cfg(target_os = "linux")]

use std::os::unix::io::AsRawFd;

use bitset::{Extent, ExtentSource};

const FIEMAP_EXTENT_MAX: usize = 32;
// FS_IOC_FIEMAP, as defined by linux/fiemap.h / linux/fs.h on x86_64 and
// aarch64 (the ioctl encoding is architecture-independent for this request).
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

#[repr(C)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct Fiemap {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; FIEMAP_EXTENT_MAX],
}

pub struct LinuxExtentSource<'a> {
    fd: &'a dyn AsRawFd,
}

impl<'a> LinuxExtentSource<'a> {
    pub fn new(fd: &'a dyn AsRawFd) -> Self {
        Self { fd }
    }
}

impl ExtentSource for LinuxExtentSource<'_> {
    fn query(&self, offset: u64, max_length: u64, max_extents: usize) -> Option<Vec<Extent>> {
        let mut result = Vec::new();
        let mut start = offset;
        let end = offset + max_length;

        while start < end && result.len() < max_extents {
            let mut req: Fiemap = unsafe { std::mem::zeroed() };
            req.fm_start = start;
            req.fm_length = end - start;
            req.fm_extent_count = FIEMAP_EXTENT_MAX as u32;

            let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), FS_IOC_FIEMAP, &mut req) };
            if rc != 0 {
                log::warn!("FIEMAP ioctl failed: {}", std::io::Error::last_os_error());
                return None;
            }

            if req.fm_mapped_extents == 0 {
                break;
            }

            for e in &req.fm_extents[..req.fm_mapped_extents as usize] {
                result.push(Extent {
                    logical: e.fe_logical,
                    length: e.fe_length,
                });
                if result.len() >= max_extents {
                    break;
                }
            }

            let last = &req.fm_extents[req.fm_mapped_extents as usize - 1];
            start = last.fe_logical + last.fe_length;
        }

        Some(result)
    }
}

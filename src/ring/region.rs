//! Backing memory for the byte ring: zeroed heap pages or an anonymous
//! huge-page mapping.
//!
//! The region hands out slices manufactured from a raw base pointer
//! rather than borrowing an owned `[u8]`, because producer and consumer
//! access disjoint index ranges concurrently from two threads. The SPSC
//! cursor protocol (see [`crate::ring`]) is what makes those ranges
//! disjoint; every access site states that argument.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use thiserror::Error;

/// Alignment of the backing allocation. One cache line; the page-level
/// alignment of huge-page mappings comes from `mmap` itself.
const REGION_ALIGN: usize = 64;

/// Errors acquiring backing memory.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Heap allocation returned null.
    #[error("failed to allocate {bytes} bytes of ring memory")]
    Allocation { bytes: usize },
    /// Anonymous huge-page mapping failed (typically no huge pages
    /// reserved; see /proc/sys/vm/nr_hugepages).
    #[error("failed to map {bytes} bytes of huge-page ring memory")]
    Map {
        bytes: usize,
        #[source]
        source: std::io::Error,
    },
    /// Huge pages are only supported on Linux.
    #[error("huge-page backing is not supported on this platform")]
    HugePagesUnsupported,
}

enum Backing {
    Heap,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    HugePages,
}

/// An owned, fixed-length contiguous byte region.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

impl Region {
    /// Allocates a zeroed region of exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError`] if the backing memory cannot be
    /// obtained. With `huge_pages`, `len` must already be a multiple of
    /// the huge page size.
    pub fn allocate(len: usize, huge_pages: bool) -> Result<Self, RegionError> {
        if huge_pages {
            Self::map_huge(len)
        } else {
            // SAFETY: len is non-zero (callers allocate at least one
            // page) and the layout is valid for the fixed alignment.
            let layout = Layout::from_size_align(len, REGION_ALIGN)
                .map_err(|_| RegionError::Allocation { bytes: len })?;
            let raw = unsafe { alloc::alloc_zeroed(layout) };
            let ptr =
                NonNull::new(raw).ok_or(RegionError::Allocation { bytes: len })?;
            Ok(Self {
                ptr,
                len,
                backing: Backing::Heap,
            })
        }
    }

    #[cfg(target_os = "linux")]
    fn map_huge(len: usize) -> Result<Self, RegionError> {
        use rustix::mm::{MapFlags, ProtFlags};

        // SAFETY: requesting a fresh anonymous mapping; no existing
        // address range is touched.
        let raw = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::HUGETLB,
            )
        }
        .map_err(|errno| RegionError::Map {
            bytes: len,
            source: errno.into(),
        })?;

        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(RegionError::Allocation { bytes: len })?;
        Ok(Self {
            ptr,
            len,
            backing: Backing::HugePages,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn map_huge(_len: usize) -> Result<Self, RegionError> {
        Err(RegionError::HugePagesUnsupported)
    }

    /// Total allocated length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Immutable view of `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no mutable access to this range
    /// exists for the lifetime of the returned slice. Under the SPSC
    /// protocol that means: the range was published by the producer and
    /// not yet released by the consumer.
    #[must_use]
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: in-bounds per the assert; aliasing per the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Mutable view of `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access to this range for the
    /// lifetime of the returned slice. Under the SPSC protocol that
    /// means: the range lies in the producer's unpublished free space
    /// (including the slack tail).
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: in-bounds per the assert; exclusivity per the caller.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }

    /// Copies `len` bytes from `src` to `dst` within the region.
    ///
    /// # Safety
    ///
    /// Both ranges must be in bounds, non-overlapping, and exclusively
    /// owned by the caller under the SPSC protocol.
    pub unsafe fn copy_within(&self, src: usize, dst: usize, len: usize) {
        debug_assert!(src + len <= self.len);
        debug_assert!(dst + len <= self.len);
        debug_assert!(dst + len <= src || src + len <= dst, "ranges overlap");
        // SAFETY: per the asserts and the caller's exclusivity claim.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(src),
                self.ptr.as_ptr().add(dst),
                len,
            );
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap => {
                // SAFETY: same layout as the allocation in `allocate`.
                let layout = Layout::from_size_align(self.len, REGION_ALIGN)
                    .expect("layout validated at allocation");
                unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
            #[cfg(target_os = "linux")]
            Backing::HugePages => {
                // SAFETY: ptr/len are exactly what mmap returned.
                let _ = unsafe {
                    rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len)
                };
            }
            #[cfg(not(target_os = "linux"))]
            Backing::HugePages => unreachable!("huge pages rejected at allocation"),
        }
    }
}

// SAFETY: the region is just memory; cross-thread access discipline is
// imposed by the ring's cursor protocol, not by the region itself.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

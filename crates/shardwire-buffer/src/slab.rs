//! Slab: one contiguous memory region that blocks are carved from.
//!
//! On unix the region comes straight from an anonymous `mmap`, so it is
//! page aligned and zero filled. Elsewhere it is a zeroed heap allocation
//! aligned to the cache line.
//!
//! A slab is shared (`Arc`) by every block carved from it. The pool flips
//! `active` off when it is disposed; blocks from an inactive slab are
//! dropped instead of recycled, and the region itself is released when the
//! last block referencing it goes away.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{BufferError, Result};

pub(crate) struct Slab {
    id: usize,
    base: NonNull<u8>,
    len: usize,
    active: AtomicBool,
}

// Safety: the slab never hands out references to its bytes itself; each
// block carved from it owns a disjoint range and synchronizes access to it.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    pub(crate) fn allocate(id: usize, len: usize) -> Result<Self> {
        let base = region::map(len)?;
        Ok(Self {
            id,
            base,
            len,
            active: AtomicBool::new(true),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        region::unmap(self.base, self.len);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod region {
            use super::*;

            pub(super) fn map(len: usize) -> Result<NonNull<u8>> {
                // Safety: anonymous private mapping, no file descriptor involved.
                let ptr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    return Err(BufferError::SlabAllocation { len, errno });
                }
                NonNull::new(ptr as *mut u8).ok_or(BufferError::SlabAllocation { len, errno: 0 })
            }

            pub(super) fn unmap(base: NonNull<u8>, len: usize) {
                // Safety: `base`/`len` are exactly what `map` returned.
                let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, len) };
                if ret != 0 {
                    tracing::warn!(
                        len,
                        error = %std::io::Error::last_os_error(),
                        "munmap of slab failed"
                    );
                }
            }
        }
    } else {
        mod region {
            use super::*;
            use shardwire_core::CACHE_LINE_SIZE;
            use std::alloc::{alloc_zeroed, dealloc, Layout};

            fn layout(len: usize) -> Option<Layout> {
                Layout::from_size_align(len, CACHE_LINE_SIZE).ok()
            }

            pub(super) fn map(len: usize) -> Result<NonNull<u8>> {
                let layout = layout(len)
                    .filter(|l| l.size() > 0)
                    .ok_or(BufferError::SlabAllocation { len, errno: 0 })?;
                // Safety: layout has a non-zero size.
                let ptr = unsafe { alloc_zeroed(layout) };
                NonNull::new(ptr).ok_or(BufferError::SlabAllocation { len, errno: 0 })
            }

            pub(super) fn unmap(base: NonNull<u8>, len: usize) {
                if let Some(layout) = layout(len) {
                    // Safety: allocated by `map` with the same layout.
                    unsafe { dealloc(base.as_ptr(), layout) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_is_zeroed_and_writable() {
        let slab = Slab::allocate(3, 8192).unwrap();
        assert_eq!(slab.id(), 3);
        assert_eq!(slab.len(), 8192);
        assert!(slab.is_active());

        // Safety: the test is the only user of the region.
        let bytes = unsafe { std::slice::from_raw_parts_mut(slab.base().as_ptr(), slab.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[8191] = 0xAB;
        assert_eq!(bytes[8191], 0xAB);

        slab.deactivate();
        assert!(!slab.is_active());
    }
}

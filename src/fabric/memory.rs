//! Raw device-memory allocations for the peer fabric.
//!
//! A `DeviceBuffer` stands in for a region of GPU memory that has been
//! mapped for direct access by every rank in the group. It hands out raw
//! pointers because that is the contract the kernels operate under: the
//! active algorithm assigns disjoint write regions per rank, and ordering
//! comes from the signal protocol, not from references.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Base alignment for device allocations. 128 bytes covers the 16-byte
/// packed-vector requirement with cache-line headroom.
pub const DEVICE_ALLOC_ALIGN: usize = 128;

/// A zeroed, aligned, interior-mutable allocation standing in for device
/// memory.
///
/// Concurrent access is governed by the collective in flight: rank *i*
/// never writes into a region of rank *j*'s buffer outside the regions the
/// active algorithm assigns to it, and every cross-rank read is ordered
/// after the matching signal acquire.
pub struct DeviceBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The kernels uphold the write-disjointness protocol documented above.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    /// Allocate `len` zeroed bytes at `DEVICE_ALLOC_ALIGN` alignment.
    ///
    /// # Panics
    /// Panics on `len == 0` or allocation failure, like a device OOM.
    pub fn alloc(len: usize) -> Self {
        assert!(len > 0, "zero-sized device allocation");
        let layout = Layout::from_size_align(len, DEVICE_ALLOC_ALIGN)
            .expect("invalid device allocation layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("device allocation failed");
        Self { ptr, len, layout }
    }

    /// Length of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw base pointer. Writes through it must respect the active
    /// algorithm's region assignment and signal ordering.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from alloc_zeroed above.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Raw pointer wrapper that can cross thread boundaries into kernel blocks
/// and stream closures. The referent's lifetime is pinned by the `Arc`s
/// captured alongside it.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_and_aligned() {
        let buf = DeviceBuffer::alloc(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % DEVICE_ALLOC_ALIGN, 0);

        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}

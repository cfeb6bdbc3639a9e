//! Minimal dense tensor handle consumed by the collective dispatcher.
//!
//! This is deliberately not a framework tensor: no strides, no autograd, no
//! dtype promotion. It is the contiguous device-resident vector the
//! all-reduce operates on in place.

use std::sync::Arc;

use half::bf16;

use crate::fabric::memory::DeviceBuffer;

/// Element types a `DeviceTensor` can carry.
///
/// The collective kernels accept `BF16` only; `F32` exists so callers get a
/// configuration error instead of silent reinterpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    BF16,
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::BF16 => 2,
            DType::F32 => 4,
        }
    }
}

/// A dense, contiguous vector in one device's memory.
///
/// The backing allocation is shared (`Arc`) so in-flight stream work keeps
/// it alive after the caller's borrow ends; mutation happens through raw
/// pointers under the collective's ordering protocol, which is why the
/// collective surface takes `&DeviceTensor` and still reduces in place.
pub struct DeviceTensor {
    buf: Arc<DeviceBuffer>,
    dtype: DType,
    numel: usize,
    device: usize,
}

impl DeviceTensor {
    /// Allocate a zeroed tensor of `numel` elements on `device`.
    ///
    /// Capacity is rounded up to a 16-byte multiple so packed accesses to
    /// the final fragment stay in bounds; elements past `numel` are
    /// never touched by the collectives.
    pub fn zeros(numel: usize, dtype: DType, device: usize) -> Self {
        let bytes = numel.max(1) * dtype.size_in_bytes();
        let capacity = bytes.div_ceil(16) * 16;
        Self {
            buf: Arc::new(DeviceBuffer::alloc(capacity)),
            dtype,
            numel,
            device,
        }
    }

    /// Build a bf16 tensor from host data.
    pub fn from_bf16_slice(data: &[bf16], device: usize) -> Self {
        let tensor = Self::zeros(data.len(), DType::BF16, device);
        // SAFETY: fresh allocation, capacity >= data.len() * 2.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                tensor.buf.as_ptr(),
                data.len() * 2,
            );
        }
        tensor
    }

    /// Copy the element data back to the host.
    pub fn to_bf16_vec(&self) -> Vec<bf16> {
        assert_eq!(self.dtype, DType::BF16);
        let mut out = vec![bf16::ZERO; self.numel];
        // SAFETY: buffer holds at least numel * 2 bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buf.as_ptr() as *const u8,
                out.as_mut_ptr() as *mut u8,
                self.numel * 2,
            );
        }
        out
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Index of the device this tensor lives on.
    pub fn device(&self) -> usize {
        self.device
    }

    /// Payload size in bytes (`numel`, not capacity).
    pub fn size_in_bytes(&self) -> usize {
        self.numel * self.dtype.size_in_bytes()
    }

    /// Capacity of the backing allocation in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.buf.len()
    }

    /// The whole backing allocation, including bytes past `numel`.
    /// Host-side inspection only; not ordered against in-flight streams.
    pub fn raw_bytes(&self) -> &[u8] {
        // SAFETY: allocation is live for &self.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.buf.len()) }
    }

    /// Write raw bytes at `offset` into the backing allocation.
    /// Host-side staging only; not ordered against in-flight streams.
    pub fn write_raw_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.buf.len());
        // SAFETY: bounds checked above; caller serializes host access.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.buf.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Shared handle to the backing allocation.
    pub(crate) fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data: Vec<bf16> = (0..7).map(|i| bf16::from_f32(i as f32)).collect();
        let tensor = DeviceTensor::from_bf16_slice(&data, 3);

        assert_eq!(tensor.dtype(), DType::BF16);
        assert_eq!(tensor.numel(), 7);
        assert_eq!(tensor.device(), 3);
        assert_eq!(tensor.size_in_bytes(), 14);
        assert_eq!(tensor.capacity_bytes(), 16);
        assert_eq!(tensor.to_bf16_vec(), data);
    }

    #[test]
    fn test_zeros_capacity_rounding() {
        let tensor = DeviceTensor::zeros(9, DType::BF16, 0);
        assert_eq!(tensor.capacity_bytes(), 32);
        assert!(tensor.to_bf16_vec().iter().all(|v| *v == bf16::ZERO));
    }
}

//! Physically contiguous buffers shared with the controller
//!
//! A [`DmaRegion`] owns one block of physical memory together with its
//! kernel mapping. Acquisition allocates and maps; dropping the region unmaps
//! and frees in the reverse order.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::{error::UhdaResult, kernel_api::KernelApi};

/// RAII owner of a mapped, physically contiguous buffer
pub struct DmaRegion {
    kernel: Arc<dyn KernelApi>,
    /// Physical address programmed into the hardware
    phys: u64,
    /// Kernel mapping of `phys`
    virt: NonNull<u8>,
    /// Size in bytes
    size: usize,
}

impl DmaRegion {
    /// Allocate and map `size` bytes, zero filled
    pub fn new(kernel: &Arc<dyn KernelApi>, size: usize) -> UhdaResult<Self> {
        let phys = kernel.allocate_physical(size)?;
        let virt = match kernel.map(phys, size) {
            Ok(virt) => virt,
            Err(err) => {
                kernel.deallocate_physical(phys, size);
                return Err(err);
            }
        };

        // SAFETY: `virt` maps `size` bytes that this region now owns
        // exclusively; nothing else has seen the pointer yet.
        unsafe { core::ptr::write_bytes(virt.as_ptr(), 0, size) };

        Ok(Self {
            kernel: kernel.clone(),
            phys,
            virt,
            size,
        })
    }

    /// Physical address of the first byte
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Virtual address of the first byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get buffer as slice
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers `size` bytes and lives as long as `self`.
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.size) }
    }

    /// Get buffer as mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping covers `size` bytes and `&mut self` guarantees
        // no other slice of it exists on the CPU side.
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.size) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.kernel.unmap(self.virt, self.size);
        self.kernel.deallocate_physical(self.phys, self.size);
    }
}

// SAFETY: DmaRegion exclusively owns its mapping. CPU-side access goes through
// `&self`/`&mut self`, and every owner keeps regions behind a spin::Mutex.
unsafe impl Send for DmaRegion {}
// SAFETY: shared access only hands out `&[u8]` or the raw pointer; callers
// that write through the pointer hold the owning lock.
unsafe impl Sync for DmaRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHardware;

    #[test]
    fn test_region_is_zeroed_and_released() {
        let hw = MockHardware::new();
        let kernel = hw.kernel();
        {
            let region = DmaRegion::new(&kernel, 4096).unwrap();
            assert_eq!(region.size(), 4096);
            assert_eq!(region.phys_addr() % 4096, 0);
            assert!(region.as_slice().iter().all(|&b| b == 0));
            assert_eq!(hw.live_allocations(), 1);
        }
        assert_eq!(hw.live_allocations(), 0);
    }

    #[test]
    fn test_map_failure_frees_physical_block() {
        let hw = MockHardware::new();
        hw.fail_next_map();
        let kernel = hw.kernel();
        assert!(DmaRegion::new(&kernel, 4096).is_err());
        assert_eq!(hw.live_allocations(), 0);
    }
}

//! Host kernel interface
//!
//! The driver core never touches page tables, PCI configuration mechanisms or
//! interrupt controllers itself. The embedding kernel implements
//! [`KernelApi`] for memory and timing services and [`PciDevice`] for the
//! device the controller is bound to.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::{
    config::{POLL_INTERVAL_US, POLL_ITERATIONS},
    error::{UhdaError, UhdaResult},
};

/// Memory and timing services of the host kernel
pub trait KernelApi: Send + Sync {
    /// Allocate `size` bytes of physically contiguous, page aligned memory
    ///
    /// Returns the physical address of the block.
    fn allocate_physical(&self, size: usize) -> UhdaResult<u64>;

    /// Return a block obtained from [`KernelApi::allocate_physical`]
    fn deallocate_physical(&self, phys: u64, size: usize);

    /// Map `size` bytes at `phys` into the kernel address space, uncached
    fn map(&self, phys: u64, size: usize) -> UhdaResult<NonNull<u8>>;

    /// Remove a mapping created by [`KernelApi::map`]
    fn unmap(&self, virt: NonNull<u8>, size: usize);

    /// Busy-wait for at least `micros` microseconds
    fn delay(&self, micros: u32);
}

/// Interrupt routing preference passed to [`PciDevice::allocate_irq`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqHint {
    /// Any mechanism the host prefers (MSI-X, MSI or INTx)
    Any,
    /// Legacy pin based INTx only
    Legacy,
}

/// Opaque interrupt registration handed out by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqHandle(pub usize);

/// Interrupt callback registered with the host
///
/// Implementations run in interrupt context. They must not block, sleep or
/// wait on any lock that the interrupted context may hold.
pub trait InterruptHandler: Send + Sync {
    /// Service the interrupt; returns whether the device raised it
    fn handle_interrupt(&self) -> bool;
}

/// PCI function the controller is bound to
pub trait PciDevice: Send + Sync {
    /// Read `size` (1, 2 or 4) bytes of configuration space at `offset`
    fn read_config(&self, offset: u16, size: u8) -> UhdaResult<u32>;

    /// Write `size` (1, 2 or 4) bytes of configuration space at `offset`
    fn write_config(&self, offset: u16, size: u8, value: u32) -> UhdaResult<()>;

    /// Map memory BAR `bar` and return its virtual base
    fn map_bar(&self, bar: u8) -> UhdaResult<NonNull<u8>>;

    /// Remove a mapping created by [`PciDevice::map_bar`]
    fn unmap_bar(&self, bar: u8, virt: NonNull<u8>);

    /// Register `handler` for the device's interrupt
    fn allocate_irq(
        &self,
        hint: IrqHint,
        handler: Arc<dyn InterruptHandler>,
    ) -> UhdaResult<IrqHandle>;

    /// Release a registration; the handler is never invoked afterwards
    fn deallocate_irq(&self, irq: IrqHandle);

    /// Unmask or mask delivery of a registered interrupt
    fn enable_irq(&self, irq: IrqHandle, enable: bool);
}

/// Poll `done` every [`POLL_INTERVAL_US`] until it holds
///
/// Gives up with [`UhdaError::Timeout`] after [`POLL_ITERATIONS`] delays.
pub(crate) fn poll_until(kernel: &dyn KernelApi, mut done: impl FnMut() -> bool) -> UhdaResult<()> {
    for _ in 0..POLL_ITERATIONS {
        if done() {
            return Ok(());
        }
        kernel.delay(POLL_INTERVAL_US);
    }
    Err(UhdaError::Timeout)
}

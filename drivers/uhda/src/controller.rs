//! HD-Audio controller lifecycle
//!
//! [`Controller`] owns everything a single controller needs: the BAR mapping,
//! the interrupt registration, the verb rings, the DMA position buffer, the
//! stream slots and the enumerated codecs. It drives the reset state machine:
//!
//! ```text
//! init() ──> resume() ──> Active ──suspend()──> Suspended
//!               ^                                   │
//!               └───────────────resume()────────────┘
//! ```
//!
//! `destroy()` suspends and releases the interrupt; dropping the controller
//! releases everything else in reverse order of acquisition.

use alloc::{sync::Arc, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{error, info, warn};
use spin::{Mutex, MutexGuard};

use crate::{
    codec::{Codec, CodecTopology, Output},
    config::{
        CODEC_SETTLE_US, LEGACY_IRQ_VENDOR_ID, MAX_CODECS, MAX_DESCRIPTORS, MAX_STREAMS,
        PAGE_SIZE, RESET_ACK_US, RESET_SETTLE_US,
    },
    dma::DmaRegion,
    error::{UhdaError, UhdaResult},
    format::StreamParams,
    kernel_api::{poll_until, InterruptHandler, IrqHandle, IrqHint, KernelApi, PciDevice},
    path::Path,
    regs::{
        self, stream, DmaPositionBase, GlobalCapabilities, GlobalControl, RegisterSpace,
        StreamControl,
    },
    stream::{InterruptGate, Stream},
    verb::VerbQueue,
};

// PCI configuration space
const PCI_VENDOR_ID: u16 = 0x00;
const PCI_DEVICE_ID: u16 = 0x02;
const PCI_COMMAND: u16 = 0x04;
const PCI_BAR0: u16 = 0x10;
const PCI_BAR_COUNT: u8 = 6;

const COMMAND_MEMORY_SPACE: u32 = 1 << 1;
const COMMAND_BUS_MASTER: u32 = 1 << 2;
const BAR_IO_SPACE: u32 = 1 << 0;

// ============================================================================
// Owned host resources
// ============================================================================

/// Mapped memory BAR, unmapped on drop
struct BarMapping {
    pci: Arc<dyn PciDevice>,
    bar: u8,
    virt: NonNull<u8>,
}

impl BarMapping {
    /// Map the first BAR that decodes memory space
    fn map_first_memory_bar(pci: &Arc<dyn PciDevice>) -> UhdaResult<Self> {
        for bar in 0..PCI_BAR_COUNT {
            let value = pci.read_config(PCI_BAR0 + bar as u16 * 4, 4)?;
            if value & BAR_IO_SPACE != 0 {
                continue;
            }
            let virt = pci.map_bar(bar)?;
            return Ok(Self {
                pci: pci.clone(),
                bar,
                virt,
            });
        }
        error!("uhda: no memory BAR");
        Err(UhdaError::Unsupported)
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        self.pci.unmap_bar(self.bar, self.virt);
    }
}

// SAFETY: the mapping is an MMIO address owned by this object; all accesses
// through it are volatile and serialised by the controller.
unsafe impl Send for BarMapping {}
// SAFETY: see the Send impl.
unsafe impl Sync for BarMapping {}

/// Interrupt registration, masked and released on drop
struct IrqRegistration {
    pci: Arc<dyn PciDevice>,
    handle: IrqHandle,
}

impl IrqRegistration {
    fn enable(&self, enable: bool) {
        self.pci.enable_irq(self.handle, enable);
    }
}

impl Drop for IrqRegistration {
    fn drop(&mut self) {
        self.pci.enable_irq(self.handle, false);
        self.pci.deallocate_irq(self.handle);
    }
}

// ============================================================================
// Interrupt side
// ============================================================================

/// State shared with the interrupt handler
struct Shared {
    space: RegisterSpace,
    gate: Arc<InterruptGate>,
    in_streams: Vec<Stream>,
    out_streams: Vec<Stream>,
    in_count: AtomicUsize,
    out_count: AtomicUsize,
}

impl Shared {
    fn new(kernel: &Arc<dyn KernelApi>, space: RegisterSpace) -> UhdaResult<Self> {
        let gate = Arc::new(InterruptGate::new(space));
        let mut in_streams = Vec::new();
        let mut out_streams = Vec::new();
        in_streams.try_reserve_exact(MAX_STREAMS)?;
        out_streams.try_reserve_exact(MAX_STREAMS)?;
        for index in 0..MAX_STREAMS as u8 {
            in_streams.push(Stream::new(kernel.clone(), gate.clone(), index, false));
            out_streams.push(Stream::new(kernel.clone(), gate.clone(), index, true));
        }
        Ok(Self {
            space,
            gate,
            in_streams,
            out_streams,
            in_count: AtomicUsize::new(0),
            out_count: AtomicUsize::new(0),
        })
    }

    fn output_streams(&self) -> &[Stream] {
        &self.out_streams[..self.out_count.load(Ordering::Acquire)]
    }
}

impl InterruptHandler for Shared {
    fn handle_interrupt(&self) -> bool {
        let status = self.space.load(regs::INTSTS);
        if status.is_empty() {
            return false;
        }

        // Streams with their enable bit cleared are being driven by an API
        // call that holds their lock.
        let pending = status.streams() & self.space.load(regs::INTCTL).stream_enables();
        let in_count = self.in_count.load(Ordering::Acquire);
        let out_count = self.out_count.load(Ordering::Acquire);
        for (i, stream) in self.out_streams[..out_count].iter().enumerate() {
            if pending & (1 << (in_count + i)) != 0 {
                stream.output_irq();
            }
        }
        true
    }
}

// ============================================================================
// Controller-lock protected state
// ============================================================================

/// Handle on one of a codec's output paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathId {
    /// Address of the codec owning the path
    pub codec: u8,
    /// Index into [`Codec::output_paths`]
    pub index: usize,
}

/// Everything serialised by the controller lock
///
/// Obtained through [`Controller::lock`]. Verb submission is positional, so
/// every codec and path operation goes through here.
pub struct ControllerState {
    verbs: VerbQueue,
    codecs: Vec<Codec>,
}

impl ControllerState {
    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    pub fn codec(&self, address: u8) -> Option<&Codec> {
        self.codecs.iter().find(|codec| codec.address() == address)
    }

    pub fn path(&self, id: PathId) -> Option<&Path> {
        self.codec(id.codec)?.output_paths().get(id.index)
    }

    /// Raw verb access for callers issuing their own codec commands
    pub fn verbs(&mut self) -> &mut VerbQueue {
        &mut self.verbs
    }

    /// Split borrow of the verb queue and the codec at `address`
    fn codec_mut(&mut self, address: u8) -> UhdaResult<(&mut VerbQueue, &mut Codec)> {
        let codec = self
            .codecs
            .iter_mut()
            .find(|codec| codec.address() == address)
            .ok_or(UhdaError::Unsupported)?;
        Ok((&mut self.verbs, codec))
    }

    /// Path of codec `codec` to `dest` that can run alongside `others`
    ///
    /// `others` may belong to any codec of this controller.
    pub fn find_path(
        &self,
        codec: u8,
        dest: &Output,
        others: &[PathId],
        same_stream: bool,
    ) -> UhdaResult<PathId> {
        let owner = self.codec(codec).ok_or(UhdaError::Unsupported)?;
        let mut resolved = Vec::new();
        resolved.try_reserve_exact(others.len())?;
        for &other in others {
            resolved.push(self.path(other).ok_or(UhdaError::Unsupported)?);
        }
        let index = owner.find_path(dest, &resolved, same_stream)?;
        Ok(PathId { codec, index })
    }

    pub fn path_setup(
        &mut self,
        path: PathId,
        params: &mut StreamParams,
        stream: &Stream,
    ) -> UhdaResult<()> {
        let (verbs, codec) = self.codec_mut(path.codec)?;
        codec.setup_path(verbs, path.index, params, stream)
    }

    pub fn path_shutdown(&mut self, path: PathId) -> UhdaResult<()> {
        let (verbs, codec) = self.codec_mut(path.codec)?;
        codec.shutdown_path(verbs, path.index)
    }

    /// Set the path's converter gain to `volume` percent
    pub fn path_set_volume(&mut self, path: PathId, volume: u32) -> UhdaResult<()> {
        let (verbs, codec) = self.codec_mut(path.codec)?;
        codec.set_path_volume(verbs, path.index, volume)
    }

    pub fn path_mute(&mut self, path: PathId, mute: bool) -> UhdaResult<()> {
        let (verbs, codec) = self.codec_mut(path.codec)?;
        codec.mute_path(verbs, path.index, mute)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// One HD-Audio controller bound to a PCI function
pub struct Controller {
    // Fields drop top to bottom: the position page and rings go before the
    // interrupt registration, the BAR goes last.
    positions: DmaRegion,
    state: Mutex<ControllerState>,
    irq: Option<IrqRegistration>,
    shared: Arc<Shared>,
    /// Keeps the register block behind `shared.space` mapped
    _bar: BarMapping,
    kernel: Arc<dyn KernelApi>,
    pci: Arc<dyn PciDevice>,
    topology: Arc<dyn CodecTopology>,
}

impl Controller {
    /// Bring up the controller behind `pci` and enumerate its codecs
    ///
    /// `topology` fills in the widget graph of each codec found.
    pub fn init(
        kernel: Arc<dyn KernelApi>,
        pci: Arc<dyn PciDevice>,
        topology: Arc<dyn CodecTopology>,
    ) -> UhdaResult<Self> {
        enable_pci(&*pci)?;
        let bar = BarMapping::map_first_memory_bar(&pci)?;
        // SAFETY: the BAR maps the controller register block and `bar` keeps
        // it mapped for as long as the controller exists.
        let space = unsafe { RegisterSpace::new(bar.virt) };

        let vendor = pci.read_config(PCI_VENDOR_ID, 2)? as u16;
        let device = pci.read_config(PCI_DEVICE_ID, 2)? as u16;
        let hint = if vendor == LEGACY_IRQ_VENDOR_ID {
            IrqHint::Legacy
        } else {
            IrqHint::Any
        };

        let shared = Arc::new(Shared::new(&kernel, space)?);
        let handle = pci.allocate_irq(hint, shared.clone())?;
        let irq = IrqRegistration {
            pci: pci.clone(),
            handle,
        };

        let verbs = VerbQueue::new(&kernel, space)?;
        let positions = DmaRegion::new(&kernel, PAGE_SIZE)?;
        info!(
            "uhda: controller {:04x}:{:04x}, irq {:?}",
            vendor, device, hint
        );

        let controller = Self {
            positions,
            state: Mutex::new(ControllerState {
                verbs,
                codecs: Vec::new(),
            }),
            irq: Some(irq),
            shared,
            _bar: bar,
            kernel,
            pci,
            topology,
        };
        controller.resume()?;
        Ok(controller)
    }

    /// Suspend the controller and release its interrupt
    ///
    /// The interrupt is released even when suspending fails; the suspend
    /// status is returned.
    pub fn destroy(mut self) -> UhdaResult<()> {
        let status = self.suspend();
        drop(self.irq.take());
        status
    }

    /// Put the controller into reset
    ///
    /// Does nothing beyond masking the interrupt if it already is in reset.
    pub fn suspend(&self) -> UhdaResult<()> {
        self.set_irq(false);
        let state = self.state.lock();
        let space = self.shared.space;
        if !space.load(regs::GCTL).contains(GlobalControl::CRST) {
            return Ok(());
        }

        self.stop_engines(&state);

        space.update(regs::GCTL, |ctl| ctl.difference(GlobalControl::CRST));
        self.kernel.delay(RESET_ACK_US);
        poll_until(&*self.kernel, || {
            !space.load(regs::GCTL).contains(GlobalControl::CRST)
        })?;
        self.kernel.delay(RESET_SETTLE_US);
        Ok(())
    }

    /// Take the controller out of reset and enumerate its codecs again
    ///
    /// On failure the interrupt stays masked.
    pub fn resume(&self) -> UhdaResult<()> {
        enable_pci(&*self.pci)?;
        self.suspend()?;
        self.set_irq(true);
        let result = self.bring_up();
        if result.is_err() {
            self.set_irq(false);
        }
        result
    }

    fn bring_up(&self) -> UhdaResult<()> {
        let mut state = self.state.lock();
        let space = self.shared.space;

        space.update(regs::GCTL, |ctl| ctl | GlobalControl::CRST);
        self.kernel.delay(RESET_ACK_US);
        poll_until(&*self.kernel, || {
            space.load(regs::GCTL).contains(GlobalControl::CRST)
        })?;

        let gcap = space.load(regs::GCAP);
        if !gcap.contains(GlobalCapabilities::ADDR_64) {
            error!("uhda: controller lacks 64-bit addressing");
            return Err(UhdaError::Unsupported);
        }

        state.verbs.start()?;

        let positions = self.positions.phys_addr();
        space.store(regs::DPUBASE, (positions >> 32) as u32);
        space.store(
            regs::DPLBASE,
            DmaPositionBase::with_address(positions as u32) | DmaPositionBase::DPBE,
        );

        let in_count = gcap.input_streams().min(MAX_STREAMS);
        let out_count = gcap.output_streams().min(MAX_STREAMS);
        for (descriptor, stream) in self.shared.in_streams[..in_count]
            .iter()
            .chain(&self.shared.out_streams[..out_count])
            .enumerate()
        {
            stream.bind(
                space.subspace(regs::stream_descriptor(descriptor)),
                self.position_slot(descriptor)?,
                descriptor,
            );
        }
        self.shared.in_count.store(in_count, Ordering::Release);
        self.shared.out_count.store(out_count, Ordering::Release);
        info!(
            "uhda: {} input streams, {} output streams",
            in_count, out_count
        );

        self.kernel.delay(CODEC_SETTLE_US);

        let stream_bits = (1u32 << (in_count + out_count)) - 1;
        self.shared.gate.enable(stream_bits);

        let present = space.load(regs::STATESTS);
        state.codecs.clear();
        for address in 0..MAX_CODECS {
            if present & (1 << address) == 0 {
                continue;
            }
            let mut codec = Codec::new(address);
            match codec.init(&mut state.verbs, &*self.topology) {
                Ok(()) => {
                    state.codecs.try_reserve(1)?;
                    state.codecs.push(codec);
                }
                Err(UhdaError::Timeout) => {
                    warn!("uhda: codec {} timed out, ignoring it", address);
                }
                Err(e) => return Err(e),
            }
        }
        info!("uhda: {} codecs", state.codecs.len());
        Ok(())
    }

    /// Stop every DMA engine that reads or writes driver memory
    fn stop_engines(&self, state: &ControllerState) {
        let space = self.shared.space;
        state.verbs.stop();
        space.update(regs::DPLBASE, |base| base.difference(DmaPositionBase::DPBE));

        let gcap = space.load(regs::GCAP);
        let descriptors = (gcap.input_streams() + gcap.output_streams() + gcap.bidirectional_streams())
            .min(MAX_DESCRIPTORS);
        for descriptor in 0..descriptors {
            space
                .subspace(regs::stream_descriptor(descriptor))
                .update(stream::CTL0, |ctl| ctl.difference(StreamControl::RUN));
        }
    }

    /// Position word pair of stream descriptor `descriptor`
    fn position_slot(&self, descriptor: usize) -> UhdaResult<NonNull<u32>> {
        if descriptor >= MAX_DESCRIPTORS {
            return Err(UhdaError::Unsupported);
        }
        // SAFETY: the position page holds a word pair for each of the
        // MAX_DESCRIPTORS descriptors.
        let slot = unsafe { self.positions.as_ptr().cast::<u32>().add(descriptor * 2) };
        NonNull::new(slot).ok_or(UhdaError::Unsupported)
    }

    fn set_irq(&self, enable: bool) {
        if let Some(irq) = &self.irq {
            irq.enable(enable);
        }
    }

    /// Acquire the controller lock
    pub fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock()
    }

    /// Output streams reported by the hardware
    pub fn output_streams(&self) -> &[Stream] {
        self.shared.output_streams()
    }

    pub fn codec_count(&self) -> usize {
        self.state.lock().codecs.len()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // The rings and pages are freed below; no engine may still use them.
        if let Err(e) = self.suspend() {
            warn!("uhda: controller did not enter reset on drop: {}", e);
        }
        self.state.get_mut().codecs.clear();
        for stream in &self.shared.out_streams {
            stream.shutdown();
        }
    }
}

/// Enable memory decoding and bus mastering
fn enable_pci(pci: &dyn PciDevice) -> UhdaResult<()> {
    let command = pci.read_config(PCI_COMMAND, 2)?;
    pci.write_config(
        PCI_COMMAND,
        2,
        command | COMMAND_MEMORY_SPACE | COMMAND_BUS_MASTER,
    )
}
